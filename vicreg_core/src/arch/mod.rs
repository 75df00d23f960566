mod batch_norm;
mod dense;
mod layer;
mod relu;
mod sequential;

pub use batch_norm::BatchNorm;
pub use dense::Dense;
pub use layer::Layer;
pub use relu::Relu;
pub use sequential::Sequential;
