use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use log::info;
use vicreg_core::{ParamLayout, ParamSpec};

use crate::{Result, TrainErr};

const MAGIC: [u8; 4] = *b"VCKP";
const VERSION: u32 = 1;

/// Everything a resumed run needs: the epoch to continue from, the flat
/// parameter buffer and the optimizer's momentum side table.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub epoch: usize,
    pub params: Vec<f32>,
    pub momentum: Vec<Option<Vec<f32>>>,
}

/// Where a run starts after consulting the checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    Fresh,
    Resumed { epoch: usize },
}

/// Persists a snapshot, never disturbing the previously valid record: the
/// bytes go to a sibling temp file, reach the disk, and only then replace
/// the real path in one rename.
///
/// # Errors
/// Returns `TrainErr` when the snapshot disagrees with the layout or on
/// any I/O failure.
pub fn save(path: &Path, layout: &ParamLayout, snapshot: &Snapshot) -> Result<()> {
    if snapshot.params.len() != layout.total_len() {
        return Err(TrainErr::Checkpoint {
            detail: format!(
                "snapshot holds {} parameters, layout expects {}",
                snapshot.params.len(),
                layout.total_len()
            ),
        });
    }
    if snapshot.momentum.len() != layout.len() {
        return Err(TrainErr::Checkpoint {
            detail: format!(
                "snapshot holds {} momentum entries, layout expects {}",
                snapshot.momentum.len(),
                layout.len()
            ),
        });
    }

    let tmp = path.with_extension("ckpt.tmp");
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut w = BufWriter::new(file);

        w.write_all(&MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(snapshot.epoch as u64).to_le_bytes())?;

        w.write_all(&(layout.len() as u32).to_le_bytes())?;
        for spec in layout.specs() {
            write_name(&mut w, spec.name())?;
            write_shape(&mut w, spec.shape())?;
            w.write_all(bytemuck::cast_slice(&snapshot.params[spec.range()]))?;
        }

        for entry in &snapshot.momentum {
            match entry {
                Some(mu) => {
                    w.write_all(&[1])?;
                    w.write_all(bytemuck::cast_slice(mu))?;
                }
                None => w.write_all(&[0])?,
            }
        }

        w.flush()?;
        w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads the snapshot at `path`, if one exists, validating every tensor
/// name and shape against the live layout.
///
/// # Errors
/// Returns `TrainErr` when the record is malformed or does not match the
/// layout. A missing file is `Ok(None)`, not an error.
pub fn load(path: &Path, layout: &ParamLayout) -> Result<Option<Snapshot>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut r = Reader::new(&bytes);

    if r.take(4)? != MAGIC {
        return Err(malformed("bad magic"));
    }
    if r.read_u32()? != VERSION {
        return Err(malformed("unsupported version"));
    }

    let epoch = r.read_u64()? as usize;

    let count = r.read_u32()? as usize;
    if count != layout.len() {
        return Err(malformed(&format!(
            "record holds {count} tensors, layout expects {}",
            layout.len()
        )));
    }

    let mut params = vec![0.0; layout.total_len()];
    for spec in layout.specs() {
        let name = r.read_name()?;
        if name != spec.name() {
            return Err(malformed(&format!(
                "tensor {name:?} where {:?} was expected",
                spec.name()
            )));
        }

        let shape = r.read_shape()?;
        if shape != spec.shape() {
            return Err(malformed(&format!(
                "tensor {name:?} has shape {shape:?}, expected {:?}",
                spec.shape()
            )));
        }

        params[spec.range()].copy_from_slice(&r.read_f32s(spec.len())?);
    }

    let mut momentum = Vec::with_capacity(layout.len());
    for spec in layout.specs() {
        match r.read_u8()? {
            0 => momentum.push(None),
            1 => momentum.push(Some(r.read_f32s(spec.len())?)),
            other => return Err(malformed(&format!("bad momentum flag {other}"))),
        }
    }

    Ok(Some(Snapshot {
        epoch,
        params,
        momentum,
    }))
}

/// Writes a bare name→tensor table for a subset of the layout; used for
/// the final backbone export.
///
/// # Errors
/// Returns `TrainErr` on any I/O failure.
pub fn export_params(path: &Path, specs: &[ParamSpec], params: &[f32]) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    w.write_all(&MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&0u64.to_le_bytes())?;

    w.write_all(&(specs.len() as u32).to_le_bytes())?;
    for spec in specs {
        write_name(&mut w, spec.name())?;
        write_shape(&mut w, spec.shape())?;
        w.write_all(bytemuck::cast_slice(&params[spec.range()]))?;
    }

    w.flush()?;
    info!("exported {} tensors to {}", specs.len(), path.display());
    Ok(())
}

fn write_name<W: Write>(w: &mut W, name: &str) -> Result<()> {
    w.write_all(&(name.len() as u32).to_le_bytes())?;
    w.write_all(name.as_bytes())?;
    Ok(())
}

fn write_shape<W: Write>(w: &mut W, shape: &[usize]) -> Result<()> {
    w.write_all(&(shape.len() as u32).to_le_bytes())?;
    for &dim in shape {
        w.write_all(&(dim as u64).to_le_bytes())?;
    }
    Ok(())
}

fn malformed(detail: &str) -> TrainErr {
    TrainErr::Checkpoint {
        detail: detail.to_string(),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(malformed("truncated record"));
        }

        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_name(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("name is not utf-8"))
    }

    fn read_shape(&mut self) -> Result<Vec<usize>> {
        let ndim = self.read_u32()? as usize;
        (0..ndim).map(|_| Ok(self.read_u64()? as usize)).collect()
    }

    // Copies rather than casts: the record offset gives no alignment
    // guarantee for an in-place f32 view.
    fn read_f32s(&mut self, len: usize) -> Result<Vec<f32>> {
        let bytes = self.take(len * size_of::<f32>())?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use vicreg_core::ParamSpec;

    use super::*;

    fn layout() -> ParamLayout {
        ParamLayout::new(vec![
            ParamSpec::new("net.0.weight".to_string(), vec![2, 2], 0),
            ParamSpec::new("net.0.bias".to_string(), vec![2], 4),
        ])
        .unwrap()
    }

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = env::temp_dir().join("vicreg-ckpt-tests");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn round_trip_preserves_every_value() {
        let path = scratch("round_trip.ckpt");
        let layout = layout();

        let snapshot = Snapshot {
            epoch: 5,
            params: vec![0.25, -1.5, 3.0, 0.125, 0.5, -0.75],
            momentum: vec![Some(vec![0.1, 0.2, 0.3, 0.4]), None],
        };

        save(&path, &layout, &snapshot).unwrap();
        let loaded = load(&path, &layout).unwrap().unwrap();

        assert_eq!(loaded, snapshot);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_is_a_fresh_start() {
        let path = scratch("never_written.ckpt");
        assert!(load(&path, &layout()).unwrap().is_none());
    }

    #[test]
    fn abandoned_temp_file_does_not_disturb_the_record() {
        let path = scratch("stable.ckpt");
        let layout = layout();

        let snapshot = Snapshot {
            epoch: 3,
            params: vec![1.0; 6],
            momentum: vec![None, None],
        };
        save(&path, &layout, &snapshot).unwrap();

        // A crashed writer leaves garbage at the temp path.
        fs::write(path.with_extension("ckpt.tmp"), b"half a record").unwrap();

        let loaded = load(&path, &layout).unwrap().unwrap();
        assert_eq!(loaded.epoch, 3);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let path = scratch("mismatch.ckpt");
        let layout = layout();

        let snapshot = Snapshot {
            epoch: 1,
            params: vec![0.0; 6],
            momentum: vec![None, None],
        };
        save(&path, &layout, &snapshot).unwrap();

        let other = ParamLayout::new(vec![
            ParamSpec::new("net.0.weight".to_string(), vec![4], 0),
            ParamSpec::new("net.0.bias".to_string(), vec![2], 4),
        ])
        .unwrap();

        assert!(matches!(
            load(&path, &other),
            Err(TrainErr::Checkpoint { .. })
        ));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn truncated_record_is_rejected() {
        let path = scratch("truncated.ckpt");
        let layout = layout();

        let snapshot = Snapshot {
            epoch: 1,
            params: vec![0.0; 6],
            momentum: vec![None, None],
        };
        save(&path, &layout, &snapshot).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            load(&path, &layout),
            Err(TrainErr::Checkpoint { .. })
        ));
        fs::remove_file(&path).unwrap();
    }
}
