use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{PipelineError, Result};

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn as_write_error(path: &Path, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Write { .. } => err,
        other => PipelineError::write(path, other),
    }
}

/// Stage `fill` into a temp file next to `path`. The temp file is removed if anything
/// fails before the caller persists it.
fn stage<F>(path: &Path, fill: F) -> Result<tempfile::NamedTempFile>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| PipelineError::write(path, e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)
        .map_err(|e| PipelineError::write(path, e))?;

    fill(tmp.as_file_mut()).map_err(|e| as_write_error(path, e))?;
    tmp.as_file_mut().flush().map_err(|e| PipelineError::write(path, e))?;
    tmp.as_file().sync_all().map_err(|e| PipelineError::write(path, e))?;
    Ok(tmp)
}

/// Replace `path` with the bytes produced by `fill`, or leave it untouched on failure.
pub fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let tmp = stage(path, fill)?;
    tmp.persist(path)
        .map_err(|e| PipelineError::write(path, e.error))?;
    Ok(())
}

/// Like [`write_atomic`] but refuses to replace an existing file.
pub fn write_atomic_new<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let tmp = stage(path, fill)?;
    tmp.persist_noclobber(path)
        .map_err(|e| PipelineError::write(path, e.error))?;
    Ok(())
}
