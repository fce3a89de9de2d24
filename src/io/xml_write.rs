use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Result, ToolError};

/// Replaces `path` with `contents` through a temporary file in the same
/// directory, so readers never observe a partially written document.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let wrap = |source: std::io::Error| ToolError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(wrap)?;
    tmp.write_all(contents.as_bytes()).map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;
    tmp.persist(path).map_err(|err| wrap(err.error))?;
    Ok(())
}
