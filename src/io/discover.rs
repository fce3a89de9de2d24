use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, ToolError};

/// An XML file found under the target directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct XmlFile {
    /// Path relative to the root, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
}

/// Lists `*.xml` files below `root`, skipping directories named in
/// `ignore_dirs`. Results are sorted by relative path.
pub fn xml_files(root: &Path, ignore_dirs: &[String]) -> Result<Vec<XmlFile>> {
    if !root.is_dir() {
        return Err(ToolError::MissingInput(root.to_path_buf()));
    }

    let ignored = |entry: &DirEntry| {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| ignore_dirs.iter().any(|ignored| ignored == name))
    };

    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !ignored(entry))
    {
        let entry = entry.map_err(|err| ToolError::Io(err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_xml = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("xml"));
        if !is_xml {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(XmlFile {
            relative,
            path: path.to_path_buf(),
        });
    }

    files.sort();
    debug!(root = %root.display(), count = files.len(), "discovered xml files");
    Ok(files)
}
