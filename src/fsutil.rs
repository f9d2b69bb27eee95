/// Small filesystem helpers shared by every other component
use crate::types::{RootboxError, Result};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

/// Create `path` and any missing parents with mode 0755
pub fn mkdirp(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| {
            RootboxError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to create directory {}: {}", path.display(), e),
            ))
        })
}

/// Write a small kernel control file such as `/proc/self/uid_map`.
///
/// The file is opened write-only without create or truncate, and the whole
/// content goes out in a single write, which is what procfs map files expect.
pub fn write_control_file(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        RootboxError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open {}: {}", path.display(), e),
        ))
    })?;
    file.write_all(content.as_bytes()).map_err(|e| {
        RootboxError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to write {}: {}", path.display(), e),
        ))
    })?;
    Ok(())
}

/// Remove a directory tree without following symlinks.
///
/// Directories we cannot list (overlayfs leaves `work/work` at mode 000) are
/// made accessible first. A path that is already gone counts as removed.
pub fn remove_dir_recursive(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => return Ok(fs::remove_file(path)?),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
            fs::read_dir(path)?
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let child = entry.path();
        if entry.file_type()?.is_dir() {
            remove_dir_recursive(&child)?;
        } else {
            fs::remove_file(&child)?;
        }
    }

    match fs::remove_dir(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
