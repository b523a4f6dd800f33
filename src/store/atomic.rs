use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

pub(crate) const TEMP_PREFIX: &str = ".playlog.tmp.";

/// Replaces `path` with `bytes` so readers see either the old or the new
/// contents, never a truncated file. On failure the previous file is left as is.
pub fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path `{}` has no parent directory", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let mut staged = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    staged.write_all(bytes)?;
    staged.flush()?;
    staged.as_file().sync_all()?;

    persist_overwrite(staged, path)?;
    sync_parent_dir(parent)
}

fn persist_overwrite(staged: NamedTempFile, to: &Path) -> io::Result<()> {
    match staged.persist(to) {
        Ok(_) => Ok(()),
        Err(err) if to.exists() => {
            // Some platforms refuse to rename over an existing file.
            fs::remove_file(to)?;
            err.file.persist(to).map(|_| ()).map_err(|err| err.error)
        }
        Err(err) => Err(err.error),
    }
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> io::Result<()> {
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> io::Result<()> {
    Ok(())
}
