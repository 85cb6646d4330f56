//! Bundle spool files.
//!
//! Finished bundles are written to the OS temp directory and kept there
//! until the upload stage has recorded a successful upload, at which
//! point the spool file is deleted. The file name is derived from the
//! bundle's content digest, so concurrent runs never collide on live
//! bundles.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

/// Default spool location.
pub fn default_spool_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Write sequential buffers to `dir/<filename>` and fsync. Returns the
/// spool path.
pub fn write_spool_file(dir: &Path, filename: &str, parts: &[&[u8]]) -> Result<PathBuf, Error> {
    let path = dir.join(filename);
    let mut file = std::fs::File::create(&path)
        .map_err(|err| format_err!("unable to create spool file {:?} - {}", path, err))?;
    for part in parts {
        file.write_all(part)?;
    }
    file.sync_all()?;
    Ok(path)
}

/// Remove a spool file after its upload has been recorded.
pub fn remove_spool_file(path: &Path) -> Result<(), Error> {
    std::fs::remove_file(path)
        .map_err(|err| format_err!("unable to remove spool file {:?} - {}", path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            write_spool_file(dir.path(), "bundle_test", &[b"head", b"body", b"tail"]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"headbodytail");
        remove_spool_file(&path).unwrap();
        assert!(!path.exists());
        assert!(remove_spool_file(&path).is_err());
    }
}
