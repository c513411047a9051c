use std::{
    io::Write,
    path::Path,
};

use anyhow::Context;

/// Atomically replaces `path` with `contents`: the bytes are written to a
/// temporary file in the same directory, synced, and renamed into place so
/// readers never observe a partially written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::write_atomic;

    #[test]
    fn test_write_atomic_replaces_contents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("client.keys");
        write_atomic(&path, b"001 alpha any abcd\n")?;
        assert_eq!(std::fs::read_to_string(&path)?, "001 alpha any abcd\n");
        write_atomic(&path, b"002 beta any efgh\n")?;
        assert_eq!(std::fs::read_to_string(&path)?, "002 beta any efgh\n");
        Ok(())
    }

    #[test]
    fn test_write_atomic_fails_on_bad_target() {
        let dir = tempfile::tempdir().unwrap();
        // Target is a directory; the rename must fail and report it.
        assert!(write_atomic(dir.path(), b"x").is_err());
    }
}
