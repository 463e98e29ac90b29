use anyhow::{bail, Error};
use nix::unistd;
use nix::sys::stat;

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Atomically replace the contents of `path`.
///
/// Writes to a `mkstemp` sibling first and renames over the target, so a
/// partially written file is never exposed. Works across processes, threads
/// and tokio tasks.
pub fn file_set_contents<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<(), Error> {

    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or(
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP,
    );

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }

    if let Err(err) = file.sync_all() {
        let _ = unistd::unlink(tmp_path);
        bail!("fsync failed: {}", err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("Atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

/// Create `path` and any missing parents.
pub fn create_path<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();

    if let Err(err) = std::fs::create_dir_all(path) {
        bail!("unable to create {:?} - {}", path, err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn replace_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");

        file_set_contents(&path, b"first", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        file_set_contents(&path, b"second", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // no temp leftovers
        let extra: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() != "target")
            .collect();
        assert!(extra.is_empty());
    }

    #[test]
    fn create_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c");
        create_path(&deep).unwrap();
        assert!(deep.is_dir());
    }
}
