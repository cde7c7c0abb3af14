//! Owner-only filesystem access for wallet state.
//!
//! Every persisted wallet file is written through this module: directories
//! are created 0700, files land 0600, and writes are atomic (temp file in
//! the same directory, fsync, rename). Permissions are set explicitly rather
//! than relying on the process umask.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

pub const DIR_MODE: u32 = 0o700;
pub const FILE_MODE: u32 = 0o600;

/// Create `dir` (and parents) with owner-only permissions.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(dir)?.permissions();
        perms.set_mode(DIR_MODE);
        fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

/// Atomically replace `path` with `contents`, 0600.
///
/// The temp file is created in the target's directory so the final rename
/// never crosses a filesystem boundary.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    ensure_dir(dir)?;

    let tmp = tmp_path(path);
    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(FILE_MODE);
        let mut file = opts.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(dir);

    // rename keeps the temp file's mode, but an existing target may predate
    // the permission discipline
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)?.permissions();
        if perms.mode() & 0o777 != FILE_MODE {
            perms.set_mode(FILE_MODE);
            fs::set_permissions(path, perms)?;
        }
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    write_atomic(path, &json)
}

/// Read and deserialize a JSON state file. `Ok(None)` when absent.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Append one line to a log file, creating it 0600 if needed. The line must
/// not contain a newline; one is added.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }
    let mut opts = OpenOptions::new();
    opts.append(true).create(true);
    #[cfg(unix)]
    opts.mode(FILE_MODE);
    let mut file = opts.open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()?;
    Ok(())
}

/// Verify a directory is owner-only; used by preflight.
pub fn check_dir_permissions(dir: &Path) -> std::io::Result<bool> {
    #[cfg(unix)]
    {
        let mode = fs::metadata(dir)?.permissions().mode() & 0o777;
        Ok(mode & 0o077 == 0)
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(true)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Fsync the directory itself so the rename is durable. Best effort; some
/// filesystems refuse to open directories for writing.
pub fn sync_dir(dir: &Path) {
    if let Ok(f) = File::open(dir) {
        let _ = f.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_sets_owner_only_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("cache.json");
        write_atomic(&path, b"{}").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{}");
        #[cfg(unix)]
        {
            let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            let dir_mode = fs::metadata(path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(file_mode, FILE_MODE);
            assert_eq!(dir_mode, DIR_MODE);
        }
    }

    #[test]
    fn write_atomic_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        // no temp file left behind
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn read_json_absent_is_none() {
        let dir = tempdir().unwrap();
        let got: Option<serde_json::Value> = read_json(&dir.path().join("missing.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn append_line_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        append_line(&path, "{\"a\":1}").unwrap();
        append_line(&path, "{\"a\":2}").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
