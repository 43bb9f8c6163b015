//! Write-path helpers shared by the store, the activity log and everything
//! that puts certificate material on disk.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};

/// Mode for private keys and other secrets.
pub const SECRET_MODE: u32 = 0o600;
/// Mode for certificates and public material.
pub const PUBLIC_MODE: u32 = 0o644;

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("file"));
    name.push(suffix);
    path.with_file_name(name)
}

/// Write `content` to `path` so that readers only ever see the old or the new
/// file: write `<path>.new`, fsync, rename over `path`, fsync the directory.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> EngineResult<()> {
    write_atomic_via(path, ".new", content, mode)
}

/// Like [`write_atomic`] with a caller-chosen temporary suffix.
pub fn write_atomic_via(path: &Path, suffix: &str, content: &[u8], mode: u32) -> EngineResult<()> {
    let temp_path = sibling(path, suffix);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&temp_path)?;
        file.write_all(content)?;
        // umask may have narrowed the mode on create
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        file.sync_all()
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(EngineError::io(&temp_path, e));
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(EngineError::io(path, e));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Copy `path` to `<path>.bak.<unix-ts>` if it exists.
pub fn backup(path: &Path, now: DateTime<Utc>) -> EngineResult<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let target = sibling(path, &format!(".bak.{}", now.timestamp()));
    fs::copy(path, &target).map_err(|e| EngineError::io(&target, e))?;
    Ok(Some(target))
}

/// Read a file, treating a missing file as `None`.
pub fn read_optional(path: &Path) -> EngineResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

pub fn remove_if_exists(path: &Path) -> EngineResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

/// File-name friendly version of a common name: `*.Example.com` becomes
/// `wildcard.example.com`.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let name = name.trim();
    let name = name
        .strip_prefix("*.")
        .map(|rest| format!("wildcard.{rest}"))
        .unwrap_or_else(|| name.to_string());

    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_') {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }

    let out = out.trim_matches(|c| c == '-' || c == '.').to_string();
    if out.is_empty() {
        "certificate".to_string()
    } else {
        out
    }
}

/// A base name in `dir` under which none of `<stem>.<ext>` exist yet. Tries
/// `stem`, then `stem-2`, `stem-3`, ...
pub fn unique_stem(dir: &Path, stem: &str, extensions: &[&str]) -> String {
    let taken = |candidate: &str| {
        extensions
            .iter()
            .any(|ext| dir.join(format!("{candidate}.{ext}")).exists())
    };

    if !taken(stem) {
        return stem.to_string();
    }

    (2..)
        .map(|n| format!("{stem}-{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/leaf.key");

        write_atomic(&path, b"one", SECRET_MODE).unwrap();
        write_atomic(&path, b"two", SECRET_MODE).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(!sibling(&path, ".new").exists());
    }

    #[test]
    fn test_interrupted_write_leaves_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert-config.json");
        write_atomic_via(&path, ".tmp", br#"{"ok":true}"#, SECRET_MODE).unwrap();

        // A crash between "write tmp" and "rename" leaves only a stray tmp.
        fs::write(sibling(&path, ".tmp"), b"{ half writ").unwrap();

        let original: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(original["ok"], true);
    }

    #[test]
    fn test_backup_uses_timestamp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.crt");
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        assert_eq!(backup(&path, now).unwrap(), None);

        fs::write(&path, b"cert").unwrap();
        let target = backup(&path, now).unwrap().unwrap();
        assert_eq!(target, dir.path().join("a.crt.bak.1700000000"));
        assert_eq!(fs::read(target).unwrap(), b"cert");
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("api.example.com"), "api.example.com");
        assert_eq!(slug("Test Root"), "test-root");
        assert_eq!(slug("*.Example.com"), "wildcard.example.com");
        assert_eq!(slug("  ///  "), "certificate");
    }

    #[test]
    fn test_unique_stem_skips_taken_names() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_stem(dir.path(), "web", &["crt", "key"]), "web");

        fs::write(dir.path().join("web.key"), b"").unwrap();
        assert_eq!(unique_stem(dir.path(), "web", &["crt", "key"]), "web-2");

        fs::write(dir.path().join("web-2.crt"), b"").unwrap();
        assert_eq!(unique_stem(dir.path(), "web", &["crt", "key"]), "web-3");
    }
}
