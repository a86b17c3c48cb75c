//! Crash marker and safe-mode marker files, plus the advisory directory
//! lock that keeps the file manager's retention pass from archiving or
//! deleting segments out from under an in-progress recovery scan.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::WalError;

/// Write (or overwrite) the crash marker: `started:<unix_seconds>\n`. Its
/// presence is the signal; the timestamp inside is advisory only.
pub fn write_crash_marker(path: &Path) -> Result<(), WalError> {
    let contents = format!("started:{}\n", chrono::Utc::now().timestamp());
    std::fs::write(path, contents).map_err(|e| WalError::io(path.to_path_buf(), e))
}

pub fn crash_marker_present(path: &Path) -> bool {
    path.exists()
}

/// Delete the crash marker on clean shutdown. A missing marker is not an
/// error — shutdown is idempotent.
pub fn clear_crash_marker(path: &Path) -> Result<(), WalError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WalError::io(path.to_path_buf(), e)),
    }
}

/// Parsed contents of `safe_mode.lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeModeMarker {
    pub reason: String,
    pub timestamp: i64,
    pub errors: usize,
}

impl SafeModeMarker {
    pub fn new(reason: impl Into<String>, errors: usize) -> Self {
        Self {
            reason: reason.into(),
            timestamp: chrono::Utc::now().timestamp(),
            errors,
        }
    }

    fn render(&self) -> String {
        format!(
            "reason:{}\ntimestamp:{}\nerrors:{}\n",
            self.reason, self.timestamp, self.errors
        )
    }

    fn parse(text: &str) -> Option<Self> {
        let mut reason = None;
        let mut timestamp = None;
        let mut errors = None;
        for line in text.lines() {
            let (key, value) = line.split_once(':')?;
            match key {
                "reason" => reason = Some(value.to_string()),
                "timestamp" => timestamp = value.parse().ok(),
                "errors" => errors = value.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            reason: reason?,
            timestamp: timestamp?,
            errors: errors?,
        })
    }
}

pub fn write_safe_mode_marker(path: &Path, marker: &SafeModeMarker) -> Result<(), WalError> {
    std::fs::write(path, marker.render()).map_err(|e| WalError::io(path.to_path_buf(), e))
}

pub fn safe_mode_marker_present(path: &Path) -> bool {
    path.exists()
}

pub fn read_safe_mode_marker(path: &Path) -> Result<Option<SafeModeMarker>, WalError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(SafeModeMarker::parse(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WalError::io(path.to_path_buf(), e)),
    }
}

/// Clear the safe-mode marker. Only an operator is expected to call this,
/// after confirming the underlying corruption has been addressed.
pub fn clear_safe_mode_marker(path: &Path) -> Result<(), WalError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WalError::io(path.to_path_buf(), e)),
    }
}

/// Advisory lock held for the duration of a recovery scan, so the file
/// manager's retention pass can detect an in-progress recovery and skip
/// archiving or deleting segments until the lock is released.
pub struct RecoveryDirLock {
    path: PathBuf,
}

impl RecoveryDirLock {
    pub fn acquire(path: PathBuf) -> Result<Self, WalError> {
        let mut file =
            std::fs::File::create(&path).map_err(|e| WalError::io(path.clone(), e))?;
        write!(file, "locked:{}\n", chrono::Utc::now().timestamp())
            .map_err(|e| WalError::io(path.clone(), e))?;
        Ok(Self { path })
    }

    pub fn is_held(path: &Path) -> bool {
        path.exists()
    }
}

impl Drop for RecoveryDirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_marker_round_trips_presence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash_detection.lock");
        assert!(!crash_marker_present(&path));
        write_crash_marker(&path).unwrap();
        assert!(crash_marker_present(&path));
        clear_crash_marker(&path).unwrap();
        assert!(!crash_marker_present(&path));
    }

    #[test]
    fn clearing_an_absent_crash_marker_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash_detection.lock");
        assert!(clear_crash_marker(&path).is_ok());
    }

    #[test]
    fn safe_mode_marker_round_trips_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safe_mode.lock");
        let marker = SafeModeMarker::new("checksum mismatch at lsn 3", 1);
        write_safe_mode_marker(&path, &marker).unwrap();

        let read_back = read_safe_mode_marker(&path).unwrap().unwrap();
        assert_eq!(read_back.reason, marker.reason);
        assert_eq!(read_back.errors, 1);
    }

    #[test]
    fn recovery_dir_lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.lock");
        {
            let _lock = RecoveryDirLock::acquire(path.clone()).unwrap();
            assert!(RecoveryDirLock::is_held(&path));
        }
        assert!(!RecoveryDirLock::is_held(&path));
    }
}
