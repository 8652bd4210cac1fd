//! Storage target validation

use std::path::{Path, PathBuf};

use super::mount::UsbDrive;
use crate::ipc;

/// Role a target plays for a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Data,
    Backup,
    Socket,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Data => write!(f, "data"),
            TargetKind::Backup => write!(f, "backup"),
            TargetKind::Socket => write!(f, "socket"),
        }
    }
}

/// Result of one validation pass over a candidate location
///
/// For a socket target `mounted` means a listener answered the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub kind: TargetKind,
    pub path: PathBuf,
    pub mounted: bool,
    pub exists: bool,
}

impl StorageTarget {
    /// Target that has not been validated yet
    pub fn unvalidated(kind: TargetKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            mounted: false,
            exists: false,
        }
    }

    /// `true` if data can be written here now
    pub fn is_writable(&self) -> bool {
        self.mounted && self.exists
    }
}

/// `true` if `path` sits under one of the removable-media prefixes
pub fn is_removable(path: &Path, removable_prefixes: &[PathBuf]) -> bool {
    removable_prefixes.iter().any(|prefix| path.starts_with(prefix))
}

/// Validate a directory target
///
/// A path outside the removable prefixes is treated as always mounted. A
/// removable path is mounted only while a USB drive covers it.
pub fn validate_directory(
    kind: TargetKind,
    path: &Path,
    removable_prefixes: &[PathBuf],
    drives: &[UsbDrive],
) -> StorageTarget {
    let mounted = if is_removable(path, removable_prefixes) {
        drives.iter().any(|drive| drive.covers(path))
    } else {
        true
    };

    let exists = mounted
        && std::fs::metadata(path)
            .map(|meta| meta.is_dir() && !meta.permissions().readonly())
            .unwrap_or(false);

    StorageTarget {
        kind,
        path: path.to_path_buf(),
        mounted,
        exists,
    }
}

/// Validate a socket target by probing for a listener
pub async fn validate_socket(path: &Path) -> StorageTarget {
    let reachable = ipc::probe(path).await;
    StorageTarget {
        kind: TargetKind::Socket,
        path: path.to_path_buf(),
        mounted: reachable,
        exists: reachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mount::MountKind;
    use tempfile::TempDir;

    fn usb_at(mount: &str) -> UsbDrive {
        UsbDrive {
            device_node: PathBuf::from("/dev/sda1"),
            vendor: "Kingston".to_string(),
            model: "DataTraveler".to_string(),
            current_mount: Some(PathBuf::from(mount)),
            fstab_mount: None,
            mount_kind: MountKind::Active,
        }
    }

    #[test]
    fn test_fixed_path_always_mounted() {
        let dir = TempDir::new().unwrap();
        let target = validate_directory(TargetKind::Data, dir.path(), &[PathBuf::from("/mnt")], &[]);
        assert!(target.mounted);
        assert!(target.exists);
        assert!(target.is_writable());
    }

    #[test]
    fn test_fixed_path_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not-yet");
        let target = validate_directory(TargetKind::Data, &missing, &[], &[]);
        assert!(target.mounted);
        assert!(!target.exists);
    }

    #[test]
    fn test_removable_path_requires_drive() {
        let dir = TempDir::new().unwrap();
        let prefixes = vec![dir.path().to_path_buf()];
        let backup = dir.path().join("usb/gps");
        std::fs::create_dir_all(&backup).unwrap();

        let unplugged = validate_directory(TargetKind::Backup, &backup, &prefixes, &[]);
        assert!(!unplugged.mounted);
        assert!(!unplugged.exists);

        let drive = usb_at(&dir.path().join("usb").to_string_lossy());
        let plugged = validate_directory(TargetKind::Backup, &backup, &prefixes, &[drive]);
        assert!(plugged.mounted);
        assert!(plugged.exists);
    }

    #[test]
    fn test_file_is_not_a_directory_target() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let target = validate_directory(TargetKind::Data, &file, &[], &[]);
        assert!(!target.exists);
    }

    #[test]
    fn test_is_removable() {
        let prefixes = vec![PathBuf::from("/mnt")];
        assert!(is_removable(Path::new("/mnt/usb/gps"), &prefixes));
        assert!(!is_removable(Path::new("/mntdata/gps"), &prefixes));
        assert!(!is_removable(Path::new("/home/pi/data"), &prefixes));
    }

    #[tokio::test]
    async fn test_socket_without_listener() {
        let dir = TempDir::new().unwrap();
        let target = validate_socket(&dir.path().join("collator.sock")).await;
        assert_eq!(target.kind, TargetKind::Socket);
        assert!(!target.is_writable());
    }

    #[tokio::test]
    async fn test_socket_with_listener() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("collator.sock");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        assert!(validate_socket(&path).await.is_writable());
    }
}
