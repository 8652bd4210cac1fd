//! # Removable Media Detection
//!
//! Answers one question for the storage handler: is the USB drive that
//! backs a removable path actually there? Information comes from
//! `/sys/class/block` (USB partitions), `/proc/mounts` (live mounts),
//! `/etc/fstab` (static mounts) and the systemd automount units.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, trace};

/// How a USB partition is reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Not mounted and not configured for automount
    None,
    /// Currently listed in `/proc/mounts`
    Active,
    /// Mounted on demand by a systemd automount unit
    Automount,
}

/// One USB storage partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDrive {
    pub device_node: PathBuf,
    pub vendor: String,
    pub model: String,
    pub current_mount: Option<PathBuf>,
    pub fstab_mount: Option<PathBuf>,
    pub mount_kind: MountKind,
}

impl UsbDrive {
    /// `true` if `path` lives under this drive's live or fstab mount point
    pub fn covers(&self, path: &Path) -> bool {
        [&self.current_mount, &self.fstab_mount]
            .into_iter()
            .flatten()
            .any(|mount| path.starts_with(mount))
    }
}

/// Source of USB drive information
#[cfg_attr(test, mockall::automock)]
pub trait MountProbe: Send + Sync {
    /// Enumerate USB partitions with their mount state
    ///
    /// Failures while reading system tables yield fewer (or no) drives
    /// rather than an error. May block on file reads and `systemctl`; async
    /// callers run it with `spawn_blocking`.
    fn usb_drives(&self) -> Vec<UsbDrive>;
}

/// `MountProbe` backed by the live system tables
#[derive(Debug, Clone)]
pub struct SystemMountProbe {
    sys_block: PathBuf,
    dev_disk: PathBuf,
    proc_mounts: PathBuf,
    fstab: PathBuf,
    systemctl: Option<String>,
}

impl Default for SystemMountProbe {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/class/block"),
            dev_disk: PathBuf::from("/dev/disk"),
            proc_mounts: PathBuf::from("/proc/mounts"),
            fstab: PathBuf::from("/etc/fstab"),
            systemctl: Some("systemctl".to_string()),
        }
    }
}

impl SystemMountProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read system tables from an alternate root
    ///
    /// Used to run the probe against a fixture tree; systemd is not queried.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            sys_block: root.join("sys/class/block"),
            dev_disk: root.join("dev/disk"),
            proc_mounts: root.join("proc/mounts"),
            fstab: root.join("etc/fstab"),
            systemctl: None,
        }
    }

    /// USB partitions found under `/sys/class/block`
    fn usb_partitions(&self) -> Vec<(PathBuf, String, String)> {
        let entries = match fs::read_dir(&self.sys_block) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", self.sys_block.display(), e);
                return Vec::new();
            }
        };

        let mut partitions = Vec::new();
        for entry in entries.flatten() {
            let sys_path = entry.path();
            if !sys_path.join("partition").exists() {
                continue;
            }
            let Ok(resolved) = fs::canonicalize(&sys_path) else {
                continue;
            };
            if !resolved.to_string_lossy().contains("/usb") {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let disk = resolved.parent().unwrap_or(&resolved).join("device");
            let vendor = read_attribute(&disk.join("vendor"));
            let model = read_attribute(&disk.join("model"));
            partitions.push((PathBuf::from("/dev").join(name), vendor, model));
        }
        partitions.sort();
        partitions
    }

    /// `UUID=`, `LABEL=` and `PARTUUID=` spellings of a device node
    fn fstab_aliases(&self, sys_name: &str) -> Vec<String> {
        let mut aliases = Vec::new();
        for (dir, prefix) in [("by-uuid", "UUID="), ("by-label", "LABEL="), ("by-partuuid", "PARTUUID=")] {
            let Ok(entries) = fs::read_dir(self.dev_disk.join(dir)) else {
                continue;
            };
            for entry in entries.flatten() {
                let target = fs::read_link(entry.path()).ok();
                let matches = target
                    .as_deref()
                    .and_then(Path::file_name)
                    .is_some_and(|name| name == sys_name);
                if matches {
                    aliases.push(format!("{}{}", prefix, entry.file_name().to_string_lossy()));
                }
            }
        }
        aliases
    }

    fn automount_units(&self) -> Option<String> {
        let systemctl = self.systemctl.as_ref()?;
        let output = Command::new(systemctl)
            .args(["list-units", "--type=automount", "--all", "--no-legend", "--plain"])
            .output()
            .ok()?;

        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            None
        }
    }
}

impl MountProbe for SystemMountProbe {
    fn usb_drives(&self) -> Vec<UsbDrive> {
        let partitions = self.usb_partitions();
        if partitions.is_empty() {
            return Vec::new();
        }

        let mounts = fs::read_to_string(&self.proc_mounts).unwrap_or_default();
        let fstab = fs::read_to_string(&self.fstab).unwrap_or_default();
        let units = self.automount_units().unwrap_or_default();

        partitions
            .into_iter()
            .map(|(device_node, vendor, model)| {
                let sys_name = device_node
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut names = vec![device_node.to_string_lossy().into_owned()];
                names.extend(self.fstab_aliases(&sys_name));

                let current_mount = find_current_mount(&mounts, &names[0]);
                let fstab_entry = find_fstab_entry(&fstab, &names);

                let mut mount_kind = if current_mount.is_some() {
                    MountKind::Active
                } else {
                    MountKind::None
                };
                let automount_unit = [&current_mount, &fstab_entry.as_ref().map(|(p, _)| p.clone())]
                    .into_iter()
                    .flatten()
                    .any(|mount| automount_listed(&units, mount));
                if automount_unit || fstab_entry.as_ref().is_some_and(|(_, auto)| *auto) {
                    mount_kind = MountKind::Automount;
                }

                let drive = UsbDrive {
                    device_node,
                    vendor,
                    model,
                    current_mount,
                    fstab_mount: fstab_entry.map(|(path, _)| path),
                    mount_kind,
                };
                trace!("USB drive {:?}", drive);
                drive
            })
            .collect()
    }
}

fn read_attribute(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|value| value.trim().to_string())
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Decode the octal escapes used for whitespace in mount tables
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount point of `device` in `/proc/mounts` contents (last entry wins)
pub fn find_current_mount(mounts: &str, device: &str) -> Option<PathBuf> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(source), Some(target)) if source == device => {
                    Some(PathBuf::from(unescape_mount_field(target)))
                }
                _ => None,
            }
        })
        .last()
}

/// Mount point of any of `names` in `/etc/fstab` contents, and whether the
/// entry carries `x-systemd.automount`
pub fn find_fstab_entry(fstab: &str, names: &[String]) -> Option<(PathBuf, bool)> {
    fstab
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 || !names.iter().any(|name| name == fields[0]) {
                return None;
            }
            let automount = fields
                .get(3)
                .is_some_and(|options| options.split(',').any(|o| o == "x-systemd.automount"));
            Some((PathBuf::from(unescape_mount_field(fields[1])), automount))
        })
        .last()
}

/// systemd unit name stem for a mount path (`/mnt/usb-a` -> `mnt-usb\x2da`)
pub fn systemd_unit_stem(path: &Path) -> String {
    let trimmed = path.to_string_lossy();
    let trimmed = trimmed.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }
    trimmed
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| part.replace('-', "\\x2d"))
        .collect::<Vec<_>>()
        .join("-")
}

/// `true` if `systemctl list-units --type=automount` output lists a unit for `mount`
pub fn automount_listed(units: &str, mount: &Path) -> bool {
    let unit = format!("{}.automount", systemd_unit_stem(mount));
    units
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == unit)
}
