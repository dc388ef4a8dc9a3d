//! Centralized path configuration for QVM.
//!
//! The daemon and CLI resolve every on-disk location through this module.

use std::path::PathBuf;

/// Default directory holding VM disk images.
pub const DEFAULT_IMAGES_DIR: &str = "/var/lib/libvirt/images";

/// Extension appended to a VM name to form its disk image file name.
pub const DISK_IMAGE_EXTENSION: &str = "qcow2";

/// Get the QVM data directory.
///
/// Resolution order:
/// 1. `QVM_DATA_DIR` environment variable
/// 2. `/var/lib/qvm` if it exists (system install)
/// 3. `~/.qvm` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("QVM_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/qvm");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".qvm")).unwrap_or(system_dir)
}

/// Get the QVM configuration directory.
///
/// `QVM_CONFIG_DIR` wins, then the platform config dir, then the data dir.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("QVM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("qvm")).unwrap_or_else(data_dir)
}

/// Get the path of the persisted snapshot schedule.
pub fn schedule_store_path() -> PathBuf {
    data_dir().join("schedules.json")
}
