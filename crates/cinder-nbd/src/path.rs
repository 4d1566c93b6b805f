//! Mapping between NBD slots and device node paths.

use std::path::{Path, PathBuf};

use cinder_common::{CinderError, CinderResult};

/// Directory holding the device nodes.
pub const DEV_DIR: &str = "/dev";

const PREFIX: &str = "nbd";

/// Device node of `slot`, e.g. `/dev/nbd3`. Performs no I/O.
#[must_use]
pub fn device_path(slot: u32) -> PathBuf {
    device_path_in(Path::new(DEV_DIR), slot)
}

/// Device node of `slot` under `dev_dir`.
#[must_use]
pub fn device_path_in(dev_dir: &Path, slot: u32) -> PathBuf {
    dev_dir.join(format!("{PREFIX}{slot}"))
}

/// The slot a device node path refers to.
///
/// # Errors
///
/// Returns [`CinderError::InvalidDevicePath`] if the path does not name an
/// NBD device.
pub fn device_slot(path: &Path) -> CinderResult<u32> {
    let invalid = || CinderError::InvalidDevicePath {
        path: path.display().to_string(),
    };

    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
    let digits = name.strip_prefix(PREFIX).ok_or_else(invalid)?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse().map_err(|_| invalid())
}

/// sysfs name of a slot's block device, e.g. `nbd3`.
#[must_use]
pub fn block_name(slot: u32) -> String {
    format!("{PREFIX}{slot}")
}
