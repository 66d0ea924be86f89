//! Minimal helpers for the Linux sysfs device-class interface
//! (`/sys/class/pwm`, `/sys/class/gpio`).

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use webio_types::WebIoError;

/// Default root of the sysfs device classes.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class";

/// How long to wait for the kernel to materialise an exported node.
const EXPORT_SETTLE: Duration = Duration::from_millis(100);

/// Write `value` to the sysfs attribute at `path`.
pub(crate) fn write(path: &Path, value: &str) -> Result<(), WebIoError> {
    debug!(path = %path.display(), value, "sysfs write");
    fs::write(path, value).map_err(|e| {
        WebIoError::hardware(
            path.display().to_string(),
            format!("failed to write '{value}': {e}"),
        )
    })
}

/// Read the trimmed contents of the sysfs attribute at `path`.
pub(crate) fn read(path: &Path) -> Result<String, WebIoError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| WebIoError::hardware(path.display().to_string(), format!("failed to read: {e}")))
}

/// Ensure `node` exists, writing `index` to `control_dir/export` when it does
/// not and waiting briefly for the kernel to create it.
pub(crate) fn export(control_dir: &Path, index: u32, node: &Path) -> Result<(), WebIoError> {
    if node.exists() {
        return Ok(());
    }
    write(&control_dir.join("export"), &index.to_string())?;
    thread::sleep(EXPORT_SETTLE);
    if !node.exists() {
        return Err(WebIoError::hardware(
            node.display().to_string(),
            "export did not create the device node",
        ));
    }
    Ok(())
}

/// Release `index` from `control_dir`.  Failures are logged, never returned,
/// because this runs from `Drop`.
pub(crate) fn unexport(control_dir: &Path, index: u32) {
    let path: PathBuf = control_dir.join("unexport");
    if let Err(e) = write(&path, &index.to_string()) {
        warn!(error = %e, "sysfs unexport failed");
    }
}
