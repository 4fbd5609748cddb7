//! Pre-flight free-space check for the directories the pipeline writes
//! into, plus the I/O error mapping that turns an ENOSPC hit mid-write into
//! the same taxonomy member rather than a generic `Io` error.

use crate::error::{CoreError, Result};
use std::path::Path;

/// Headroom kept on top of the estimated requirement, since encodes and
/// intermediate chunk files rarely land exactly on the estimate.
const SAFETY_MARGIN_BYTES: u64 = 64 * 1024 * 1024;

#[cfg(unix)]
const ENOSPC: i32 = 28;
#[cfg(not(unix))]
const ENOSPC: i32 = 112;

/// Checks that `target_dir`'s filesystem has at least `required_bytes` plus
/// a safety margin free, before the caller starts writing into it.
pub fn ensure_space_available(target_dir: &Path, required_bytes: u64) -> Result<()> {
    let available = fs2::available_space(target_dir).map_err(CoreError::Io)?;
    let required = required_bytes.saturating_add(SAFETY_MARGIN_BYTES);
    if available < required {
        return Err(CoreError::InsufficientDiskSpace(format!(
            "{} available on {}, need at least {}",
            format_bytes(available),
            target_dir.display(),
            format_bytes(required)
        )));
    }
    Ok(())
}

/// Maps an `io::Error` encountered mid-write into the error taxonomy,
/// recognizing ENOSPC (the kernel's out-of-space errno) as disk exhaustion
/// rather than a generic I/O failure.
pub fn map_io_error(e: std::io::Error) -> CoreError {
    if e.raw_os_error() == Some(ENOSPC) {
        return CoreError::InsufficientDiskSpace(e.to_string());
    }
    CoreError::Io(e)
}

fn format_bytes(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    format!("{:.1} MiB", bytes as f64 / MB as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_space_available_passes_for_tiny_requirement() {
        let dir = std::env::temp_dir();
        assert!(ensure_space_available(&dir, 1).is_ok());
    }

    #[test]
    fn ensure_space_available_rejects_absurd_requirement() {
        let dir = std::env::temp_dir();
        let result = ensure_space_available(&dir, u64::MAX / 2);
        assert!(matches!(result, Err(CoreError::InsufficientDiskSpace(_))));
    }

    #[test]
    fn map_io_error_recognizes_enospc() {
        let err = std::io::Error::from_raw_os_error(ENOSPC);
        assert!(matches!(map_io_error(err), CoreError::InsufficientDiskSpace(_)));
    }

    #[test]
    fn map_io_error_passes_through_other_errors() {
        let err = std::io::Error::from_raw_os_error(2);
        assert!(matches!(map_io_error(err), CoreError::Io(_)));
    }
}
