//! Pre-flight resource checks.
//!
//! Before a run starts the destination must be writable and the volume must
//! have room for the estimated data times a safety factor. A failed check
//! blocks the run before any hardware moves.

use mda_core::error::{MdaError, MdaResult};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, instrument};

/// Source of free-space figures.
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to the current user on the volume holding `path`.
    fn available_bytes(&self, path: &Path) -> MdaResult<u64>;
}

/// Free space as reported by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskProbe;

impl DiskSpaceProbe for SystemDiskProbe {
    fn available_bytes(&self, path: &Path) -> MdaResult<u64> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                MdaError::Storage(format!("no mounted volume contains {}", path.display()))
            })
    }
}

/// Reports a fixed amount of free space.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskProbe(pub u64);

impl DiskSpaceProbe for FixedDiskProbe {
    fn available_bytes(&self, _path: &Path) -> MdaResult<u64> {
        Ok(self.0)
    }
}

/// Outcome of a passed pre-flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    /// Directory that was checked.
    pub destination: PathBuf,
    /// Bytes required including the safety factor.
    pub required_bytes: u64,
    /// Bytes available.
    pub available_bytes: u64,
}

/// Create `dir` if needed and prove it is writable by creating a
/// temporary file in it.
pub fn check_writable(dir: &Path) -> MdaResult<()> {
    let not_writable = |e: std::io::Error| MdaError::DestinationNotWritable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    };
    std::fs::create_dir_all(dir).map_err(not_writable)?;
    tempfile::NamedTempFile::new_in(dir).map_err(not_writable)?;
    Ok(())
}

/// `estimated_bytes * factor`, rounded up.
pub fn required_bytes(estimated_bytes: u64, factor: f64) -> MdaResult<u64> {
    let required = (estimated_bytes as f64 * factor).ceil();
    if !required.is_finite() || required >= u64::MAX as f64 {
        return Err(MdaError::SizeOverflow {
            context: "required disk space",
        });
    }
    Ok(required as u64)
}

/// Run every check against `dir`.
#[instrument(skip(probe), err)]
pub fn run_preflight(
    dir: &Path,
    estimated_bytes: u64,
    factor: f64,
    probe: &dyn DiskSpaceProbe,
) -> MdaResult<PreflightReport> {
    check_writable(dir)?;
    let required_bytes = required_bytes(estimated_bytes, factor)?;
    let available_bytes = probe.available_bytes(dir)?;
    debug!(required_bytes, available_bytes, "disk space");
    if available_bytes < required_bytes {
        return Err(MdaError::InsufficientDiskSpace {
            required_bytes,
            available_bytes,
        });
    }
    Ok(PreflightReport {
        destination: dir.to_path_buf(),
        required_bytes,
        available_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_bytes_applies_factor() {
        assert_eq!(required_bytes(1000, 1.25).unwrap(), 1250);
        assert_eq!(required_bytes(3, 1.25).unwrap(), 4);
        assert!(required_bytes(u64::MAX, 2.0).is_err());
    }

    #[test]
    fn test_disk_gate() {
        let dir = tempfile::tempdir().unwrap();
        let ok = run_preflight(dir.path(), 1000, 1.25, &FixedDiskProbe(1250)).unwrap();
        assert_eq!(ok.required_bytes, 1250);

        let err = run_preflight(dir.path(), 1000, 1.25, &FixedDiskProbe(1249)).unwrap_err();
        assert!(matches!(
            err,
            MdaError::InsufficientDiskSpace {
                required_bytes: 1250,
                available_bytes: 1249
            }
        ));
    }

    #[test]
    fn test_creates_missing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        check_writable(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_file_as_destination_is_not_writable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = check_writable(file.path()).unwrap_err();
        assert!(matches!(err, MdaError::DestinationNotWritable { .. }));
    }

    #[test]
    fn test_system_probe_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        // Containers may hide mounts; only check that a found volume is sane.
        if let Ok(bytes) = SystemDiskProbe.available_bytes(dir.path()) {
            assert!(bytes > 0);
        }
    }
}
