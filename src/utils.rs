//! Utility functions for file operations and disk space

use crate::config::DiskSpaceConfig;
use crate::error::{Error, Result};
use std::path::Path;

/// Length of a file, or 0 if it does not exist
pub async fn file_len(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::disk(path, e)),
    }
}

/// Remove a file; returns whether something was removed
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::disk(path, e)),
    }
}

/// Remove a directory if it exists and is empty
///
/// A non-empty directory is left alone and is not an error.
pub async fn remove_dir_if_empty(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
            ) =>
        {
            Ok(())
        }
        Err(e) => Err(Error::disk(path, e)),
    }
}

/// Human-readable byte count ("1.5 MiB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Check if there is sufficient disk space under `dir` for `size_bytes`
///
/// Required space is the declared size times the configured multiplier
/// (stream files plus the assembled copy) plus the minimum free buffer.
/// `dir` need not exist yet; its nearest existing ancestor is checked.
pub fn check_disk_space(config: &DiskSpaceConfig, dir: &Path, size_bytes: u64) -> Result<()> {
    if !config.enabled || size_bytes == 0 {
        return Ok(());
    }

    let required = (size_bytes as f64 * config.size_multiplier) as u64;
    let required_with_buffer = required.saturating_add(config.min_free_space);

    let check_path = dir
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));

    let available = get_available_space(check_path).map_err(|e| Error::disk(check_path, e))?;

    if available < required_with_buffer {
        return Err(Error::InsufficientSpace {
            required: required_with_buffer,
            available,
        });
    }

    Ok(())
}

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux / macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
///
/// # Examples
///
/// ```ignore
/// let available = get_available_space(Path::new("/downloads"))?;
/// println!("Available space: {} GB", available / (1024 * 1024 * 1024));
/// ```
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zeroed
        // before the call and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail: blocks available to unprivileged users
            #[allow(clippy::unnecessary_cast)]
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out-pointer refers
        // to a live, aligned u64 that is only read after a successful call.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space checking is not supported on this platform",
        ))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[tokio::test]
    async fn file_helpers_tolerate_missing_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.part");

        assert_eq!(file_len(&path).await.unwrap(), 0);
        assert!(!remove_file_if_exists(&path).await.unwrap());
        remove_dir_if_empty(&dir.path().join("nope")).await.unwrap();

        tokio::fs::write(&path, b"abc").await.unwrap();
        assert_eq!(file_len(&path).await.unwrap(), 3);
        assert!(remove_file_if_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn non_empty_directory_is_kept() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("ep");
        tokio::fs::create_dir(&sub).await.unwrap();
        tokio::fs::write(sub.join("0_video.part"), b"x").await.unwrap();

        remove_dir_if_empty(&sub).await.unwrap();
        assert!(sub.exists());
    }

    #[test]
    fn test_get_available_space_valid_path() {
        let temp_dir = TempDir::new().unwrap();
        let available = get_available_space(temp_dir.path()).unwrap();

        assert!(available > 0, "Available space should be greater than 0");
        assert!(
            available < 1_000_000_000_000_000,
            "Available space seems unreasonably large"
        );
    }

    #[test]
    fn test_get_available_space_nonexistent_path() {
        let result = get_available_space(Path::new("/nonexistent/path/that/should/not/exist"));
        assert!(result.is_err(), "Should return error for nonexistent path");
    }

    #[test]
    fn disk_check_uses_nearest_existing_ancestor() {
        let temp_dir = TempDir::new().unwrap();
        let not_yet = temp_dir.path().join("a").join("b");
        check_disk_space(&DiskSpaceConfig::default(), &not_yet, 1).unwrap();
    }

    #[test]
    fn disk_check_rejects_impossible_sizes() {
        let temp_dir = TempDir::new().unwrap();
        let err = check_disk_space(&DiskSpaceConfig::default(), temp_dir.path(), u64::MAX / 4)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { .. }));
    }

    #[test]
    fn disabled_disk_check_always_passes() {
        let config = DiskSpaceConfig {
            enabled: false,
            ..DiskSpaceConfig::default()
        };
        check_disk_space(&config, Path::new("/nonexistent"), u64::MAX).unwrap();
    }
}
