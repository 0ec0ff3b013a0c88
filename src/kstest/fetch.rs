//! Boot image download.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use super::error::KickstartError;

/// Where the batch runner expects the boot image inside the checkout
pub const BOOT_IMAGE_PATH: &str = "data/images/boot.iso";

/// Fetch the boot image at `url` into `dest`.
///
/// `http://` and `https://` URLs are downloaded, `file://` URLs copied.
pub fn fetch_boot_image(url: &str, dest: &Path) -> Result<(), KickstartError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if let Some(path) = url.strip_prefix("file://") {
        tracing::info!(src = path, dest = %dest.display(), "copying boot image");
        fs::copy(path, dest).map_err(|e| KickstartError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(());
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        tracing::info!(url, dest = %dest.display(), "downloading boot image");
        return download(url, dest).map_err(|reason| KickstartError::Fetch {
            url: url.to_string(),
            reason,
        });
    }

    Err(KickstartError::UnsupportedUrl(url.to_string()))
}

fn download(url: &str, dest: &Path) -> Result<(), String> {
    let mut response = ureq::get(url).call().map_err(|e| e.to_string())?;
    let mut reader = response.body_mut().with_config().limit(u64::MAX).reader();
    let mut file = File::create(dest).map_err(|e| e.to_string())?;
    let bytes = io::copy(&mut reader, &mut file).map_err(|e| e.to_string())?;
    tracing::debug!(url, bytes, "boot image downloaded");
    Ok(())
}

/// Remove a fetched boot image. A missing file is fine.
pub fn remove_boot_image(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "boot image removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove boot image"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_file_url() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("boot.iso");
        fs::write(&iso, "iso").unwrap();
        let dest = dir.path().join("repo").join(BOOT_IMAGE_PATH);

        fetch_boot_image(&format!("file://{}", iso.display()), &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "iso");

        remove_boot_image(&dest);
        assert!(!dest.exists());
        remove_boot_image(&dest);
    }

    #[test]
    fn test_missing_file_url() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join(BOOT_IMAGE_PATH);
        let err = fetch_boot_image("file:///nonexistent/boot.iso", &dest).unwrap_err();
        assert!(matches!(err, KickstartError::Fetch { .. }));
    }

    #[test]
    fn test_unsupported_url() {
        let dir = TempDir::new().unwrap();
        let err = fetch_boot_image("ftp://example.com/boot.iso", &dir.path().join("boot.iso"))
            .unwrap_err();
        assert!(matches!(err, KickstartError::UnsupportedUrl(_)));
    }
}
