//! Device icon files.
//!
//! Each device has at most one icon, stored as `<device_id>.png` in the
//! configured icons directory and served under [`ICONS_ROUTE`]. Uploads are
//! written to a temporary file, synced, then renamed over the final name so
//! a reader never sees a partial icon.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// URL prefix the icons directory is served under.
pub const ICONS_ROUTE: &str = "/icons";

/// Content type accepted for uploads and used when serving.
pub const ICON_CONTENT_TYPE: &str = "image/png";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Errors handling icon files.
#[derive(Debug, thiserror::Error)]
pub enum IconError {
    /// The device ID cannot be used as a file name.
    #[error("Invalid device ID for an icon: {0:?}")]
    InvalidDeviceId(String),

    /// The upload is not a PNG image.
    #[error("Icon must be a non-empty PNG image")]
    NotPng,

    #[error("Icon file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The directory holding device icons.
#[derive(Debug, Clone)]
pub struct IconDir {
    root: PathBuf,
}

impl IconDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File name of a device's icon.
    pub fn file_name(device_id: &str) -> Result<String, IconError> {
        let valid = !device_id.is_empty()
            && device_id != "."
            && device_id != ".."
            && !device_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(IconError::InvalidDeviceId(device_id.to_string()));
        }
        Ok(format!("{}.png", device_id))
    }

    /// URL a device's icon is served at.
    pub fn url(device_id: &str) -> Result<String, IconError> {
        Ok(format!("{}/{}", ICONS_ROUTE, Self::file_name(device_id)?))
    }

    pub fn path(&self, device_id: &str) -> Result<PathBuf, IconError> {
        Ok(self.root.join(Self::file_name(device_id)?))
    }

    /// Store `bytes` as the device's icon, replacing any existing one.
    pub async fn save(&self, device_id: &str, bytes: &[u8]) -> Result<PathBuf, IconError> {
        if !is_png(bytes) {
            return Err(IconError::NotPng);
        }
        let path = self.path(device_id)?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        let temp = path.with_extension("png.tmp");
        if let Err(e) = write_synced(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error(&temp, e));
        }
        fs::rename(&temp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        info!("Saved icon for {} ({} bytes)", device_id, bytes.len());
        Ok(path)
    }

    /// Delete the device's icon. Returns whether a file was removed.
    pub async fn remove(&self, device_id: &str) -> Result<bool, IconError> {
        let path = self.path(device_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed icon for {}", device_id);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No icon to remove for {}", device_id);
                Ok(false)
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Read the device's icon, if it has one.
    pub async fn read(&self, device_id: &str) -> Result<Option<Vec<u8>>, IconError> {
        let path = self.path(device_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

/// Whether `bytes` start with the PNG signature.
pub fn is_png(bytes: &[u8]) -> bool {
    bytes.len() > PNG_SIGNATURE.len() && bytes.starts_with(&PNG_SIGNATURE)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

fn io_error(path: &Path, source: io::Error) -> IconError {
    IconError::Io {
        path: path.to_path_buf(),
        source,
    }
}
