use crate::image_utils::{ImageError, PreparedImage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

const FRAME_JPEG_QUALITY: u8 = 80;
const FRAME_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("Failed to read frames directory {path}: {source}")]
    OpenDirectoryFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("No frames found in {0}")]
    NoFrames(PathBuf),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(#[from] std::io::Error),
    #[error("Failed to process frame: {0}")]
    ProcessFrameFailed(#[from] ImageError),
    #[error("Frame worker failed: {0}")]
    Worker(String),
}

/// Produces JPEG frames at the reduced real-time resolution.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// `Ok(None)` means no frame is available right now.
    async fn capture_frame(&self) -> Result<Option<Vec<u8>>, FrameSourceError>;
}

/// Replays the still images of a directory in name order, looping forever.
#[derive(Debug)]
pub struct DirectoryFrameSource {
    frames: Vec<PathBuf>,
    cursor: AtomicUsize,
    width: u32,
    height: u32,
}

impl DirectoryFrameSource {
    pub fn new(dir: &Path, width: u32, height: u32) -> Result<Self, FrameSourceError> {
        let entries =
            std::fs::read_dir(dir).map_err(|source| FrameSourceError::OpenDirectoryFailed {
                path: dir.to_path_buf(),
                source,
            })?;

        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_frame_file(path))
            .collect();
        if frames.is_empty() {
            return Err(FrameSourceError::NoFrames(dir.to_path_buf()));
        }
        frames.sort();

        tracing::info!("Loaded {} frames from {}", frames.len(), dir.display());
        Ok(Self {
            frames,
            cursor: AtomicUsize::new(0),
            width,
            height,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false)
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn capture_frame(&self) -> Result<Option<Vec<u8>>, FrameSourceError> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.frames.len();
        let bytes = tokio::fs::read(&self.frames[index]).await?;
        let (width, height) = (self.width, self.height);

        let frame = tokio::task::spawn_blocking(move || {
            PreparedImage::from_bytes(&bytes)?
                .resize_exact(width, height)
                .to_jpeg(FRAME_JPEG_QUALITY)
        })
        .await
        .map_err(|e| FrameSourceError::Worker(e.to_string()))??;

        Ok(Some(frame))
    }
}
