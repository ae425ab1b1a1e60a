//! Directory-backed frame source and sink for the CLI.
//!
//! The source replays pre-encoded JPEG files in name order, looping forever.
//! The sink writes the newest stylized frame to `latest.jpg` (via a rename so
//! readers never see a partial file) and optionally keeps numbered copies.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};

use super::{FrameSink, FrameSource};

const FRAME_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| FRAME_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Cycles through the JPEG files of a directory.
#[derive(Debug)]
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectoryFrameSource {
    /// Index `dir`. Fails if it holds no `.jpg`/`.jpeg` files.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_frame_file(p))
            .collect();
        files.sort();

        if files.is_empty() {
            anyhow::bail!("No .jpg frames found in {}", dir.display());
        }
        log::info!("[Pipeline] {} source frames in {}", files.len(), dir.display());
        Ok(Self { files, next: 0 })
    }

    /// Number of distinct frames.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Always false once opened.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectoryFrameSource {
    fn next_frame(&mut self) -> Result<Bytes> {
        let path = &self.files[self.next % self.files.len()];
        self.next = (self.next + 1) % self.files.len();
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Bytes::from(data))
    }
}

/// Writes presented frames into a directory.
#[derive(Debug)]
pub struct DirectoryFrameSink {
    dir: PathBuf,
    keep_all: bool,
    written: u64,
}

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

impl DirectoryFrameSink {
    /// Create `dir` if needed. With `keep_all`, every frame is also saved
    /// as `frame-NNNNNN.jpg`.
    pub fn create(dir: &Path, keep_all: bool) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            keep_all,
            written: 0,
        })
    }

    /// Frames written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path of the continuously replaced newest frame.
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join("latest.jpg")
    }
}

impl FrameSink for DirectoryFrameSink {
    fn present(&mut self, frame: &[u8]) -> Result<()> {
        if !frame.starts_with(&JPEG_SOI) {
            anyhow::bail!("frame is not a JPEG ({} bytes)", frame.len());
        }

        let tmp = self.dir.join(".latest.jpg.tmp");
        fs::write(&tmp, frame).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, self.latest_path()).context("Failed to publish latest frame")?;

        if self.keep_all {
            let numbered = self.dir.join(format!("frame-{:06}.jpg", self.written));
            fs::write(&numbered, frame)
                .with_context(|| format!("Failed to write {}", numbered.display()))?;
        }
        self.written += 1;
        Ok(())
    }
}
