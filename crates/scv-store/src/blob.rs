//! Versioned blob storage for stream payloads.
//!
//! Per stream the store keeps:
//!
//! ```text
//! <stream>/files/<name>                         seed files
//! <stream>/tags/<name>                          seed tags
//! <stream>/buffer_files/<name>                  frames since the last commit
//! <stream>/<fv>/frames/<name>                   frames committed at frame version fv
//! <stream>/<fv>/<cv>/checkpoint_files/<name>    checkpoint (fv, cv)
//! ```
//!
//! Everything except the buffer is written once and never changed.

use crate::StoreError;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

const BUFFER_DIR: &str = "buffer_files";
const FRAMES_DIR: &str = "frames";
const CHECKPOINT_DIR: &str = "checkpoint_files";

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,254}$").expect("file name regex must compile")
    })
}

/// Reject anything that is not a single plain path segment.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    if name_re().is_match(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    Files,
    Tags,
}

impl SeedKind {
    pub fn dir(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Tags => "tags",
        }
    }
}

/// Download address of one blob, relative to its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobAddress {
    Seed {
        kind: SeedKind,
        name: String,
    },
    Buffer {
        name: String,
    },
    Frame {
        frame_version: u64,
        checkpoint_version: u64,
        name: String,
    },
    Checkpoint {
        frame_version: u64,
        checkpoint_version: u64,
        name: String,
    },
}

impl BlobAddress {
    /// Parse `files/x`, `tags/x`, `buffer_files/x`, `<fv>/<cv>/x` or
    /// `<fv>/<cv>/checkpoint_files/x`.
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidAddress(path.to_string());
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let address = match segments.as_slice() {
            ["files", name] => Self::Seed {
                kind: SeedKind::Files,
                name: name.to_string(),
            },
            ["tags", name] => Self::Seed {
                kind: SeedKind::Tags,
                name: name.to_string(),
            },
            [BUFFER_DIR, name] => Self::Buffer {
                name: name.to_string(),
            },
            [fv, cv, name] => Self::Frame {
                frame_version: fv.parse().map_err(|_| invalid())?,
                checkpoint_version: cv.parse().map_err(|_| invalid())?,
                name: name.to_string(),
            },
            [fv, cv, CHECKPOINT_DIR, name] => Self::Checkpoint {
                frame_version: fv.parse().map_err(|_| invalid())?,
                checkpoint_version: cv.parse().map_err(|_| invalid())?,
                name: name.to_string(),
            },
            _ => return Err(invalid()),
        };
        validate_name(address.name()).map_err(|_| invalid())?;
        Ok(address)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Seed { name, .. }
            | Self::Buffer { name }
            | Self::Frame { name, .. }
            | Self::Checkpoint { name, .. } => name,
        }
    }
}

/// Blob store contract used by the session layer. Stream ids and file
/// names are validated by the store.
pub trait BlobStore: Send + Sync {
    fn write_seed(
        &self,
        stream_id: &str,
        kind: SeedKind,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    /// Drop everything stored for a stream.
    fn remove_stream(&self, stream_id: &str) -> Result<(), StoreError>;

    fn append_buffer(&self, stream_id: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Current length of one buffer file; 0 when it was never written.
    fn buffer_len(&self, stream_id: &str, name: &str) -> Result<u64, StoreError>;

    /// Cut one buffer file back to `len` bytes, removing it at 0.
    fn truncate_buffer(&self, stream_id: &str, name: &str, len: u64) -> Result<(), StoreError>;

    fn clear_buffer(&self, stream_id: &str) -> Result<(), StoreError>;

    /// Move the current buffer into the frame slot of `frame_version`,
    /// leaving the buffer empty.
    fn commit_frames(&self, stream_id: &str, frame_version: u64) -> Result<(), StoreError>;

    /// Write the checkpoint slot `(frame_version, checkpoint_version)`.
    fn write_checkpoint(
        &self,
        stream_id: &str,
        frame_version: u64,
        checkpoint_version: u64,
        files: &[(String, Vec<u8>)],
    ) -> Result<(), StoreError>;

    /// Undo `commit_frames`: the frame slot becomes the buffer again.
    fn uncommit_frames(&self, stream_id: &str, frame_version: u64) -> Result<(), StoreError>;

    fn discard_checkpoint(
        &self,
        stream_id: &str,
        frame_version: u64,
        checkpoint_version: u64,
    ) -> Result<(), StoreError>;

    /// Read one blob. A buffer file that was never written reads as empty.
    fn read(&self, stream_id: &str, address: &BlobAddress) -> Result<Vec<u8>, StoreError>;
}

/// `BlobStore` over a directory tree, one subdirectory per stream.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_dir(&self, stream_id: &str) -> Result<PathBuf, StoreError> {
        validate_name(stream_id)?;
        Ok(self.root.join(stream_id))
    }

    fn frames_dir(&self, stream_id: &str, frame_version: u64) -> Result<PathBuf, StoreError> {
        Ok(self
            .stream_dir(stream_id)?
            .join(frame_version.to_string())
            .join(FRAMES_DIR))
    }

    fn checkpoint_slot(
        &self,
        stream_id: &str,
        frame_version: u64,
        checkpoint_version: u64,
    ) -> Result<PathBuf, StoreError> {
        Ok(self
            .stream_dir(stream_id)?
            .join(frame_version.to_string())
            .join(checkpoint_version.to_string()))
    }
}

fn create_slot(dir: &Path) -> Result<(), StoreError> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(StoreError::SlotExists(dir.display().to_string()))
        }
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

// Drop an emptied frame-version directory; a non-empty one stays.
fn prune_empty(dir: &Path) {
    let _ = fs::remove_dir(dir);
}

impl BlobStore for FsBlobStore {
    fn write_seed(
        &self,
        stream_id: &str,
        kind: SeedKind,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        validate_name(name)?;
        let dir = self.stream_dir(stream_id)?.join(kind.dir());
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(name);
        fs::write(&path, bytes).map_err(|e| StoreError::io(&path, e))
    }

    fn remove_stream(&self, stream_id: &str) -> Result<(), StoreError> {
        remove_dir_if_present(&self.stream_dir(stream_id)?)
    }

    fn append_buffer(&self, stream_id: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        let dir = self.stream_dir(stream_id)?.join(BUFFER_DIR);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(bytes).map_err(|e| StoreError::io(&path, e))
    }

    fn buffer_len(&self, stream_id: &str, name: &str) -> Result<u64, StoreError> {
        validate_name(name)?;
        let path = self.stream_dir(stream_id)?.join(BUFFER_DIR).join(name);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn truncate_buffer(&self, stream_id: &str, name: &str, len: u64) -> Result<(), StoreError> {
        validate_name(name)?;
        let path = self.stream_dir(stream_id)?.join(BUFFER_DIR).join(name);
        if len == 0 {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::io(&path, e)),
            };
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.set_len(len).map_err(|e| StoreError::io(&path, e))
    }

    fn clear_buffer(&self, stream_id: &str) -> Result<(), StoreError> {
        remove_dir_if_present(&self.stream_dir(stream_id)?.join(BUFFER_DIR))
    }

    fn commit_frames(&self, stream_id: &str, frame_version: u64) -> Result<(), StoreError> {
        let buffer = self.stream_dir(stream_id)?.join(BUFFER_DIR);
        let slot = self.frames_dir(stream_id, frame_version)?;
        if slot.exists() {
            return Err(StoreError::SlotExists(slot.display().to_string()));
        }
        if !buffer.is_dir() {
            return create_slot(&slot);
        }
        if let Some(parent) = slot.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        fs::rename(&buffer, &slot).map_err(|e| {
            warn!(stream_id, frame_version, error = %e, "frame commit failed");
            StoreError::io(&slot, e)
        })
    }

    fn write_checkpoint(
        &self,
        stream_id: &str,
        frame_version: u64,
        checkpoint_version: u64,
        files: &[(String, Vec<u8>)],
    ) -> Result<(), StoreError> {
        for (name, _) in files {
            validate_name(name)?;
        }
        let slot = self.checkpoint_slot(stream_id, frame_version, checkpoint_version)?;
        create_slot(&slot)?;

        let dir = slot.join(CHECKPOINT_DIR);
        let write = || -> Result<(), StoreError> {
            fs::create_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
            for (name, bytes) in files {
                let path = dir.join(name);
                fs::write(&path, bytes).map_err(|e| StoreError::io(&path, e))?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            warn!(stream_id, frame_version, checkpoint_version, error = %err, "checkpoint write failed");
            let _ = remove_dir_if_present(&slot);
            return Err(err);
        }
        Ok(())
    }

    fn uncommit_frames(&self, stream_id: &str, frame_version: u64) -> Result<(), StoreError> {
        let buffer = self.stream_dir(stream_id)?.join(BUFFER_DIR);
        let slot = self.frames_dir(stream_id, frame_version)?;
        if !slot.is_dir() {
            return Ok(());
        }
        // the session lock keeps appends out while a commit is in flight
        remove_dir_if_present(&buffer)?;
        fs::rename(&slot, &buffer).map_err(|e| StoreError::io(&buffer, e))?;
        if let Some(parent) = slot.parent() {
            prune_empty(parent);
        }
        Ok(())
    }

    fn discard_checkpoint(
        &self,
        stream_id: &str,
        frame_version: u64,
        checkpoint_version: u64,
    ) -> Result<(), StoreError> {
        let slot = self.checkpoint_slot(stream_id, frame_version, checkpoint_version)?;
        remove_dir_if_present(&slot)?;
        if let Some(parent) = slot.parent() {
            prune_empty(parent);
        }
        Ok(())
    }

    fn read(&self, stream_id: &str, address: &BlobAddress) -> Result<Vec<u8>, StoreError> {
        let stream_dir = self.stream_dir(stream_id)?;
        validate_name(address.name())?;
        let path = match address {
            BlobAddress::Seed { kind, name } => stream_dir.join(kind.dir()).join(name),
            BlobAddress::Buffer { name } => {
                let path = stream_dir.join(BUFFER_DIR).join(name);
                return match fs::read(&path) {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
                    Err(e) => Err(StoreError::io(&path, e)),
                };
            }
            BlobAddress::Frame {
                frame_version,
                checkpoint_version,
                name,
            } => {
                // frames are shared by every checkpoint of their frame version,
                // but only addressable through a slot that exists
                let slot = self.checkpoint_slot(stream_id, *frame_version, *checkpoint_version)?;
                if !slot.is_dir() {
                    return Err(StoreError::BlobNotFound(format!(
                        "{stream_id}/{frame_version}/{checkpoint_version}"
                    )));
                }
                self.frames_dir(stream_id, *frame_version)?.join(name)
            }
            BlobAddress::Checkpoint {
                frame_version,
                checkpoint_version,
                name,
            } => self
                .checkpoint_slot(stream_id, *frame_version, *checkpoint_version)?
                .join(CHECKPOINT_DIR)
                .join(name),
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(path.display().to_string()))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}
