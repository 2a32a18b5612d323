//! Raw and streaming reference access
//!
//! Three shapes, chosen by the host's answer:
//! - an in-memory buffer or a finished file (no streaming requested, or the
//!   producer is done)
//! - a finished file the host pinned for us, which must be released
//! - a growing file, read in chunks as the producer appends

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::warn;

use super::context::TaskContext;
use crate::error::{Error, Result};
use crate::protocol::{required_field, HostChannel, RefResponse, StreamProgress, Verb};
use crate::types::Reference;

#[derive(Debug, Clone, Default)]
pub struct RawOptions {
    pub may_stream: bool,
    pub sole_consumer: bool,
    /// Defaults to `runtime.stream_chunk_size`
    pub chunk_size: Option<usize>,
}

pub enum RawInput<'a> {
    Buffer(Cursor<Vec<u8>>),
    Complete(CompleteFile<'a>),
    Streaming(StreamingFile<'a>),
}

impl Read for RawInput<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RawInput::Buffer(cursor) => cursor.read(buf),
            RawInput::Complete(file) => file.read(buf),
            RawInput::Streaming(file) => file.read(buf),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Complete File
// ─────────────────────────────────────────────────────────────────

pub struct CompleteFile<'a> {
    reference: Reference,
    path: PathBuf,
    file: File,
    /// Set when the host pinned the block and expects `close_ref`
    release_to: Option<&'a dyn HostChannel>,
}

impl<'a> CompleteFile<'a> {
    fn open(
        reference: &Reference,
        path: PathBuf,
        release_to: Option<&'a dyn HostChannel>,
    ) -> Result<Self> {
        let file = File::open(&path).map_err(|source| Error::IoRead {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            reference: reference.clone(),
            path,
            file,
            release_to,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn must_release(&self) -> bool {
        self.release_to.is_some()
    }

    /// Hand the block back to the host
    pub fn release(mut self) -> Result<()> {
        match self.release_to.take() {
            Some(channel) => close_ref(channel, &self.reference),
            None => Ok(()),
        }
    }
}

impl Read for CompleteFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Drop for CompleteFile<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.release_to.take() {
            warn!(ref_id = %self.reference.id, "Pinned block dropped without release");
            if let Err(e) = close_ref(channel, &self.reference) {
                warn!(ref_id = %self.reference.id, error = %e, "Failed to release block");
            }
        }
    }
}

fn close_ref(channel: &dyn HostChannel, reference: &Reference) -> Result<()> {
    channel.synchronous_request(Verb::CloseRef, json!({ "ref": reference }))?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Streaming File
// ─────────────────────────────────────────────────────────────────

/// A block the producer is still appending to
pub struct StreamingFile<'a> {
    reference: Reference,
    file: File,
    channel: &'a dyn HostChannel,
    /// Bytes known to be on disk
    available: u64,
    offset: u64,
    done: bool,
    chunk_size: usize,
}

impl<'a> StreamingFile<'a> {
    fn open(
        reference: &Reference,
        path: &Path,
        channel: &'a dyn HostChannel,
        size: u64,
        chunk_size: usize,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            reference: reference.clone(),
            file,
            channel,
            available: size,
            offset: 0,
            done: false,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    /// Next chunk of at most `chunk_size` bytes; `None` at end of stream
    ///
    /// Blocks in `wait_stream` when the reader has caught up with the
    /// producer.
    pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        while self.offset >= self.available {
            if self.done {
                return Ok(None);
            }
            self.wait_for_growth()?;
        }

        let want = (self.available - self.offset).min(self.chunk_size as u64) as usize;
        let mut chunk = vec![0u8; want];
        self.file.read_exact(&mut chunk)?;
        self.offset += want as u64;
        Ok(Some(chunk))
    }

    fn wait_for_growth(&mut self) -> Result<()> {
        let response = self.channel.synchronous_request(
            Verb::WaitStream,
            json!({ "ref": self.reference, "size": self.available }),
        )?;
        let progress = stream_progress(&response)?;

        if progress.size <= self.available && !progress.done {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("stream {} stopped growing at {} bytes", self.reference.id, self.available),
            )));
        }
        self.available = progress.size.max(self.available);
        self.done = progress.done;
        Ok(())
    }
}

impl Read for StreamingFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.available {
            if self.done {
                return Ok(0);
            }
            self.wait_for_growth()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        let want = (self.available - self.offset).min(buf.len() as u64) as usize;
        let read = self.file.read(&mut buf[..want])?;
        self.offset += read as u64;
        Ok(read)
    }
}

// ─────────────────────────────────────────────────────────────────
// Context API
// ─────────────────────────────────────────────────────────────────

impl<'a> TaskContext<'a> {
    /// Open a reference as bytes rather than a decoded value
    pub fn open_raw(&mut self, reference: &Reference, options: RawOptions) -> Result<RawInput<'a>> {
        let chunk_size = options.chunk_size.unwrap_or(self.settings.stream_chunk_size);

        if !options.may_stream {
            return match self.request_ref(reference, Verb::OpenRef, Map::new())? {
                RefResponse::Inline { bytes } => Ok(RawInput::Buffer(Cursor::new(bytes))),
                RefResponse::File { path, .. } => {
                    Ok(RawInput::Complete(CompleteFile::open(reference, path, None)?))
                }
                other => Err(unexpected(reference, &other)),
            };
        }

        let mut extra = Map::new();
        extra.insert("chunk_size".to_string(), Value::from(chunk_size as u64));
        extra.insert("sole_consumer".to_string(), Value::from(options.sole_consumer));

        match self.request_ref(reference, Verb::OpenRefAsync, extra)? {
            RefResponse::Inline { bytes } => Ok(RawInput::Buffer(Cursor::new(bytes))),
            RefResponse::File { path, done: true, .. } => {
                Ok(RawInput::Complete(CompleteFile::open(reference, path, None)?))
            }
            RefResponse::File {
                path,
                blocking: true,
                ..
            } => Ok(RawInput::Complete(CompleteFile::open(
                reference,
                path,
                Some(self.channel),
            )?)),
            RefResponse::File { path, size, .. } => Ok(RawInput::Streaming(StreamingFile::open(
                reference,
                &path,
                self.channel,
                size.unwrap_or(0),
                chunk_size,
            )?)),
            other => Err(unexpected(reference, &other)),
        }
    }
}

fn unexpected(reference: &Reference, response: &RefResponse) -> Error {
    Error::Internal(format!(
        "raw open of {} returned {:?}",
        reference.id, response
    ))
}

/// Parse `{size, done}` out of a generic response
pub(crate) fn stream_progress(response: &Value) -> Result<StreamProgress> {
    let size = required_field(response, Verb::WaitStream, "size")?
        .as_u64()
        .ok_or_else(|| Error::protocol("wait_stream size is not an integer"))?;
    let done = required_field(response, Verb::WaitStream, "done")?
        .as_bool()
        .ok_or_else(|| Error::protocol("wait_stream done is not a boolean"))?;
    Ok(StreamProgress { size, done })
}
