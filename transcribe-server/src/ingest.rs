//! Upload ingestion
//!
//! Reads an upload body incrementally into memory, switching to a temporary
//! file once the payload passes the in-memory threshold. Format and declared
//! length are checked before any body bytes are read; the running byte count
//! is checked on every chunk so an oversized body is abandoned as soon as it
//! crosses the limit.

use crate::context::RequestContext;
use crate::error::{TranscriptionError, ValidationError};
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::io;
use std::path::Path;
use symphonia::core::io::MediaSource;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout_at;
use tracing::{debug, warn};
use transcribe_common::api::AudioFormat;
use transcribe_common::config::IngestConfig;

/// Upload metadata taken from request headers before the body is read
#[derive(Debug, Clone, Default)]
pub struct DeclaredUpload {
    pub content_type: Option<String>,
    /// File name of a multipart part, used when the content type is generic
    pub file_name: Option<String>,
    pub length: Option<u64>,
}

enum AudioStorage {
    Memory(Bytes),
    Spooled(NamedTempFile),
}

/// A validated upload, owned by the pipeline until the request finishes.
///
/// A spooled upload's temporary file is deleted when this value is dropped.
pub struct UploadedAudio {
    format: AudioFormat,
    size: u64,
    storage: AudioStorage,
}

impl UploadedAudio {
    /// Wrap bytes that are already in memory
    pub fn in_memory(format: AudioFormat, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            format,
            size: bytes.len() as u64,
            storage: AudioStorage::Memory(bytes),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Measured size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self.storage, AudioStorage::Spooled(_))
    }

    pub fn spooled_path(&self) -> Option<&Path> {
        match &self.storage {
            AudioStorage::Spooled(file) => Some(file.path()),
            AudioStorage::Memory(_) => None,
        }
    }

    /// Fresh reader positioned at the start of the payload
    pub fn open(&self) -> io::Result<Box<dyn MediaSource>> {
        match &self.storage {
            AudioStorage::Memory(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            AudioStorage::Spooled(file) => Ok(Box::new(file.reopen()?)),
        }
    }
}

impl std::fmt::Debug for UploadedAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedAudio")
            .field("format", &self.format)
            .field("size", &self.size)
            .field("spooled", &self.spooled_path())
            .finish()
    }
}

struct Spool {
    file: NamedTempFile,
    writer: tokio::fs::File,
}

pub struct Ingestor {
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    /// Map declared type (or file extension) to an allowed format
    pub fn resolve_format(&self, declared: &DeclaredUpload) -> Result<AudioFormat, ValidationError> {
        let content_type = declared.content_type.as_deref().unwrap_or("").trim();

        let format = AudioFormat::from_mime(content_type).or_else(|| {
            let generic = content_type.is_empty()
                || content_type.starts_with("application/octet-stream");
            if !generic {
                return None;
            }
            declared
                .file_name
                .as_deref()
                .and_then(|name| Path::new(name).extension())
                .and_then(|ext| ext.to_str())
                .and_then(AudioFormat::from_extension)
        });

        let display = if content_type.is_empty() {
            "<missing>".to_string()
        } else {
            content_type.to_string()
        };

        match format {
            Some(format) if self.config.allowed_formats.contains(&format) => Ok(format),
            Some(format) => Err(ValidationError::UnsupportedFormat(format!(
                "{} ({} uploads are disabled)",
                display, format
            ))),
            None => Err(ValidationError::UnsupportedFormat(display)),
        }
    }

    /// Read and validate one upload.
    ///
    /// Fails before touching the body when the format is not allowed or the
    /// declared length is over the limit.
    pub async fn ingest<S, E>(
        &self,
        body: S,
        declared: &DeclaredUpload,
        ctx: &RequestContext,
    ) -> Result<UploadedAudio, TranscriptionError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let format = self.resolve_format(declared)?;
        let limit = self.config.max_upload_bytes;

        if let Some(length) = declared.length {
            if length > limit {
                debug!(request_id = %ctx.id(), length, limit, "Declared length over limit");
                return Err(ValidationError::TooLarge { limit }.into());
            }
        }

        let mut body = std::pin::pin!(body);
        let mut buffer: Vec<u8> = Vec::new();
        let mut spool: Option<Spool> = None;
        let mut received: u64 = 0;

        loop {
            let next = match timeout_at(ctx.deadline(), body.next()).await {
                Ok(next) => next,
                Err(_) => return Err(TranscriptionError::Cancelled { stage: "upload" }),
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(ValidationError::Truncated(format!(
                        "read failed after {} bytes: {}",
                        received, e
                    ))
                    .into())
                }
            };

            received += chunk.len() as u64;
            if received > limit {
                debug!(request_id = %ctx.id(), received, limit, "Upload over limit, aborting read");
                return Err(ValidationError::TooLarge { limit }.into());
            }

            match spool.as_mut() {
                Some(spool) => write_spool(&mut spool.writer, &chunk).await?,
                None => {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() as u64 > self.config.memory_threshold_bytes {
                        let mut created = self.create_spool(format)?;
                        write_spool(&mut created.writer, &buffer).await?;
                        buffer = Vec::new();
                        debug!(
                            request_id = %ctx.id(),
                            path = %created.file.path().display(),
                            "Spooling upload to disk"
                        );
                        spool = Some(created);
                    }
                }
            }
        }

        if received == 0 {
            return Err(ValidationError::Empty.into());
        }
        if let Some(length) = declared.length {
            if received < length {
                return Err(ValidationError::Truncated(format!(
                    "received {} of {} declared bytes",
                    received, length
                ))
                .into());
            }
        }

        let storage = match spool {
            Some(mut spool) => {
                spool.writer.flush().await.map_err(spool_failure)?;
                AudioStorage::Spooled(spool.file)
            }
            None => AudioStorage::Memory(Bytes::from(buffer)),
        };

        debug!(request_id = %ctx.id(), bytes = received, %format, "Upload ingested");

        Ok(UploadedAudio {
            format,
            size: received,
            storage,
        })
    }

    fn create_spool(&self, format: AudioFormat) -> Result<Spool, TranscriptionError> {
        let mut builder = tempfile::Builder::new();
        let suffix = format!(".{}", format.extension());
        builder.prefix("transcribe-upload-").suffix(&suffix);

        let file = match &self.config.spool_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(spool_failure)?;

        let writer = file.as_file().try_clone().map_err(spool_failure)?;
        Ok(Spool {
            file,
            writer: tokio::fs::File::from_std(writer),
        })
    }
}

async fn write_spool(writer: &mut tokio::fs::File, data: &[u8]) -> Result<(), TranscriptionError> {
    writer.write_all(data).await.map_err(spool_failure)
}

fn spool_failure(err: io::Error) -> TranscriptionError {
    warn!(error = %err, "Failed to spool upload");
    TranscriptionError::internal(format!("spool I/O failed: {}", err))
}
