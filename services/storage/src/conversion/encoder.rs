use crate::config::ConversionConfig;
use crate::model::{Rendition, SourceFormat};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Errors from deriving a format
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Encoder {encoder} failed: {message}")]
    EncoderFailed { encoder: String, message: String },

    #[error("Encoder {0} timed out")]
    Timeout(String),

    #[error("Cannot encode to {0}")]
    Unsupported(Rendition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Conversion queue full, job dropped")]
    QueueFull,

    #[error("Conversion pipeline shut down")]
    Shutdown,
}

/// Produces a derived rendition from original image bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        target: Rendition,
        source: Bytes,
        source_format: SourceFormat,
    ) -> Result<Bytes, ConversionError>;
}

/// Encoder shelling out to `cwebp` and `avifenc`
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    cwebp_path: String,
    avifenc_path: String,
    webp_quality: u8,
    avif_quality: u8,
    avif_speed: u8,
    timeout: Duration,
}

impl CommandEncoder {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            cwebp_path: config.cwebp_path.clone(),
            avifenc_path: config.avifenc_path.clone(),
            webp_quality: config.webp_quality.min(100),
            avif_quality: config.avif_quality.min(100),
            avif_speed: config.avif_speed.min(10),
            timeout: config.encode_timeout(),
        }
    }

    fn command(&self, target: Rendition, input: &Path, output: &Path) -> Option<Command> {
        let mut cmd = match target {
            Rendition::Webp => {
                let mut cmd = Command::new(&self.cwebp_path);
                cmd.arg("-quiet")
                    .arg("-q")
                    .arg(self.webp_quality.to_string())
                    .arg(input)
                    .arg("-o")
                    .arg(output);
                cmd
            }
            Rendition::Avif => {
                let mut cmd = Command::new(&self.avifenc_path);
                cmd.arg("--speed")
                    .arg(self.avif_speed.to_string())
                    .arg("-q")
                    .arg(self.avif_quality.to_string())
                    .arg(input)
                    .arg(output);
                cmd
            }
            Rendition::Original => return None,
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Some(cmd)
    }
}

#[async_trait]
impl Encoder for CommandEncoder {
    #[instrument(skip(self, source), fields(target = %target, size_bytes = source.len()))]
    async fn encode(
        &self,
        target: Rendition,
        source: Bytes,
        source_format: SourceFormat,
    ) -> Result<Bytes, ConversionError> {
        let ext = target
            .derived_extension()
            .ok_or(ConversionError::Unsupported(target))?;

        let scratch = tempfile::tempdir()?;
        let input = scratch
            .path()
            .join(format!("input.{}", source_format.extension()));
        let output = scratch.path().join(format!("output.{ext}"));
        tokio::fs::write(&input, &source).await?;

        let mut cmd = self
            .command(target, &input, &output)
            .ok_or(ConversionError::Unsupported(target))?;
        let encoder = cmd.as_std().get_program().to_string_lossy().into_owned();

        let result = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ConversionError::Timeout(encoder.clone()))?
            .map_err(|e| ConversionError::EncoderFailed {
                encoder: encoder.clone(),
                message: e.to_string(),
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ConversionError::EncoderFailed {
                encoder,
                message: format!("{}: {}", result.status, stderr.trim()),
            });
        }

        let encoded = tokio::fs::read(&output).await?;
        if encoded.is_empty() {
            return Err(ConversionError::EncoderFailed {
                encoder,
                message: "empty output".to_string(),
            });
        }

        debug!(encoded_bytes = encoded.len(), "Encoded derived format");
        Ok(Bytes::from(encoded))
    }
}
