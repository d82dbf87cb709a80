//! Media duration probing
//!
//! The schedule generator and the supervisor only ever need one fact
//! about a media file: how long it runs. That capability sits behind the
//! `MediaProber` trait so tests can script durations; the production
//! implementation asks ffprobe.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::ProbeError;

/// Abstract duration probe: `duration(path) -> seconds`.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn duration(&self, path: &Path) -> Result<u64, ProbeError>;
}

/// Probes media files with ffprobe.
pub struct FfprobeProber {
    ffprobe_command: String,
    probe_timeout: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe_command: impl Into<String>) -> Self {
        Self {
            ffprobe_command: ffprobe_command.into(),
            probe_timeout: Duration::from_secs(10),
        }
    }

    /// Check that the configured ffprobe binary runs, returning its
    /// version string when it does.
    pub async fn check_availability(&self) -> (bool, Option<String>) {
        match Command::new(&self.ffprobe_command).arg("-version").output().await {
            Ok(output) if output.status.success() => {
                let version_output = String::from_utf8_lossy(&output.stdout);
                let version = version_output.lines().next().and_then(|line| {
                    line.strip_prefix("ffprobe version ")
                        .map(|rest| rest.split_whitespace().next().unwrap_or(rest).to_string())
                });
                (true, version)
            }
            Ok(output) => {
                warn!(
                    "ffprobe command '{}' failed with status: {}",
                    self.ffprobe_command, output.status
                );
                (false, None)
            }
            Err(e) => {
                warn!("Failed to execute ffprobe command '{}': {e}", self.ffprobe_command);
                (false, None)
            }
        }
    }

    fn parse_duration(
        &self,
        path: &Path,
        data: serde_json::Value,
    ) -> Result<u64, ProbeError> {
        let has_video = data["streams"]
            .as_array()
            .map(|streams| {
                streams
                    .iter()
                    .any(|stream| stream["codec_type"].as_str() == Some("video"))
            })
            .unwrap_or(false);

        if !has_video {
            return Err(ProbeError::NoVideoTrack {
                path: path.to_path_buf(),
            });
        }

        // Prefer the container duration; fall back to the first video
        // stream's own duration field.
        let duration: Option<f64> = data["format"]["duration"]
            .as_str()
            .and_then(|raw| raw.parse().ok())
            .or_else(|| {
                data["streams"].as_array().and_then(|streams| {
                    streams
                        .iter()
                        .find(|stream| stream["codec_type"].as_str() == Some("video"))
                        .and_then(|stream| stream["duration"].as_str())
                        .and_then(|raw| raw.parse().ok())
                })
            });

        match duration {
            Some(seconds) if seconds.is_finite() && seconds >= 0.0 => Ok(seconds as u64),
            _ => Err(ProbeError::Failed {
                path: path.to_path_buf(),
                message: "no duration in probe output".to_string(),
            }),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn duration(&self, path: &Path) -> Result<u64, ProbeError> {
        if !path.is_file() {
            return Err(ProbeError::Missing {
                path: path.to_path_buf(),
            });
        }

        debug!("Probing duration of {}", path.display());

        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"]);
        cmd.arg(path);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = tokio::time::timeout(self.probe_timeout, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout {
                path: path.to_path_buf(),
            })?
            .map_err(|e| ProbeError::Failed {
                path: path.to_path_buf(),
                message: format!("failed to execute ffprobe: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let probe_data: serde_json::Value =
            serde_json::from_str(&stdout).map_err(|e| ProbeError::Failed {
                path: path.to_path_buf(),
                message: format!("failed to parse ffprobe output: {e}"),
            })?;

        self.parse_duration(path, probe_data)
    }
}
