//! Remote schedule upload with bounded retries
//!
//! The transport itself is a collaborator behind the `FileTransport`
//! trait — one "put file" operation with a 10-second budget. This module
//! owns the policy around it: retry counts, exponential backoff, the
//! session-wide disable after an authentication failure, and the alerts
//! for each outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::RemoteConfig;
use crate::errors::RemoteError;
use crate::services::mailer::{Alert, Mailer};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_START_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 64;

/// Transport failure classification. Authentication failures are fatal
/// for the session; everything else is retried.
#[derive(Debug)]
pub enum TransportError {
    Auth(String),
    Timeout,
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(message) => write!(f, "authentication failed: {message}"),
            Self::Timeout => write!(f, "attempt timed out"),
            Self::Other(message) => f.write_str(message),
        }
    }
}

/// A single "put file" operation against the remote host.
#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn put(&self, local: &Path) -> Result<(), TransportError>;
}

/// Drives the OpenSSH `scp` binary as an opaque child process, the same
/// way the encoder and relay binaries are driven.
pub struct ScpTransport {
    binary: String,
    port: u16,
    username: String,
    address: String,
    directory: String,
    key_file: Option<PathBuf>,
}

impl ScpTransport {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            binary: config.transfer_binary.clone(),
            port: config.port,
            username: config.username.clone(),
            address: config.address.clone(),
            directory: config.directory.clone(),
            key_file: config.key_file.clone(),
        }
    }

    fn target(&self) -> String {
        let host = if self.username.is_empty() {
            self.address.clone()
        } else {
            format!("{}@{}", self.username, self.address)
        };
        format!("{host}:{}", self.directory)
    }
}

#[async_trait]
impl FileTransport for ScpTransport {
    async fn put(&self, local: &Path) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-P").arg(self.port.to_string());
        cmd.args(["-o", "BatchMode=yes"]);
        if let Some(key_file) = &self.key_file {
            cmd.arg("-i").arg(key_file);
        }
        cmd.arg(local);
        cmd.arg(self.target());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let output = tokio::time::timeout(ATTEMPT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Other(format!("failed to run {}: {e}", self.binary)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_lowercase();
        if lowered.contains("permission denied")
            || lowered.contains("authentication")
            || lowered.contains("host key verification failed")
        {
            Err(TransportError::Auth(stderr))
        } else {
            Err(TransportError::Other(format!(
                "{} exited with {}: {stderr}",
                self.binary, output.status
            )))
        }
    }
}

/// Upload policy: bounded retries with exponential backoff and a
/// session-wide disable on authentication failure.
pub struct RemoteUploader {
    transport: Arc<dyn FileTransport>,
    address: String,
    attempts: i32,
    report_partial_success: bool,
    disabled: AtomicBool,
}

impl RemoteUploader {
    pub fn new(config: &RemoteConfig) -> Self {
        Self::with_transport(config, Arc::new(ScpTransport::new(config)))
    }

    pub fn with_transport(config: &RemoteConfig, transport: Arc<dyn FileTransport>) -> Self {
        Self {
            transport,
            address: config.address.clone(),
            attempts: config.upload_attempts,
            report_partial_success: config.report_partial_success,
            disabled: AtomicBool::new(false),
        }
    }

    /// Whether uploads have been disabled for the rest of the process
    /// lifetime.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Deliver `local` to the remote host. Alerts are emitted through
    /// `mailer` according to the outcome.
    pub async fn upload(&self, local: &Path, mailer: &Mailer) -> Result<(), RemoteError> {
        if self.is_disabled() {
            debug!("Remote upload skipped: uploads are disabled for this session");
            return Err(RemoteError::Disabled);
        }

        if self.attempts == 0 {
            debug!("Remote upload skipped: upload_attempts is 0");
            return Ok(());
        }

        let mut attempt: u32 = 0;
        let mut backoff_secs = BACKOFF_START_SECS;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            debug!("Uploading {} to {} (attempt {attempt})", local.display(), self.address);

            match self.transport.put(local).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(
                            "Upload to {} succeeded after {attempt} attempts",
                            self.address
                        );
                        if self.report_partial_success {
                            mailer
                                .enqueue(Alert::RemoteSuccessAfterError { attempts: attempt }, false)
                                .await;
                        }
                    } else {
                        debug!("Upload to {} succeeded", self.address);
                    }
                    return Ok(());
                }
                Err(TransportError::Auth(message)) => {
                    error!("Remote authentication failed for {}: {message}", self.address);
                    error!("Remote uploads disabled for this session.");
                    self.disabled.store(true, Ordering::SeqCst);
                    mailer
                        .enqueue(
                            Alert::RemoteAuthFailed {
                                message: message.clone(),
                            },
                            false,
                        )
                        .await;
                    return Err(RemoteError::AuthenticationFailed { message });
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "Upload attempt {attempt} to {} failed: {last_error}",
                        self.address
                    );
                }
            }

            // Negative attempt counts retry forever.
            if self.attempts > 0 && attempt >= self.attempts as u32 {
                break;
            }

            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(BACKOFF_CAP_SECS);
        }

        error!(
            "Upload to {} failed after {attempt} attempts: {last_error}",
            self.address
        );
        mailer
            .enqueue(
                Alert::RemoteError {
                    message: last_error.clone(),
                    attempts: attempt,
                },
                false,
            )
            .await;
        Err(RemoteError::AttemptsExhausted {
            attempts: attempt,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;

    /// Scripted transport: pops one result per call.
    struct ScriptedTransport {
        results: Mutex<Vec<Result<(), TransportError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(results: Vec<Result<(), TransportError>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl FileTransport for ScriptedTransport {
        async fn put(&self, _local: &Path) -> Result<(), TransportError> {
            *self.calls.lock().unwrap() += 1;
            self.results.lock().unwrap().remove(0)
        }
    }

    fn remote_config(attempts: i32) -> RemoteConfig {
        RemoteConfig {
            address: "files.example.com".to_string(),
            upload_attempts: attempts,
            report_partial_success: true,
            ..RemoteConfig::default()
        }
    }

    fn test_mailer() -> Mailer {
        // Mail disabled: enqueue() becomes a no-op but still records intent
        Mailer::new(&Config::default().mail, 240 * 60)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Other("connection reset".to_string())),
            Err(TransportError::Timeout),
            Err(TransportError::Other("connection reset".to_string())),
            Ok(()),
        ]));
        let uploader = RemoteUploader::with_transport(&remote_config(5), transport.clone());
        let mailer = test_mailer();

        uploader
            .upload(Path::new("/tmp/schedule.json"), &mailer)
            .await
            .unwrap();
        assert_eq!(transport.calls(), 4);
        assert!(!uploader.is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Other("down".to_string())),
            Err(TransportError::Other("down".to_string())),
            Err(TransportError::Other("down".to_string())),
        ]));
        let uploader = RemoteUploader::with_transport(&remote_config(3), transport.clone());
        let mailer = test_mailer();

        let err = uploader
            .upload(Path::new("/tmp/schedule.json"), &mailer)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::AttemptsExhausted { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_disables_session() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Auth(
            "Permission denied (publickey)".to_string(),
        ))]));
        let uploader = RemoteUploader::with_transport(&remote_config(5), transport.clone());
        let mailer = test_mailer();

        let err = uploader
            .upload(Path::new("/tmp/schedule.json"), &mailer)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::AuthenticationFailed { .. }));
        assert!(uploader.is_disabled());
        assert_eq!(transport.calls(), 1);

        // Subsequent uploads are refused without touching the transport
        let err = uploader
            .upload(Path::new("/tmp/schedule.json"), &mailer)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Disabled));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_is_a_no_op() {
        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let uploader = RemoteUploader::with_transport(&remote_config(0), transport.clone());
        let mailer = test_mailer();

        uploader
            .upload(Path::new("/tmp/schedule.json"), &mailer)
            .await
            .unwrap();
        assert_eq!(transport.calls(), 0);
    }
}
