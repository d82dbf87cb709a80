//! Error type definitions for stream-sentry

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application error type
///
/// Represents all errors that can escape a component. Uses `thiserror` for
/// automatic trait implementations and error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Playlist loading and parsing errors
    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    /// Media probing errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Mail dispatcher errors
    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    /// Remote upload errors
    #[error("Remote upload error: {0}")]
    Remote(#[from] RemoteError),

    /// Stream supervision errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// I/O errors from durable state files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Playlist loading and parsing errors
#[derive(Error, Debug)]
pub enum PlaylistError {
    /// The playlist file does not exist
    #[error("Playlist file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// The playlist contains no lines at all
    #[error("No entries found in playlist {path}")]
    Empty { path: String },

    /// A `%` line names a directive this program does not know
    #[error("Line {line}: unrecognized playlist directive {directive}")]
    UnknownDirective { line: u32, directive: String },

    /// Errors reading the playlist or alternate-names file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Media duration probing errors
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The input file does not exist
    #[error("File not found: {path}")]
    Missing { path: PathBuf },

    /// The file was probed but has no video track
    #[error("No video track in {path}")]
    NoVideoTrack { path: PathBuf },

    /// The probe process failed or produced unusable output
    #[error("Probe failed for {path}: {message}")]
    Failed { path: PathBuf, message: String },

    /// The probe process did not finish in time
    #[error("Probe timed out for {path}")]
    Timeout { path: PathBuf },
}

/// Mail dispatcher errors
#[derive(Error, Debug)]
pub enum MailError {
    /// Contradictory or unusable mail configuration
    #[error("Mail configuration error: {message}")]
    Config { message: String },
}

/// Remote upload errors
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The remote host rejected our credentials; uploads are disabled
    /// for the rest of the session
    #[error("Remote authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// All attempts exhausted
    #[error("Upload failed after {attempts} attempts: {message}")]
    AttemptsExhausted { attempts: u32, message: String },

    /// Uploads have been disabled after an authentication failure
    #[error("Remote uploads are disabled")]
    Disabled,
}

/// Stream supervision errors
///
/// `RelayExited`, `ConnectionLost`, `ManualRestart` and
/// `PlaylistException` are recoverable: the supervisor tears the stream
/// down and restarts it. The remaining variants are fatal.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The relay child exited while an item was playing
    #[error("Relay process exited unexpectedly (exit code {code:?})")]
    RelayExited { code: Option<i32> },

    /// A connection probe reported the stream endpoint unreachable
    #[error("Connection check failed")]
    ConnectionLost,

    /// The operator pressed Ctrl-C once
    #[error("Manual restart requested")]
    ManualRestart,

    /// A `%EXCEPTION` directive was reached
    #[error("Line {line}: synthetic exception raised by playlist directive")]
    PlaylistException { line: u32 },

    /// An input file stayed missing and the retry policy says to abort
    #[error("Line {line}: {path} not found")]
    InputMissing { line: u32, path: PathBuf },

    /// A subprocess could not be spawned at all
    #[error("Failed to start {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// An argument template substitution produced an empty command line
    #[error("Argument template for {name} produced no command")]
    EmptyCommand { name: &'static str },
}

impl StreamError {
    /// Whether the supervisor should attempt failure recovery rather
    /// than propagate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RelayExited { .. }
                | Self::ConnectionLost
                | Self::ManualRestart
                | Self::PlaylistException { .. }
        )
    }

    /// Whether this failure should produce a `stream_down` alert.
    /// Connection-probe failures and manual restarts never alert.
    pub fn alerts_stream_down(&self) -> bool {
        matches!(self, Self::RelayExited { .. } | Self::PlaylistException { .. })
    }
}
