//! E-mail alert dispatcher
//!
//! Alerts are typed; each type knows its subject, body, default priority
//! and dedup key. Non-urgent alerts go through a bounded priority queue
//! drained by a background worker; urgent alerts are sent synchronously
//! on the caller's task. A given alert type is sent at most once per
//! dedup window unless the caller bypasses the interval.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::Mailbox,
    transport::smtp::authentication::Credentials,
};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

use crate::config::MailConfig;
use crate::errors::MailError;
use crate::services::version_check::ReleaseInfo;
use crate::utils::format_span;

/// Queue capacity. On overflow a new urgent alert displaces the oldest
/// non-urgent one; anything else is dropped.
const QUEUE_CAPACITY: usize = 100;

/// Connect+send attempts per message.
const SEND_ATTEMPTS: u32 = 3;

const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after each successful send, so bursts don't hammer the server.
const SEND_PACING: Duration = Duration::from_secs(5);

/// Default per-type dedup window.
const DEDUP_WINDOW: Duration = Duration::from_secs(3600);

const WORKER_BACKOFF_START: Duration = Duration::from_secs(1);
const WORKER_BACKOFF_CAP: Duration = Duration::from_secs(128);

pub const PRIORITY_URGENT: u8 = 0;
pub const PRIORITY_RETRIED: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 10;

/// Everything the operator can be alerted about.
#[derive(Debug, Clone)]
pub enum Alert {
    /// The relay died or the encoder exhausted its retries
    StreamDown {
        reason: String,
        when: DateTime<Utc>,
    },
    /// The stream resumed after a failure
    StreamResume {
        exception_time: DateTime<Utc>,
        downtime_secs: u64,
    },
    /// An input file is missing and infinite retries are configured
    FileRetry { path: String, line: Option<u32> },
    /// An input file is missing and the entry was skipped
    FileNotFound { path: String, line: Option<u32> },
    /// Errors were recorded during schedule generation
    ScheduleError {
        errors: Vec<String>,
        total: usize,
    },
    /// An unrecoverable error is taking the program down
    ProgramError {
        message: String,
        total_runtime_secs: u64,
    },
    /// Schedule upload failed after all attempts
    RemoteError { message: String, attempts: u32 },
    /// The remote host rejected our credentials
    RemoteAuthFailed { message: String },
    /// Schedule upload succeeded after failed attempts
    RemoteSuccessAfterError { attempts: u32 },
    /// The playlist wrapped around to its first entry
    PlaylistLoop,
    /// A `%STOP` directive was reached
    PlaylistStop { line: u32 },
    /// The playlist ran out with stop-after-last enabled
    PlaylistEnd,
    /// A `%MAIL` directive was reached
    MailCommand { line: u32, text: Option<String> },
    /// The version prober found a newer release
    NewVersion { release: ReleaseInfo },
    /// Periodic status report
    StatusReport { report: String },
}

impl Alert {
    /// Stable key used for per-type deduplication and enable flags.
    pub fn type_key(&self) -> &'static str {
        match self {
            Self::StreamDown { .. } => "stream_down",
            Self::StreamResume { .. } => "stream_resume",
            Self::FileRetry { .. } => "file_retry",
            Self::FileNotFound { .. } => "file_not_found",
            Self::ScheduleError { .. } => "schedule_error",
            Self::ProgramError { .. } => "program_error",
            Self::RemoteError { .. } => "remote_error",
            Self::RemoteAuthFailed { .. } => "remote_auth_failed",
            Self::RemoteSuccessAfterError { .. } => "remote_success_after_error",
            Self::PlaylistLoop => "playlist_loop",
            Self::PlaylistStop { .. } => "playlist_stop",
            Self::PlaylistEnd => "playlist_end",
            Self::MailCommand { .. } => "mail_command",
            Self::NewVersion { .. } => "new_version",
            Self::StatusReport { .. } => "status_report",
        }
    }

    /// Default queue priority. 0 is urgent, 1 retried, 10 normal.
    pub fn priority(&self) -> u8 {
        match self {
            Self::StreamDown { .. }
            | Self::FileRetry { .. }
            | Self::FileNotFound { .. }
            | Self::ScheduleError { .. }
            | Self::ProgramError { .. }
            | Self::RemoteError { .. }
            | Self::RemoteAuthFailed { .. }
            | Self::RemoteSuccessAfterError { .. }
            | Self::PlaylistStop { .. }
            | Self::PlaylistEnd => PRIORITY_URGENT,
            Self::StreamResume { .. }
            | Self::PlaylistLoop
            | Self::MailCommand { .. }
            | Self::NewVersion { .. }
            | Self::StatusReport { .. } => PRIORITY_NORMAL,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Self::StreamDown { .. } => "Stream offline".to_string(),
            Self::StreamResume { .. } => "Stream resumed".to_string(),
            Self::FileRetry { .. } => "Waiting for missing file".to_string(),
            Self::FileNotFound { .. } => "File not found".to_string(),
            Self::ScheduleError { .. } => "Schedule generation errors".to_string(),
            Self::ProgramError { .. } => "Program error".to_string(),
            Self::RemoteError { .. } => "Schedule upload failed".to_string(),
            Self::RemoteAuthFailed { .. } => {
                "Schedule upload authentication failed".to_string()
            }
            Self::RemoteSuccessAfterError { .. } => "Schedule upload recovered".to_string(),
            Self::PlaylistLoop => "Playlist looped".to_string(),
            Self::PlaylistStop { .. } => "Playlist stopped".to_string(),
            Self::PlaylistEnd => "Playlist ended".to_string(),
            Self::MailCommand { .. } => "%MAIL command".to_string(),
            Self::NewVersion { release } => {
                format!("New version available: {}", release.tag)
            }
            Self::StatusReport { .. } => "Status report".to_string(),
        }
    }

    pub fn body(&self, program_name: &str) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S");
        match self {
            Self::StreamDown { reason, when } => format!(
                "The stream went offline due to an error at {}.{}",
                when.format("%Y-%m-%d %H:%M:%S"),
                if reason.is_empty() {
                    String::new()
                } else {
                    format!(" Reason: {reason}")
                }
            ),
            Self::StreamResume {
                exception_time,
                downtime_secs,
            } => format!(
                "The stream reconnected at {now}. It went down at {} and was offline for {}.",
                exception_time.format("%Y-%m-%d %H:%M:%S"),
                format_span(*downtime_secs)
            ),
            Self::FileRetry { path, line } => format!(
                "{}{path} was not found at {now}. {program_name} will keep retrying until it \
                 appears.",
                line_prefix(*line)
            ),
            Self::FileNotFound { path, line } => format!(
                "{}{path} was not found at {now}. The entry has been skipped.",
                line_prefix(*line)
            ),
            Self::ScheduleError { errors, total } => {
                let mut body = format!(
                    "{total} error(s) occurred while generating the schedule at {now}:\n\n"
                );
                for error in errors {
                    body.push_str(error);
                    body.push('\n');
                }
                if *total > errors.len() {
                    body.push_str(&format!("...and {} more.\n", total - errors.len()));
                }
                body
            }
            Self::ProgramError {
                message,
                total_runtime_secs,
            } => format!(
                "{program_name} exited at {now} due to an unrecoverable error: \
                 {message}\n\n{program_name} ran for {}.",
                format_span(*total_runtime_secs)
            ),
            Self::RemoteError { message, attempts } => format!(
                "The schedule upload failed after {attempts} attempt(s) at {now}: {message}"
            ),
            Self::RemoteAuthFailed { message } => format!(
                "The remote host rejected the upload credentials at {now}: {message}\n\n\
                 Schedule uploads are disabled until {program_name} is restarted."
            ),
            Self::RemoteSuccessAfterError { attempts } => format!(
                "The schedule upload succeeded at {now} after {attempts} attempt(s)."
            ),
            Self::PlaylistLoop => format!("The playlist looped at {now}."),
            Self::PlaylistStop { line } => format!(
                "The playlist reached a %STOP command on line {line} at {now}, and \
                 {program_name} has exited."
            ),
            Self::PlaylistEnd => format!(
                "The playlist reached its final entry at {now} and stop-after-last is \
                 enabled. {program_name} has exited."
            ),
            Self::MailCommand { line, text } => format!(
                "The playlist reached a %MAIL command on line {line} at {now}.{}",
                match text {
                    Some(text) => format!(" The message is:\n\n{text}"),
                    None => String::new(),
                }
            ),
            Self::NewVersion { release } => format!(
                "{}{} is available at {}.\n\n{}",
                release.name,
                if release.is_prerelease {
                    " (prerelease)"
                } else {
                    ""
                },
                release.url,
                release.notes
            ),
            Self::StatusReport { report } => report.clone(),
        }
    }
}

fn line_prefix(line: Option<u32>) -> String {
    match line {
        Some(line) => format!("Line {line}: "),
        None => String::new(),
    }
}

/// A queued alert. Ordering is ascending priority, FIFO within a
/// priority via the sequence number.
#[derive(Debug)]
struct QueuedAlert {
    priority: u8,
    seq: u64,
    bypass_interval: bool,
    alert: Alert,
}

impl PartialEq for QueuedAlert {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedAlert {}

impl PartialOrd for QueuedAlert {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAlert {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

/// Bounded priority queue with the urgent-displacement overflow policy.
#[derive(Debug, Default)]
struct AlertQueue {
    heap: BinaryHeap<Reverse<QueuedAlert>>,
    seq: u64,
}

impl AlertQueue {
    /// Push an alert, applying the overflow policy. Returns false when
    /// the alert had to be discarded.
    fn push(&mut self, alert: Alert, priority: u8, bypass_interval: bool) -> bool {
        if self.heap.len() >= QUEUE_CAPACITY {
            if priority == PRIORITY_URGENT {
                if !self.evict_oldest_non_urgent() {
                    error!(
                        "Alert queue is full of urgent messages; \"{}\" discarded",
                        alert.subject()
                    );
                    return false;
                }
            } else {
                error!("Alert queue is full; \"{}\" discarded", alert.subject());
                return false;
            }
        }

        self.seq += 1;
        self.heap.push(Reverse(QueuedAlert {
            priority,
            seq: self.seq,
            bypass_interval,
            alert,
        }));
        true
    }

    fn pop(&mut self) -> Option<QueuedAlert> {
        self.heap.pop().map(|Reverse(item)| item)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn clear(&mut self) {
        self.heap.clear();
    }

    /// Drop the earliest-enqueued non-urgent alert to make room.
    fn evict_oldest_non_urgent(&mut self) -> bool {
        let mut items: Vec<QueuedAlert> =
            self.heap.drain().map(|Reverse(item)| item).collect();
        let victim = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.priority != PRIORITY_URGENT)
            .min_by_key(|(_, item)| item.seq)
            .map(|(index, _)| index);

        let evicted = match victim {
            Some(index) => {
                let item = items.swap_remove(index);
                error!(
                    "Alert queue overflow: discarding \"{}\" for an urgent message",
                    item.alert.subject()
                );
                true
            }
            None => false,
        };

        self.heap.extend(items.into_iter().map(Reverse));
        evicted
    }
}

struct MailerState {
    queue: AlertQueue,
    last_sent: HashMap<&'static str, DateTime<Utc>>,
}

struct MailerInner {
    config: MailConfig,
    login: String,
    password: String,
    schedule_error_window: Duration,
    state: Mutex<MailerState>,
    notify: Notify,
    running: AtomicBool,
}

/// Outcome classification for one send.
enum SendFailure {
    Auth,
    Other(String),
}

/// Handle to the alert dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Mailer {
    inner: Arc<MailerInner>,
}

impl Mailer {
    /// Build a dispatcher. `upcoming_length_secs` feeds the longer
    /// `schedule_error` dedup window (upcoming length minus one hour,
    /// floored at zero).
    pub fn new(config: &MailConfig, upcoming_length_secs: u64) -> Self {
        let (login, password) = config.credentials();
        let schedule_error_window =
            Duration::from_secs(upcoming_length_secs.saturating_sub(3600));

        Self {
            inner: Arc::new(MailerInner {
                config: config.clone(),
                login,
                password,
                schedule_error_window,
                state: Mutex::new(MailerState {
                    queue: AlertQueue::default(),
                    last_sent: HashMap::new(),
                }),
                notify: Notify::new(),
                running: AtomicBool::new(config.enabled),
            }),
        }
    }

    /// Whether alerts are currently being dispatched.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether alerts of this type are enabled by configuration.
    pub fn event_enabled(&self, alert: &Alert) -> bool {
        let mail = &self.inner.config;
        match alert {
            Alert::StreamDown { .. } => mail.alert_on_stream_down,
            Alert::StreamResume { .. } => mail.alert_on_stream_resume,
            Alert::FileRetry { .. } | Alert::FileNotFound { .. } => mail.alert_on_file_not_found,
            Alert::ScheduleError { .. } => mail.alert_on_schedule_error,
            Alert::ProgramError { .. } => mail.alert_on_program_error,
            Alert::RemoteError { .. }
            | Alert::RemoteAuthFailed { .. }
            | Alert::RemoteSuccessAfterError { .. } => mail.alert_on_remote_error,
            Alert::PlaylistLoop => mail.alert_on_playlist_loop,
            Alert::PlaylistStop { .. } | Alert::PlaylistEnd => mail.alert_on_playlist_stop,
            Alert::MailCommand { .. } => mail.alert_on_mail_command,
            Alert::NewVersion { .. } => mail.alert_on_new_version,
            Alert::StatusReport { .. } => mail.status_report_days > 0,
        }
    }

    /// Queue an alert for the background worker.
    pub async fn enqueue(&self, alert: Alert, bypass_interval: bool) {
        if !self.is_running() || !self.event_enabled(&alert) {
            debug!("Alert {} not sent: mail alerts disabled", alert.type_key());
            return;
        }

        let priority = alert.priority();
        let mut state = self.inner.state.lock().await;
        if state.queue.push(alert, priority, bypass_interval) {
            self.inner.notify.notify_one();
        }
    }

    /// Send an alert synchronously on the caller's task, bypassing the
    /// queue and the dedup window.
    pub async fn send_urgent(&self, alert: Alert) {
        if !self.is_running() || !self.event_enabled(&alert) {
            debug!("Urgent alert {} not sent: mail alerts disabled", alert.type_key());
            return;
        }

        let type_key = alert.type_key();
        match self.send_with_retries(&alert).await {
            Ok(()) => {
                let mut state = self.inner.state.lock().await;
                state.last_sent.insert(type_key, Utc::now());
            }
            Err(SendFailure::Auth) => self.disable().await,
            Err(SendFailure::Other(message)) => {
                error!("Failed to send urgent alert {type_key}: {message}");
            }
        }
    }

    /// Start the background worker. Call once after construction.
    pub fn spawn_worker(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.is_running() {
            return None;
        }
        let mailer = self.clone();
        Some(tokio::spawn(async move { mailer.run_worker().await }))
    }

    /// Attempt one SMTP login and report whether it worked. Failure
    /// does not disable the dispatcher unless it was an authentication
    /// rejection; later sends re-probe on demand.
    pub async fn test_login(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        for attempt in 1..=SEND_ATTEMPTS {
            let transport = match self.build_transport() {
                Ok(transport) => transport,
                Err(e) => {
                    error!("Mail configuration error: {e}");
                    return false;
                }
            };

            match transport.test_connection().await {
                Ok(true) => return true,
                Ok(false) => {
                    warn!("Mail server {} refused the connection", self.inner.config.server)
                }
                Err(e) if is_auth_error(&e) => {
                    error!(
                        "Failed to login to mail server {}: {e}",
                        self.inner.config.server
                    );
                    error!("Mail features disabled.");
                    self.disable().await;
                    return false;
                }
                Err(e) => warn!("Login attempt {attempt} failed: {e}"),
            }
        }

        error!(
            "Login test to mail server {} failed after {SEND_ATTEMPTS} attempts",
            self.inner.config.server
        );
        false
    }

    /// Stop the worker and drop any queued alerts.
    pub async fn stop(&self) {
        self.disable().await;
    }

    async fn disable(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        state.queue.clear();
        state.last_sent.clear();
        self.inner.notify.notify_one();
    }

    async fn run_worker(&self) {
        let mut backoff = WORKER_BACKOFF_START;

        while self.is_running() {
            let item = { self.inner.state.lock().await.queue.pop() };

            let Some(item) = item else {
                // Wake on new work or recheck the running flag shortly.
                tokio::select! {
                    _ = self.inner.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            };

            let type_key = item.alert.type_key();
            let last = {
                let state = self.inner.state.lock().await;
                state.last_sent.get(type_key).copied()
            };
            if !dedup_allows(last, Utc::now(), self.dedup_window(type_key), item.bypass_interval)
            {
                debug!(
                    "Alert {type_key} not sent: inside the {} dedup window (last sent {})",
                    format_span(self.dedup_window(type_key).as_secs()),
                    last.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default()
                );
                continue;
            }

            match self.send_with_retries(&item.alert).await {
                Ok(()) => {
                    {
                        let mut state = self.inner.state.lock().await;
                        state.last_sent.insert(type_key, Utc::now());
                    }
                    backoff = WORKER_BACKOFF_START;
                    tokio::time::sleep(SEND_PACING).await;
                }
                Err(SendFailure::Auth) => {
                    self.disable().await;
                    break;
                }
                Err(SendFailure::Other(message)) => {
                    warn!("Alert {type_key} failed, requeueing: {message}");
                    {
                        let mut state = self.inner.state.lock().await;
                        state.queue.push(item.alert, PRIORITY_RETRIED, item.bypass_interval);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(WORKER_BACKOFF_CAP);
                }
            }
        }
    }

    fn dedup_window(&self, type_key: &str) -> Duration {
        if type_key == "schedule_error" {
            self.inner.schedule_error_window
        } else {
            DEDUP_WINDOW
        }
    }

    async fn send_with_retries(&self, alert: &Alert) -> Result<(), SendFailure> {
        let subject = alert.subject();
        let mut last_error = String::new();

        for attempt in 1..=SEND_ATTEMPTS {
            let message = match self.build_message(alert) {
                Ok(message) => message,
                Err(e) => return Err(SendFailure::Other(e.to_string())),
            };
            let transport = match self.build_transport() {
                Ok(transport) => transport,
                Err(e) => return Err(SendFailure::Other(e.to_string())),
            };

            match transport.send(message).await {
                Ok(_) => {
                    debug!("Sent e-mail: \"{subject}\"");
                    return Ok(());
                }
                Err(e) if is_auth_error(&e) => {
                    error!(
                        "Failed to login to mail server {}: {e}",
                        self.inner.config.server
                    );
                    error!("Mail features disabled.");
                    return Err(SendFailure::Auth);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!("Attempt {attempt} to send \"{subject}\" failed: {e}");
                }
            }
        }

        error!("Failed to send e-mail \"{subject}\" after {SEND_ATTEMPTS} attempts");
        Err(SendFailure::Other(last_error))
    }

    fn build_message(&self, alert: &Alert) -> Result<Message, MailError> {
        let config = &self.inner.config;
        let from: Mailbox = config.from_address.parse().map_err(|e| MailError::Config {
            message: format!("invalid from address '{}': {e}", config.from_address),
        })?;
        let to: Mailbox = config.to_address.parse().map_err(|e| MailError::Config {
            message: format!("invalid to address '{}': {e}", config.to_address),
        })?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(format!("[{}] {}", config.program_name, alert.subject()))
            .body(alert.body(&config.program_name))
            .map_err(|e| MailError::Config {
                message: format!("failed to build message: {e}"),
            })
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
        let config = &self.inner.config;

        // SSL and STARTTLS together is a configuration error; this is
        // also rejected at startup validation.
        if config.use_ssl && config.use_starttls {
            return Err(MailError::Config {
                message: "use_ssl and use_starttls are mutually exclusive".to_string(),
            });
        }

        let builder = if config.use_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                &config.server,
            ))
        }
        .map_err(|e| MailError::Config {
            message: format!("failed to create SMTP transport: {e}"),
        })?;

        let mut builder = builder.port(config.port).timeout(Some(SMTP_TIMEOUT));
        if !self.inner.login.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.inner.login.clone(),
                self.inner.password.clone(),
            ));
        }

        Ok(builder.build())
    }
}

/// Whether a non-bypassed send of this alert type is allowed now.
fn dedup_allows(
    last_sent: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
    bypass_interval: bool,
) -> bool {
    if bypass_interval {
        return true;
    }
    match last_sent {
        Some(last) => (now - last).num_seconds().max(0) as u64 >= window.as_secs(),
        None => true,
    }
}

/// Whether an SMTP error means the server rejected our credentials.
fn is_auth_error(err: &lettre::transport::smtp::Error) -> bool {
    if !err.is_permanent() {
        return false;
    }
    let text = err.to_string().to_lowercase();
    text.contains("auth") || text.contains("535") || text.contains("534")
}
