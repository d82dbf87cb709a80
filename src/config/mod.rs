use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod defaults;

use crate::errors::{AppError, AppResult};
use defaults::*;

/// Environment variable naming the configuration file when no CLI
/// argument is given.
pub const CONFIG_ENV_VAR: &str = "STREAM_SENTRY_CONFIG";

/// Prefix for environment variable overrides of individual options,
/// e.g. `STREAM_SENTRY__MAIL__SERVER`.
const ENV_OVERRIDE_PREFIX: &str = "STREAM_SENTRY__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub cursor: CursorConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub misc: MiscConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Per-item encoder binary
    #[serde(default = "default_encoder_binary")]
    pub encoder_binary: String,
    /// Long-lived relay binary
    #[serde(default = "default_relay_binary")]
    pub relay_binary: String,
    /// Duration probe binary
    #[serde(default = "default_probe_binary")]
    pub probe_binary: String,
    /// Base directory for relative playlist paths
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    /// Playlist text file
    #[serde(default = "default_playlist")]
    pub playlist: PathBuf,
    /// Durable play cursor
    #[serde(default = "default_cursor_file")]
    pub cursor_file: PathBuf,
    /// Play history log; empty disables
    #[serde(default)]
    pub play_history_file: Option<PathBuf>,
    /// Schedule JSON output; empty disables schedule generation
    #[serde(default)]
    pub schedule_file: Option<PathBuf>,
    /// JSON map of display-name overrides
    #[serde(default)]
    pub alt_names_file: Option<PathBuf>,
    /// Append-mode log files for child process output
    #[serde(default)]
    pub encoder_log: Option<PathBuf>,
    #[serde(default)]
    pub relay_log: Option<PathBuf>,
    /// Duplicate error-and-above log lines into this file
    #[serde(default)]
    pub error_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Remote streaming endpoint, substituted into the relay template
    #[serde(default)]
    pub url: String,
    /// URLs probed to decide whether the stream endpoint is reachable
    #[serde(default)]
    pub probe_urls: Vec<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Strict probing fails on the first unreachable URL; lenient
    /// probing requires every URL to fail
    #[serde(default)]
    pub strict_probing: bool,
    /// Seconds of padding appended to each encoded item
    #[serde(default = "default_video_padding_secs")]
    pub video_padding_secs: u64,
    /// Encoder argument template; `{file}`, `{skip_time}` and
    /// `{video_padding}` are substituted per item
    #[serde(default = "default_encoder_args")]
    pub encoder_args: String,
    /// Relay argument template; `{stream_url}` is substituted once
    #[serde(default = "default_relay_args")]
    pub relay_args: String,
    /// Maximum uninterrupted stream duration; 0 disables the budget
    #[serde(default = "default_time_before_restart_mins")]
    pub time_before_restart_mins: u64,
    #[serde(default = "default_restart_wait_secs")]
    pub restart_wait_secs: u64,
    /// `%RESTART` directives are ignored within this much stream time
    #[serde(default = "default_restart_minimum_mins")]
    pub restart_minimum_mins: u64,
    /// Optional clip played just before a stream restart
    #[serde(default)]
    pub restart_before_video: Option<PathBuf>,
    /// Optional clip played just after a stream restart
    #[serde(default)]
    pub restart_after_video: Option<PathBuf>,
    #[serde(default = "default_wait_after_retry_secs")]
    pub wait_after_retry_secs: u64,
    /// Stop cleanly after the final playlist entry instead of looping
    #[serde(default)]
    pub stop_after_last_video: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// How often the play cursor is persisted while an item plays
    #[serde(default = "default_record_interval_secs")]
    pub record_interval_secs: u64,
    /// Seconds rewound when resuming after a retry or restart
    #[serde(default = "default_rewind_secs")]
    pub rewind_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_min_videos")]
    pub min_videos: usize,
    #[serde(default = "default_schedule_max_videos")]
    pub max_videos: usize,
    #[serde(default = "default_upcoming_length_mins")]
    pub upcoming_length_mins: u64,
    #[serde(default = "default_previous_min_videos")]
    pub previous_min_videos: usize,
    #[serde(default = "default_previous_max_videos")]
    pub previous_max_videos: usize,
    #[serde(default = "default_previous_length_mins")]
    pub previous_length_mins: u64,
    /// Tight pruning drops every stale previous item; loose pruning
    /// keeps one extra
    #[serde(default)]
    pub previous_prune_tight: bool,
    /// Case-insensitive display-name prefixes hidden from the schedule
    #[serde(default)]
    pub exclude_prefixes: Vec<String>,
    /// Items shorter than this are hidden from the schedule
    #[serde(default = "default_min_video_secs")]
    pub min_video_secs: u64,
    /// Display offset in minutes, passed through to schedule consumers
    #[serde(default)]
    pub offset_mins: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Missing-input retry attempts; 0 aborts or skips immediately,
    /// -1 retries forever
    #[serde(default = "default_retry_attempts")]
    pub attempts: i32,
    #[serde(default = "default_retry_period_secs")]
    pub period_secs: u64,
    /// Abort the program when an input file stays missing
    #[serde(default)]
    pub exit_on_file_not_found: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote host for schedule uploads; empty disables uploads
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub key_passphrase: String,
    /// Remote directory the schedule file is placed in
    #[serde(default)]
    pub directory: String,
    /// 0 = never attempt, negative = retry forever
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: i32,
    /// Send `remote_success_after_error` when an upload eventually
    /// succeeds after failed attempts
    #[serde(default)]
    pub report_partial_success: bool,
    /// Transfer binary driven as a child process
    #[serde(default = "default_transfer_binary")]
    pub transfer_binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Read login and password from the environment instead of this file
    #[serde(default)]
    pub use_env: bool,
    #[serde(default = "default_mail_env_prefix")]
    pub env_prefix: String,
    /// SSL-wrapped connection; mutually exclusive with `use_starttls`
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub use_starttls: bool,
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_mail_port")]
    pub port: u16,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
    /// Tag prepended to every subject line
    #[serde(default = "default_mail_program_name")]
    pub program_name: String,
    #[serde(default = "default_true")]
    pub alert_on_stream_down: bool,
    #[serde(default = "default_true")]
    pub alert_on_stream_resume: bool,
    #[serde(default = "default_true")]
    pub alert_on_file_not_found: bool,
    #[serde(default = "default_true")]
    pub alert_on_schedule_error: bool,
    #[serde(default = "default_true")]
    pub alert_on_remote_error: bool,
    #[serde(default = "default_true")]
    pub alert_on_playlist_loop: bool,
    #[serde(default = "default_true")]
    pub alert_on_playlist_stop: bool,
    #[serde(default = "default_true")]
    pub alert_on_mail_command: bool,
    #[serde(default = "default_true")]
    pub alert_on_new_version: bool,
    #[serde(default = "default_true")]
    pub alert_on_program_error: bool,
    /// Cap on the number of schedule errors quoted in one alert
    #[serde(default = "default_max_errors_reported")]
    pub max_errors_reported: usize,
    /// Days between periodic status reports; 0 disables
    #[serde(default)]
    pub status_report_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiscConfig {
    #[serde(default = "default_play_history_length")]
    pub play_history_length: usize,
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Window within which a second Ctrl-C exits instead of restarting
    #[serde(default = "default_manual_restart_delay_secs")]
    pub manual_restart_delay_secs: u64,
    #[serde(default)]
    pub version_check_interval: VersionCheckInterval,
}

/// Log verbosity, mapped onto a tracing filter in `main`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Silent,
    Fatal,
    Error,
    Warn,
    Notice,
    Play,
    #[default]
    Info,
    Verbose,
    Verbose2,
}

impl Verbosity {
    /// Tracing filter directive for this verbosity level.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Silent => "off",
            Self::Fatal | Self::Error => "error",
            Self::Warn => "warn",
            Self::Notice | Self::Play | Self::Info => "info",
            Self::Verbose => "debug",
            Self::Verbose2 => "trace",
        }
    }
}

/// How often to look for a newer release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionCheckInterval {
    Off,
    #[default]
    Daily,
    Weekly,
    Biweekly,
    Monthly,
}

impl VersionCheckInterval {
    /// Seconds between successful checks, or `None` when disabled.
    pub fn as_secs(self) -> Option<u64> {
        match self {
            Self::Off => None,
            Self::Daily => Some(86_400),
            Self::Weekly => Some(7 * 86_400),
            Self::Biweekly => Some(14 * 86_400),
            Self::Monthly => Some(30 * 86_400),
        }
    }
}

impl Config {
    /// Load configuration from the given TOML file, with
    /// `STREAM_SENTRY__`-prefixed environment variables taking
    /// precedence over file values.
    pub fn load_from_file(config_file: &str) -> AppResult<Self> {
        if !std::path::Path::new(config_file).exists() {
            return Err(AppError::configuration(format!(
                "config file '{config_file}' not found"
            )));
        }

        let config: Config = Figment::new()
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_OVERRIDE_PREFIX).split("__"))
            .extract()
            .map_err(|e| AppError::configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot possibly run.
    pub fn validate(&self) -> AppResult<()> {
        if self.stream.url.is_empty() {
            return Err(AppError::configuration(
                "stream.url is blank; enter a valid stream location",
            ));
        }

        if self.mail.enabled && self.mail.use_ssl && self.mail.use_starttls {
            return Err(AppError::configuration(
                "mail.use_ssl and mail.use_starttls are mutually exclusive",
            ));
        }

        if self.mail.enabled && self.mail.server.is_empty() {
            return Err(AppError::configuration(
                "mail.enabled is set but mail.server is blank",
            ));
        }

        for url in &self.stream.probe_urls {
            if reqwest::Url::parse(url).is_err() {
                return Err(AppError::configuration(format!(
                    "stream.probe_urls entry '{url}' is not a valid URL"
                )));
            }
        }

        if self.remote.enabled() && self.remote.key_file.is_none() && !self.remote.password.is_empty()
        {
            tracing::warn!(
                "remote.password is set but the {} transport only presents key files; \
                 configure remote.key_file",
                self.remote.transfer_binary
            );
        }

        Ok(())
    }

    /// Stream-time budget in seconds; 0 disables time-based restarts.
    pub fn time_before_restart_secs(&self) -> u64 {
        self.stream.time_before_restart_mins * 60
    }

    pub fn restart_minimum_secs(&self) -> u64 {
        self.stream.restart_minimum_mins * 60
    }

    pub fn upcoming_length_secs(&self) -> u64 {
        self.schedule.upcoming_length_mins * 60
    }

    pub fn previous_length_secs(&self) -> u64 {
        self.schedule.previous_length_mins * 60
    }

    /// Exclude prefixes, case-folded once for comparison.
    pub fn exclude_prefixes_folded(&self) -> Vec<String> {
        self.schedule
            .exclude_prefixes
            .iter()
            .map(|p| p.trim().to_lowercase().replace('\\', "/"))
            .filter(|p| !p.is_empty())
            .collect()
    }
}

impl RemoteConfig {
    /// Uploads are configured at all.
    pub fn enabled(&self) -> bool {
        !self.address.is_empty()
    }
}

impl MailConfig {
    /// Resolve login credentials, honouring the `use_env` toggle.
    pub fn credentials(&self) -> (String, String) {
        if self.use_env {
            let login = std::env::var(format!("{}LOGIN", self.env_prefix)).unwrap_or_default();
            let password =
                std::env::var(format!("{}PASSWORD", self.env_prefix)).unwrap_or_default();
            (login, password)
        } else {
            (self.login.clone(), self.password.clone())
        }
    }
}

// Serde default functions. These forward to the constants in `defaults`
// so that section structs stay readable.

fn default_true() -> bool {
    true
}

fn default_encoder_binary() -> String {
    DEFAULT_ENCODER_BINARY.to_string()
}

fn default_relay_binary() -> String {
    DEFAULT_RELAY_BINARY.to_string()
}

fn default_probe_binary() -> String {
    DEFAULT_PROBE_BINARY.to_string()
}

fn default_media_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MEDIA_DIR)
}

fn default_playlist() -> PathBuf {
    PathBuf::from(DEFAULT_PLAYLIST)
}

fn default_cursor_file() -> PathBuf {
    PathBuf::from(DEFAULT_CURSOR_FILE)
}

fn default_probe_interval_secs() -> u64 {
    DEFAULT_PROBE_INTERVAL_SECS
}

fn default_video_padding_secs() -> u64 {
    DEFAULT_VIDEO_PADDING_SECS
}

fn default_encoder_args() -> String {
    DEFAULT_ENCODER_ARGS.to_string()
}

fn default_relay_args() -> String {
    DEFAULT_RELAY_ARGS.to_string()
}

fn default_time_before_restart_mins() -> u64 {
    DEFAULT_TIME_BEFORE_RESTART_MINS
}

fn default_restart_wait_secs() -> u64 {
    DEFAULT_RESTART_WAIT_SECS
}

fn default_restart_minimum_mins() -> u64 {
    DEFAULT_RESTART_MINIMUM_MINS
}

fn default_wait_after_retry_secs() -> u64 {
    DEFAULT_WAIT_AFTER_RETRY_SECS
}

fn default_record_interval_secs() -> u64 {
    DEFAULT_RECORD_INTERVAL_SECS
}

fn default_rewind_secs() -> u64 {
    DEFAULT_REWIND_SECS
}

fn default_schedule_min_videos() -> usize {
    DEFAULT_SCHEDULE_MIN_VIDEOS
}

fn default_schedule_max_videos() -> usize {
    DEFAULT_SCHEDULE_MAX_VIDEOS
}

fn default_upcoming_length_mins() -> u64 {
    DEFAULT_UPCOMING_LENGTH_MINS
}

fn default_previous_min_videos() -> usize {
    DEFAULT_PREVIOUS_MIN_VIDEOS
}

fn default_previous_max_videos() -> usize {
    DEFAULT_PREVIOUS_MAX_VIDEOS
}

fn default_previous_length_mins() -> u64 {
    DEFAULT_PREVIOUS_LENGTH_MINS
}

fn default_min_video_secs() -> u64 {
    DEFAULT_MIN_VIDEO_SECS
}

fn default_retry_attempts() -> i32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_period_secs() -> u64 {
    DEFAULT_RETRY_PERIOD_SECS
}

fn default_remote_port() -> u16 {
    DEFAULT_REMOTE_PORT
}

fn default_upload_attempts() -> i32 {
    DEFAULT_UPLOAD_ATTEMPTS
}

fn default_transfer_binary() -> String {
    DEFAULT_TRANSFER_BINARY.to_string()
}

fn default_mail_env_prefix() -> String {
    DEFAULT_MAIL_ENV_PREFIX.to_string()
}

fn default_mail_port() -> u16 {
    DEFAULT_MAIL_PORT
}

fn default_mail_program_name() -> String {
    DEFAULT_MAIL_PROGRAM_NAME.to_string()
}

fn default_max_errors_reported() -> usize {
    DEFAULT_MAX_ERRORS_REPORTED
}

fn default_play_history_length() -> usize {
    DEFAULT_PLAY_HISTORY_LENGTH
}

fn default_manual_restart_delay_secs() -> u64 {
    DEFAULT_MANUAL_RESTART_DELAY_SECS
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            encoder_binary: default_encoder_binary(),
            relay_binary: default_relay_binary(),
            probe_binary: default_probe_binary(),
            media_dir: default_media_dir(),
            playlist: default_playlist(),
            cursor_file: default_cursor_file(),
            play_history_file: None,
            schedule_file: None,
            alt_names_file: None,
            encoder_log: None,
            relay_log: None,
            error_log: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            probe_urls: Vec::new(),
            probe_interval_secs: default_probe_interval_secs(),
            strict_probing: false,
            video_padding_secs: default_video_padding_secs(),
            encoder_args: default_encoder_args(),
            relay_args: default_relay_args(),
            time_before_restart_mins: default_time_before_restart_mins(),
            restart_wait_secs: default_restart_wait_secs(),
            restart_minimum_mins: default_restart_minimum_mins(),
            restart_before_video: None,
            restart_after_video: None,
            wait_after_retry_secs: default_wait_after_retry_secs(),
            stop_after_last_video: false,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            record_interval_secs: default_record_interval_secs(),
            rewind_secs: default_rewind_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_videos: default_schedule_min_videos(),
            max_videos: default_schedule_max_videos(),
            upcoming_length_mins: default_upcoming_length_mins(),
            previous_min_videos: default_previous_min_videos(),
            previous_max_videos: default_previous_max_videos(),
            previous_length_mins: default_previous_length_mins(),
            previous_prune_tight: false,
            exclude_prefixes: Vec::new(),
            min_video_secs: default_min_video_secs(),
            offset_mins: 0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            period_secs: default_retry_period_secs(),
            exit_on_file_not_found: false,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            password: String::new(),
            port: default_remote_port(),
            key_file: None,
            key_passphrase: String::new(),
            directory: String::new(),
            upload_attempts: default_upload_attempts(),
            report_partial_success: false,
            transfer_binary: default_transfer_binary(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            use_env: false,
            env_prefix: default_mail_env_prefix(),
            use_ssl: false,
            use_starttls: false,
            server: String::new(),
            port: default_mail_port(),
            login: String::new(),
            password: String::new(),
            from_address: String::new(),
            to_address: String::new(),
            program_name: default_mail_program_name(),
            alert_on_stream_down: true,
            alert_on_stream_resume: true,
            alert_on_file_not_found: true,
            alert_on_schedule_error: true,
            alert_on_remote_error: true,
            alert_on_playlist_loop: true,
            alert_on_playlist_stop: true,
            alert_on_mail_command: true,
            alert_on_new_version: true,
            alert_on_program_error: true,
            max_errors_reported: default_max_errors_reported(),
            status_report_days: 0,
        }
    }
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            play_history_length: default_play_history_length(),
            verbosity: Verbosity::default(),
            manual_restart_delay_secs: default_manual_restart_delay_secs(),
            version_check_interval: VersionCheckInterval::default(),
        }
    }
}
