//! Runtime statistics and durable playback state
//!
//! `StreamStats` is the single shared record of what the stream has been
//! doing: counters, timers, the recent-exception log and the schedule
//! history deques. `PlayCursor` persists `(play index, elapsed seconds)`
//! across crashes; `PlayHistory` keeps a short human-readable log of what
//! was played when.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::Config;
use crate::schedule::ScheduleItem;

/// Cap on the recent-exception deque.
const MAX_RECENT_EXCEPTIONS: usize = 32;

/// One recorded failure: what kind, and when it happened.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub kind: String,
    pub when: DateTime<Utc>,
}

/// Process-wide stream statistics. Single owner behind a mutex; the
/// supervisor mutates, the schedule generator and mailer read.
#[derive(Debug)]
pub struct StreamStats {
    /// The time this program was started, in UTC
    pub program_start_time: DateTime<Utc>,
    /// The time the current stream session was started, set after each
    /// relay start
    pub stream_start_time: DateTime<Utc>,
    /// Seconds the current video has been playing
    pub elapsed_time: u64,
    /// Videos played since program start or the last relay restart
    pub videos_since_restart: u32,
    /// Videos played to completion since program start
    pub total_videos: u64,
    /// Normal restarts: time-based, `%RESTART`/`%INSTANT_RESTART`, Ctrl-C
    pub restarts: u64,
    /// Unexpected interruptions that were recovered from
    pub retries: u64,
    /// Cumulative seconds of downtime caused by stream errors
    pub stream_downtime: u64,
    /// Floor below which rewinds must not go after a failure; cleared
    /// on successful encoder exit
    pub video_resume_point: u64,
    /// Seconds left before an automatic time-based restart
    pub stream_time_remaining: i64,
    /// A retry or failure recovery happened and the next successful
    /// playback should announce the resume
    pub retried: bool,
    /// Recent failures, newest last
    pub exceptions: VecDeque<ExceptionRecord>,
    /// When the most recent stream-interrupting failure happened
    pub last_exception_time: DateTime<Utc>,
    /// The most recent internet connection check
    pub last_connection_check: DateTime<Utc>,
    /// Deadline for the next version check
    pub next_version_check: DateTime<Utc>,
    /// Most recent release tag observed by the version prober
    pub newest_version: String,
    /// Deadline for the next periodic status report, if enabled
    pub next_status_report: Option<DateTime<Utc>>,
    /// Schedule records emitted by the most recent generation
    pub recent_playlist: VecDeque<ScheduleItem>,
    /// Records that have scrolled off the top of `coming_up_next`;
    /// `None` when the previous-files feature is disabled
    pub previous_files: Option<VecDeque<ScheduleItem>>,
}

impl StreamStats {
    pub fn new(config: &Config) -> Self {
        let now = Utc::now();
        let previous_files = if config.schedule.previous_min_videos >= 1
            && config.schedule.previous_max_videos >= 1
            && config.schedule.previous_length_mins >= 1
        {
            Some(VecDeque::new())
        } else {
            None
        };

        let status_report_secs = config.mail.status_report_days * 86_400;
        let next_status_report = (config.mail.enabled && status_report_secs > 0)
            .then(|| now + ChronoDuration::seconds(status_report_secs as i64));

        Self {
            program_start_time: now,
            stream_start_time: now,
            elapsed_time: 0,
            videos_since_restart: 0,
            total_videos: 0,
            restarts: 0,
            retries: 0,
            stream_downtime: 0,
            video_resume_point: 0,
            stream_time_remaining: config.time_before_restart_secs() as i64,
            retried: false,
            exceptions: VecDeque::new(),
            last_exception_time: now,
            // Backdated so the first probe is allowed immediately
            last_connection_check: now
                - ChronoDuration::seconds(config.stream.probe_interval_secs as i64),
            next_version_check: now,
            newest_version: env!("CARGO_PKG_VERSION").to_string(),
            next_status_report,
            recent_playlist: VecDeque::new(),
            previous_files,
        }
    }

    /// Subtract `seconds` from `elapsed_time` without going below 0.
    pub fn rewind(&mut self, seconds: u64) {
        self.elapsed_time = self.elapsed_time.saturating_sub(seconds);
    }

    /// Record a failure in the bounded exception deque and remember its
    /// time for downtime accounting.
    pub fn note_exception(&mut self, kind: impl Into<String>) {
        let when = Utc::now();
        self.last_exception_time = when;
        self.exceptions.push_back(ExceptionRecord {
            kind: kind.into(),
            when,
        });
        while self.exceptions.len() > MAX_RECENT_EXCEPTIONS {
            self.exceptions.pop_front();
        }
    }

    pub fn note_restart(&mut self) {
        self.restarts += 1;
    }

    pub fn note_retry(&mut self) {
        self.retries += 1;
        self.retried = true;
    }

    /// Add the span since the last exception to the downtime counter.
    pub fn update_downtime(&mut self) {
        let downtime = (Utc::now() - self.last_exception_time).num_seconds().max(0);
        self.stream_downtime += downtime as u64;
    }

    pub fn set_connection_check_time(&mut self) {
        self.last_connection_check = Utc::now();
    }

    /// Backdate the last check so the next connection probe runs
    /// immediately.
    pub fn force_connection_check(&mut self, probe_interval_secs: u64) {
        self.last_connection_check =
            Utc::now() - ChronoDuration::seconds(probe_interval_secs as i64);
    }

    /// Seconds since program start.
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.program_start_time).num_seconds().max(0) as u64
    }
}

/// The durable play cursor: `(play index, elapsed seconds)` as two
/// integer lines. Only the supervisor writes it.
#[derive(Debug, Clone)]
pub struct PlayCursor {
    path: PathBuf,
}

impl PlayCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the cursor. A missing file is created as `(0, 0)`;
    /// unreadable fields individually default to 0.
    pub fn load(&self) -> std::io::Result<(usize, u64)> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.store(0, 0)?;
                return Ok((0, 0));
            }
            Err(e) => return Err(e),
        };

        let mut lines = raw.lines();
        let index = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .unwrap_or(0);
        let elapsed = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .unwrap_or(0);
        Ok((index, elapsed))
    }

    /// Persist the cursor crash-safely: write a temporary sibling, then
    /// rename over the real file.
    pub fn store(&self, index: usize, elapsed: u64) -> std::io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            write!(tmp, "{index}\n{elapsed}")?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)
    }
}

/// Bounded play-history log: one `timestamp - text` line per event,
/// truncated to the most recent `max_lines`.
#[derive(Debug, Clone)]
pub struct PlayHistory {
    path: PathBuf,
    max_lines: usize,
}

impl PlayHistory {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_lines,
        }
    }

    /// Append one event line, keeping only the last `max_lines` lines.
    pub fn record(&self, when: DateTime<Utc>, text: &str) -> std::io::Result<()> {
        let mut lines: Vec<String> = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw.lines().map(str::to_string).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        lines.push(format!("{} - {text}", when.format("%Y-%m-%d %H:%M:%S")));
        let keep_from = lines.len().saturating_sub(self.max_lines);
        let mut out = lines[keep_from..].join("\n");
        out.push('\n');
        std::fs::write(&self.path, out)
    }
}
