//! Stream supervision loop
//!
//! Owns the relay and encoder child processes and the advancement of the
//! durable play cursor. The loop walks the playlist, plays one item at a
//! time while polling both children at 1 Hz, enforces the stream-time
//! budget and restart directives, recovers from failures by rewinding
//! and restarting the relay, and feeds timing data to the schedule
//! generator and alert dispatcher.

mod process;

pub use process::{ChildSpec, ManagedChild};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{AppError, AppResult, StreamError};
use crate::playlist::{Directive, Playlist, PlaylistEntry};
use crate::schedule::{ScheduleSnapshot, ScheduleWriter};
use crate::services::{
    Alert, ConnectionProber, Mailer, MediaProber, RemoteUploader, VersionCheckOutcome,
    VersionProber,
};
use crate::stats::{PlayCursor, PlayHistory, StreamStats};
use crate::utils::{format_hms, format_span};

/// How the supervision loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Normal shutdown: `%STOP` or end-of-playlist with stop-after-last
    Clean,
    /// Second Ctrl-C inside the manual-restart window
    Interrupted,
}

enum CycleOutcome {
    Continue,
    Shutdown(RunOutcome),
}

enum EncoderOutcome {
    Exited(std::process::ExitStatus),
    Interrupted,
}

enum SigAction {
    None,
    Restart,
    Exit,
}

pub struct Supervisor {
    config: Arc<Config>,
    playlist: Arc<Playlist>,
    stats: Arc<Mutex<StreamStats>>,
    mailer: Mailer,
    cursor: PlayCursor,
    history: Option<PlayHistory>,
    prober: Arc<dyn MediaProber>,
    conn: Arc<ConnectionProber>,
    version_prober: Option<Arc<VersionProber>>,
    uploader: Option<Arc<RemoteUploader>>,
    schedule: Option<Arc<ScheduleWriter>>,
    relay_spec: ChildSpec,
    relay: Option<ManagedChild>,
    play_index: usize,
    extra_buffer: Vec<String>,
    schedule_task: Option<JoinHandle<()>>,
    conn_probe_task: Option<JoinHandle<bool>>,
    version_task: Option<JoinHandle<VersionCheckOutcome>>,
    sigint_rx: mpsc::UnboundedReceiver<()>,
    last_sigint: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        playlist: Playlist,
        prober: Arc<dyn MediaProber>,
        mailer: Mailer,
    ) -> AppResult<Self> {
        let relay_spec = ChildSpec::from_template(
            "relay",
            &config.paths.relay_binary,
            &config.stream.relay_args,
            &[("stream_url", config.stream.url.clone())],
            config.paths.relay_log.clone(),
        )?;

        let conn = Arc::new(ConnectionProber::new(
            config.stream.probe_urls.clone(),
            config.stream.strict_probing,
        ));

        let version_prober = config.misc.version_check_interval.as_secs().map(|_| {
            Arc::new(VersionProber::new(PathBuf::from("version.json"), false))
        });

        let uploader = (config.remote.enabled() && config.paths.schedule_file.is_some())
            .then(|| Arc::new(RemoteUploader::new(&config.remote)));

        let schedule = config
            .paths
            .schedule_file
            .is_some()
            .then(|| Arc::new(ScheduleWriter::new(config.clone(), prober.clone())));

        let history = config.paths.play_history_file.as_ref().and_then(|path| {
            (config.misc.play_history_length > 0)
                .then(|| PlayHistory::new(path.clone(), config.misc.play_history_length))
        });

        let stats = Arc::new(Mutex::new(StreamStats::new(&config)));

        // The sidecar remembers releases observed by earlier runs, so a
        // restart does not re-announce a version already seen.
        if let Some(prober) = &version_prober {
            if let Some(observed) = prober.load_sidecar() {
                let mut stats = stats.lock().unwrap();
                if crate::services::version_check::version_components(&observed)
                    > crate::services::version_check::version_components(&stats.newest_version)
                {
                    stats.newest_version = observed;
                }
            }
        }

        let (sigint_tx, sigint_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
                if sigint_tx.send(()).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            cursor: PlayCursor::new(config.paths.cursor_file.clone()),
            config,
            playlist: Arc::new(playlist),
            stats,
            mailer,
            history,
            prober,
            conn,
            version_prober,
            uploader,
            schedule,
            relay_spec,
            relay: None,
            play_index: 0,
            extra_buffer: Vec::new(),
            schedule_task: None,
            conn_probe_task: None,
            version_task: None,
            sigint_rx,
            last_sigint: None,
        })
    }

    /// Run the supervision loop until a clean stop, an interrupt, or a
    /// fatal error.
    pub async fn run(&mut self) -> AppResult<RunOutcome> {
        self.mailer.spawn_worker();
        if self.mailer.is_running() {
            if self.mailer.test_login().await {
                info!("Mail server login test succeeded");
            } else {
                warn!("Mail server login test failed; sends will re-probe on demand");
            }
        }

        self.start_relay().await?;

        let (index, elapsed) = self.cursor.load()?;
        // A cursor past the end of the playlist starts over from 0.
        let (index, elapsed) = if index >= self.playlist.len() {
            (0, 0)
        } else {
            (index, elapsed)
        };
        self.play_index = index;
        self.stats.lock().unwrap().elapsed_time = elapsed;
        info!("Resuming from playlist index {index}, {elapsed} seconds elapsed");

        loop {
            let result = self.cycle().await;
            match result {
                Ok(CycleOutcome::Continue) => {}
                Ok(CycleOutcome::Shutdown(outcome)) => {
                    self.shutdown().await;
                    self.mailer.stop().await;
                    return Ok(outcome);
                }
                Err(e) if e.is_recoverable() => {
                    if let Err(recover_err) = self.recover(e).await {
                        self.fatal(&recover_err.to_string()).await;
                        return Err(recover_err);
                    }
                }
                Err(e) => {
                    self.fatal(&e.to_string()).await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Process one playlist entry (or end-of-playlist condition).
    async fn cycle(&mut self) -> Result<CycleOutcome, StreamError> {
        match self.poll_sigint() {
            SigAction::Exit => return Ok(CycleOutcome::Shutdown(RunOutcome::Interrupted)),
            SigAction::Restart => return Err(StreamError::ManualRestart),
            SigAction::None => {}
        }

        if self.play_index >= self.playlist.len() {
            let progressed = self.stats.lock().unwrap().total_videos > 0;
            if self.config.stream.stop_after_last_video && progressed {
                info!("End of playlist reached; exiting");
                self.store_cursor(self.play_index, 0);
                self.mailer.send_urgent(Alert::PlaylistEnd).await;
                return Ok(CycleOutcome::Shutdown(RunOutcome::Clean));
            }
            info!("End of playlist reached; looping to the beginning");
            self.play_index = 0;
            self.mailer.enqueue(Alert::PlaylistLoop, false).await;
        }

        let (line, entry) = self.playlist[self.play_index].clone();
        match entry {
            PlaylistEntry::Blank => {
                debug!("{line}. Non-video entry, skipping");
                self.play_index += 1;
                Ok(CycleOutcome::Continue)
            }
            PlaylistEntry::Extra { text } => {
                debug!("{line}. Extra: {text}");
                self.extra_buffer.push(text);
                self.play_index += 1;
                Ok(CycleOutcome::Continue)
            }
            PlaylistEntry::Command { directive, arg } => {
                self.handle_command(line, directive, arg).await
            }
            PlaylistEntry::Normal {
                display_name,
                absolute_path,
                inline_info: _,
            } => self.play_item(line, &display_name, &absolute_path).await,
        }
    }

    async fn handle_command(
        &mut self,
        line: u32,
        directive: Directive,
        arg: Option<String>,
    ) -> Result<CycleOutcome, StreamError> {
        match directive {
            Directive::Restart | Directive::InstantRestart => {
                let stream_age = {
                    let stats = self.stats.lock().unwrap();
                    (Utc::now() - stats.stream_start_time).num_seconds().max(0) as u64
                };
                if stream_age > self.config.restart_minimum_secs() {
                    info!("{line}. Executing {directive} command");
                    let with_clips = directive == Directive::Restart;
                    self.play_index += 1;
                    self.store_cursor(self.play_index, 0);
                    self.restart_stream(with_clips).await?;
                } else {
                    info!(
                        "{line}. {directive} command found, but not executing: less than {} \
                         seconds have passed",
                        self.config.restart_minimum_secs()
                    );
                    self.play_index += 1;
                }
                Ok(CycleOutcome::Continue)
            }
            Directive::Stop => {
                info!("{line}. Executing STOP command; exiting");
                self.store_cursor(self.play_index + 1, 0);
                self.mailer.send_urgent(Alert::PlaylistStop { line }).await;
                Ok(CycleOutcome::Shutdown(RunOutcome::Clean))
            }
            Directive::Mail => {
                info!("{line}. Executing MAIL command");
                self.mailer
                    .enqueue(Alert::MailCommand { line, text: arg }, true)
                    .await;
                self.play_index += 1;
                Ok(CycleOutcome::Continue)
            }
            Directive::Exception => {
                self.play_index += 1;
                self.store_cursor(self.play_index, 0);
                Err(StreamError::PlaylistException { line })
            }
        }
    }

    /// Play the normal entry at the current index.
    async fn play_item(
        &mut self,
        line: u32,
        display_name: &str,
        path: &Path,
    ) -> Result<CycleOutcome, StreamError> {
        if !self.check_file(line, path).await? {
            // Skipped after alerting; move on.
            self.play_index += 1;
            self.store_cursor(self.play_index, 0);
            return Ok(CycleOutcome::Continue);
        }

        let duration = match self.prober.duration(path).await {
            Ok(duration) => duration,
            Err(e) => {
                warn!("{line}. Could not probe {}: {e}", path.display());
                0
            }
        };

        let padding = self.config.stream.video_padding_secs;
        let budget = self.config.time_before_restart_secs();

        // Rewind rules, then decide whether the item fits the remaining
        // stream-time budget.
        let (skip_time, fits, was_retried) = {
            let mut stats = self.stats.lock().unwrap();

            stats.elapsed_time = resume_position(
                stats.elapsed_time,
                duration,
                self.config.cursor.rewind_secs,
                stats.video_resume_point,
            );

            let net_length = duration.saturating_sub(stats.elapsed_time) + padding;
            let fits = stats.videos_since_restart == 0
                || budget == 0
                || (net_length as i64) <= stats.stream_time_remaining;
            (stats.elapsed_time, fits, stats.retried)
        };

        if !fits {
            info!("Stream time limit reached before {line}. {display_name}");
            self.extra_buffer.clear();
            self.restart_stream(true).await?;
            return Ok(CycleOutcome::Continue);
        }

        info!(
            "{line}. {} - Length: {}",
            path.display(),
            format_hms(duration.saturating_sub(skip_time))
        );
        if skip_time > 0 {
            info!("Starting from {}", format_hms(skip_time));
        }

        if was_retried {
            tokio::time::sleep(Duration::from_secs(self.config.stream.wait_after_retry_secs))
                .await;
        }

        if let Some(history) = &self.history {
            if let Err(e) = history.record(Utc::now(), &format!("{line}. {display_name}")) {
                warn!("Error writing play history: {e}");
            }
        }

        self.kick_schedule(display_name);

        if was_retried {
            let (exception_time, downtime_secs) = {
                let mut stats = self.stats.lock().unwrap();
                stats.update_downtime();
                let downtime =
                    (Utc::now() - stats.last_exception_time).num_seconds().max(0) as u64;
                stats.retried = false;
                (stats.last_exception_time, downtime)
            };
            self.mailer
                .enqueue(
                    Alert::StreamResume {
                        exception_time,
                        downtime_secs,
                    },
                    false,
                )
                .await;
        }

        match self.run_encoder(path).await? {
            EncoderOutcome::Interrupted => {
                return Ok(CycleOutcome::Shutdown(RunOutcome::Interrupted));
            }
            EncoderOutcome::Exited(status) if status.success() => {
                debug!("{line}. Encoded successfully");
                {
                    let mut stats = self.stats.lock().unwrap();
                    let net_length = duration.saturating_sub(skip_time) + padding;
                    stats.stream_time_remaining -= net_length as i64;
                    stats.elapsed_time = 0;
                    stats.video_resume_point = 0;
                    stats.videos_since_restart += 1;
                    stats.total_videos += 1;
                }
                self.extra_buffer.clear();
                self.play_index += 1;
                self.store_cursor(self.play_index, 0);
                Ok(CycleOutcome::Continue)
            }
            EncoderOutcome::Exited(status) => {
                // Any non-zero encoder exit is retryable.
                warn!("{line}. Encoder exited with {status}; retrying");
                let fits = {
                    let mut stats = self.stats.lock().unwrap();
                    stats.note_retry();

                    let net_length = duration.saturating_sub(stats.elapsed_time) + padding;
                    let fits = budget == 0 || (net_length as i64) <= stats.stream_time_remaining;
                    if fits {
                        // Resume from one rewind back, never below the
                        // resume point, which then rises to the new
                        // position.
                        stats.elapsed_time = resume_position(
                            stats.elapsed_time,
                            duration,
                            self.config.cursor.rewind_secs,
                            stats.video_resume_point,
                        );
                        stats.video_resume_point = stats.elapsed_time;
                        info!("Retrying from {}", format_hms(stats.elapsed_time));
                    } else {
                        stats.stream_time_remaining = 0;
                        stats.videos_since_restart = stats.videos_since_restart.max(1);
                    }
                    self.store_cursor_elapsed(&stats);
                    fits
                };

                if !fits {
                    self.extra_buffer.clear();
                    self.restart_stream(true).await?;
                }
                Ok(CycleOutcome::Continue)
            }
        }
    }

    /// Spawn the encoder for one item and poll encoder + relay at 1 Hz.
    async fn run_encoder(&mut self, path: &Path) -> Result<EncoderOutcome, StreamError> {
        let skip_time = self.stats.lock().unwrap().elapsed_time;
        let spec = ChildSpec::from_template(
            "encoder",
            &self.config.paths.encoder_binary,
            &self.config.stream.encoder_args,
            &[
                ("file", path.display().to_string()),
                ("skip_time", skip_time.to_string()),
                (
                    "video_padding",
                    self.config.stream.video_padding_secs.to_string(),
                ),
            ],
            self.config.paths.encoder_log.clone(),
        )?;
        spec.kill_stale();
        let mut encoder = spec.spawn()?;

        let record_interval = self.config.cursor.record_interval_secs.max(1);
        let mut since_record = 0u64;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tick.tick().await;

            if let Some(status) = encoder.try_status().map_err(|e| StreamError::Spawn {
                name: "encoder",
                source: e,
            })? {
                return Ok(EncoderOutcome::Exited(status));
            }

            if let Some(relay) = self.relay.as_mut() {
                if let Ok(Some(status)) = relay.try_status() {
                    error!(
                        "Relay process terminated unexpectedly at {}, exit code {:?}",
                        Utc::now(),
                        status.code()
                    );
                    encoder.kill().await;
                    self.relay = None;
                    return Err(StreamError::RelayExited {
                        code: status.code(),
                    });
                }
            }

            match self.poll_sigint() {
                SigAction::Exit => {
                    encoder.kill().await;
                    return Ok(EncoderOutcome::Interrupted);
                }
                SigAction::Restart => {
                    encoder.kill().await;
                    return Err(StreamError::ManualRestart);
                }
                SigAction::None => {}
            }

            // Advance elapsed time and persist the cursor periodically.
            {
                let mut stats = self.stats.lock().unwrap();
                stats.elapsed_time += 1;
                since_record += 1;
                if since_record >= record_interval {
                    since_record = 0;
                    self.store_cursor_elapsed(&stats);
                }
            }

            if let Err(e) = self.manage_connection_probe() {
                encoder.kill().await;
                return Err(e);
            }
            self.manage_version_probe().await;
            self.manage_status_report().await;
        }
    }

    /// Reap a finished connection probe and start a new one when due.
    fn manage_connection_probe(&mut self) -> Result<(), StreamError> {
        if let Some(task) = self.conn_probe_task.take() {
            if task.is_finished() {
                use futures::FutureExt;
                let online = task.now_or_never().and_then(Result::ok).unwrap_or(true);
                self.stats.lock().unwrap().set_connection_check_time();
                if !online {
                    return Err(StreamError::ConnectionLost);
                }
            } else {
                self.conn_probe_task = Some(task);
            }
        }

        if self.conn_probe_task.is_none() && self.conn.has_urls() {
            let interval = self
                .config
                .stream
                .probe_interval_secs
                .max(self.conn.min_interval().as_secs());
            let due = {
                let stats = self.stats.lock().unwrap();
                (Utc::now() - stats.last_connection_check).num_seconds().max(0) as u64 >= interval
            };
            if due {
                let conn = self.conn.clone();
                self.conn_probe_task = Some(tokio::spawn(async move { conn.probe().await }));
            }
        }

        Ok(())
    }

    /// Reap a finished version probe, apply its result, and start a new
    /// one when the deadline has passed.
    async fn manage_version_probe(&mut self) {
        let Some(prober) = self.version_prober.clone() else {
            return;
        };
        let Some(interval) = self.config.misc.version_check_interval.as_secs() else {
            return;
        };

        if let Some(task) = self.version_task.take() {
            if !task.is_finished() {
                self.version_task = Some(task);
                return;
            }

            let outcome = task.await.unwrap_or(VersionCheckOutcome::TryAgainLater);
            let next_secs = match &outcome {
                VersionCheckOutcome::TryAgainLater => 3600,
                _ => interval,
            };

            if let VersionCheckOutcome::NewRelease(release) = outcome {
                info!("New version available: {}", release.tag);
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.newest_version = release.tag.trim_start_matches('v').to_string();
                }
                self.mailer
                    .enqueue(Alert::NewVersion { release }, false)
                    .await;
            }

            self.stats.lock().unwrap().next_version_check =
                Utc::now() + chrono::Duration::seconds(next_secs as i64);
            return;
        }

        let due = {
            let stats = self.stats.lock().unwrap();
            Utc::now() >= stats.next_version_check
        };
        if due {
            let newest = self.stats.lock().unwrap().newest_version.clone();
            self.version_task =
                Some(tokio::spawn(async move { prober.check(&newest).await }));
        }
    }

    /// Generate and enqueue the periodic status report when due.
    async fn manage_status_report(&mut self) {
        let report = {
            let mut stats = self.stats.lock().unwrap();
            let Some(deadline) = stats.next_status_report else {
                return;
            };
            if Utc::now() < deadline {
                return;
            }

            let report = build_status_report(&stats, self.config.mail.max_errors_reported);
            stats.next_status_report = Some(
                Utc::now()
                    + chrono::Duration::seconds(
                        (self.config.mail.status_report_days * 86_400) as i64,
                    ),
            );
            report
        };

        self.mailer
            .enqueue(Alert::StatusReport { report }, false)
            .await;
    }

    /// Cancel any in-flight schedule write and start a new one for the
    /// current item, unless the item is excluded from the schedule.
    fn kick_schedule(&mut self, display_name: &str) {
        let Some(writer) = self.schedule.clone() else {
            return;
        };
        if writer.is_excluded(display_name) {
            debug!("Schedule not written for excluded item {display_name}");
            return;
        }

        if let Some(task) = self.schedule_task.take() {
            task.abort();
        }

        let playlist = self.playlist.clone();
        let stats = self.stats.clone();
        let mailer = self.mailer.clone();
        let uploader = self.uploader.clone();
        let index = self.play_index;
        let extras = self.extra_buffer.clone();
        let max_errors = self.config.mail.max_errors_reported;
        let schedule_path = self.config.paths.schedule_file.clone();

        self.schedule_task = Some(tokio::spawn(async move {
            let now = Utc::now();
            let snapshot = {
                let stats = stats.lock().unwrap();
                ScheduleSnapshot {
                    elapsed_time: stats.elapsed_time,
                    stream_time_remaining: stats.stream_time_remaining,
                }
            };

            let (items, issues) = writer
                .build_upcoming(&playlist, index, snapshot, &extras, now)
                .await;

            let doc = {
                let mut stats = stats.lock().unwrap();
                writer.apply_history(&mut stats, &items, true, now);
                writer.document(&stats, items, now)
            };

            writer.write(&doc).await;

            if !issues.is_empty() {
                let total = issues.len();
                let errors = issues
                    .iter()
                    .take(max_errors)
                    .map(|issue| issue.describe())
                    .collect();
                mailer
                    .enqueue(Alert::ScheduleError { errors, total }, false)
                    .await;
            }

            if let (Some(uploader), Some(path)) = (uploader, schedule_path) {
                let _ = uploader.upload(&path, &mailer).await;
            }
        }));
    }

    /// Check that an input file exists, applying the retry policy.
    /// `Ok(false)` means the entry should be skipped.
    async fn check_file(&mut self, line: u32, path: &Path) -> Result<bool, StreamError> {
        if path.is_file() {
            return Ok(true);
        }

        let mut attempts_remaining = self.config.retry.attempts;
        let infinite = attempts_remaining < 0;
        let mut alert_sent = false;
        let miss_time = Utc::now();

        loop {
            if path.is_file() {
                if alert_sent {
                    // The file appeared after infinite retries; announce
                    // the resume.
                    let downtime_secs = (Utc::now() - miss_time).num_seconds().max(0) as u64;
                    self.mailer
                        .enqueue(
                            Alert::StreamResume {
                                exception_time: miss_time,
                                downtime_secs,
                            },
                            false,
                        )
                        .await;
                }
                return Ok(true);
            }

            if infinite {
                if !alert_sent {
                    alert_sent = true;
                    self.mailer
                        .enqueue(
                            Alert::FileRetry {
                                path: path.display().to_string(),
                                line: Some(line),
                            },
                            false,
                        )
                        .await;
                }
                error!("File not found: {}. Retrying in {} seconds...", path.display(),
                    self.config.retry.period_secs);
            } else if attempts_remaining > 0 {
                error!(
                    "File not found: {}. {} attempt(s) remaining; retrying in {} seconds...",
                    path.display(),
                    attempts_remaining,
                    self.config.retry.period_secs
                );
                attempts_remaining -= 1;
            } else {
                if self.config.retry.exit_on_file_not_found {
                    error!("Line {line}: {} not found", path.display());
                    return Err(StreamError::InputMissing {
                        line,
                        path: path.to_path_buf(),
                    });
                }
                error!("Line {line}: {} not found. Continuing.", path.display());
                self.mailer
                    .enqueue(
                        Alert::FileNotFound {
                            path: path.display().to_string(),
                            line: Some(line),
                        },
                        false,
                    )
                    .await;
                return Ok(false);
            }

            tokio::time::sleep(Duration::from_secs(self.config.retry.period_secs)).await;
        }
    }

    /// Orderly stream restart: optional pre-clip, relay teardown, wait,
    /// relay start, optional post-clip, budget reset.
    async fn restart_stream(&mut self, with_clips: bool) -> Result<(), StreamError> {
        self.stats.lock().unwrap().note_restart();

        if with_clips {
            if let Some(clip) = self.config.stream.restart_before_video.clone() {
                self.run_clip(&clip).await?;
            }
        }

        self.stop_relay().await;
        info!(
            "Waiting {} seconds to restart stream",
            self.config.stream.restart_wait_secs
        );
        tokio::time::sleep(Duration::from_secs(self.config.stream.restart_wait_secs)).await;

        self.start_relay().await?;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.stream_time_remaining = self.config.time_before_restart_secs() as i64;
            stats.videos_since_restart = 0;
        }
        info!("Stream restarted at {}", Utc::now());

        if with_clips {
            if let Some(clip) = self.config.stream.restart_after_video.clone() {
                self.run_clip(&clip).await?;
                if let Ok(length) = self.prober.duration(&clip).await {
                    let mut stats = self.stats.lock().unwrap();
                    stats.stream_time_remaining -=
                        (length + self.config.stream.video_padding_secs) as i64;
                }
            }
        }

        Ok(())
    }

    /// Play a restart clip through the encoder, watching the relay.
    /// Clip failures are logged, not fatal.
    async fn run_clip(&mut self, clip: &Path) -> Result<(), StreamError> {
        if !clip.is_file() {
            warn!("Restart clip {} not found; skipping", clip.display());
            return Ok(());
        }

        info!("Playing restart clip {}", clip.display());
        let spec = ChildSpec::from_template(
            "encoder",
            &self.config.paths.encoder_binary,
            &self.config.stream.encoder_args,
            &[
                ("file", clip.display().to_string()),
                ("skip_time", "0".to_string()),
                (
                    "video_padding",
                    self.config.stream.video_padding_secs.to_string(),
                ),
            ],
            self.config.paths.encoder_log.clone(),
        )?;
        let mut child = spec.spawn()?;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Ok(Some(status)) = child.try_status() {
                if !status.success() {
                    warn!("Restart clip exited with {status}");
                }
                return Ok(());
            }
            if let Some(relay) = self.relay.as_mut() {
                if let Ok(Some(status)) = relay.try_status() {
                    child.kill().await;
                    self.relay = None;
                    return Err(StreamError::RelayExited {
                        code: status.code(),
                    });
                }
            }
        }
    }

    /// Kill stale relay siblings, block until the connection probe
    /// succeeds, then spawn the relay.
    async fn start_relay(&mut self) -> Result<(), StreamError> {
        self.relay_spec.kill_stale();
        self.conn.wait_until_online().await;

        let relay = self.relay_spec.spawn()?;
        info!("Relay process started at {} (pid {:?})", Utc::now(), relay.id());
        self.relay = Some(relay);
        self.stats.lock().unwrap().stream_start_time = Utc::now();
        Ok(())
    }

    async fn stop_relay(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            debug!("Stopping relay process (uptime {:?})", relay.uptime());
            relay.kill().await;
        }
    }

    /// Failure recovery: record, alert, rewind, restart the relay.
    async fn recover(&mut self, failure: StreamError) -> AppResult<()> {
        error!("{failure}");

        let manual = matches!(failure, StreamError::ManualRestart);
        {
            let mut stats = self.stats.lock().unwrap();
            stats.note_exception(failure.to_string());
            if manual {
                stats.note_restart();
            } else {
                stats.note_retry();
            }
        }

        if failure.alerts_stream_down() {
            let when = self.stats.lock().unwrap().last_exception_time;
            self.mailer
                .send_urgent(Alert::StreamDown {
                    reason: failure.to_string(),
                    when,
                })
                .await;
        }

        // Rewind, raising the resume floor so later rewinds cannot go
        // below this point.
        {
            let mut stats = self.stats.lock().unwrap();
            stats.rewind(self.config.cursor.rewind_secs);
            stats.video_resume_point = stats.elapsed_time;
            self.store_cursor_elapsed(&stats);
        }

        self.stop_relay().await;
        self.start_relay().await?;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.stream_time_remaining = self.config.time_before_restart_secs() as i64;
            stats.videos_since_restart = 0;
            // Probe again promptly once the next item starts.
            stats.force_connection_check(self.config.stream.probe_interval_secs);
        }

        Ok(())
    }

    /// Tear everything down and mail the operator before propagating a
    /// fatal error.
    async fn fatal(&mut self, message: &str) {
        error!(
            "Fatal error encountered at {}: {message}. Terminating stream.",
            Utc::now()
        );
        self.shutdown().await;

        let total_runtime_secs = self.stats.lock().unwrap().uptime_secs();
        self.mailer
            .send_urgent(Alert::ProgramError {
                message: message.to_string(),
                total_runtime_secs,
            })
            .await;
        self.mailer.stop().await;
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.schedule_task.take() {
            task.abort();
        }
        if let Some(task) = self.version_task.take() {
            task.abort();
        }
        if let Some(task) = self.conn_probe_task.take() {
            task.abort();
        }
        self.stop_relay().await;
    }

    fn poll_sigint(&mut self) -> SigAction {
        let window = Duration::from_secs(self.config.misc.manual_restart_delay_secs);
        let mut action = SigAction::None;

        while self.sigint_rx.try_recv().is_ok() {
            match self.last_sigint {
                Some(previous) if previous.elapsed() <= window => {
                    info!("Second interrupt received; exiting");
                    return SigAction::Exit;
                }
                _ => {
                    info!(
                        "Interrupt received; restarting stream (press again within {} \
                         seconds to exit)",
                        window.as_secs()
                    );
                    self.last_sigint = Some(Instant::now());
                    action = SigAction::Restart;
                }
            }
        }

        action
    }

    fn store_cursor(&self, index: usize, elapsed: u64) {
        if let Err(e) = self.cursor.store(index, elapsed) {
            warn!("Error writing play cursor: {e}");
        }
    }

    fn store_cursor_elapsed(&self, stats: &StreamStats) {
        if let Err(e) = self.cursor.store(self.play_index, stats.elapsed_time) {
            warn!("Error writing play cursor: {e}");
        }
    }
}

/// Where playback starts when an item is entered with `elapsed` seconds
/// already on the cursor. Elapsed times under one rewind length (or at
/// or past the item's end) snap to zero; anything else backs up one
/// rewind length but never below the resume floor.
pub fn resume_position(elapsed: u64, duration: u64, rewind: u64, resume_point: u64) -> u64 {
    if elapsed < rewind || (duration > 0 && elapsed >= duration) {
        0
    } else {
        elapsed.saturating_sub(rewind).max(resume_point)
    }
}

/// Assemble the periodic status report body.
fn build_status_report(stats: &StreamStats, max_exceptions: usize) -> String {
    let uptime = stats.uptime_secs();
    let rate = if uptime > 0 {
        100.0 * (1.0 - stats.stream_downtime as f64 / uptime as f64)
    } else {
        100.0
    };

    let mut report = format!(
        "Running for {}.\n\nVideos played: {}\nStream restarts: {}\nRetries after errors: \
         {}\nStream downtime: {}\nUptime rate: {rate:.2}%\n",
        format_span(uptime),
        stats.total_videos,
        stats.restarts,
        stats.retries,
        format_span(stats.stream_downtime),
    );

    if stats.exceptions.is_empty() {
        report.push_str("\nNo recent errors.\n");
    } else {
        report.push_str("\nRecent errors:\n");
        for record in stats.exceptions.iter().rev().take(max_exceptions) {
            report.push_str(&format!(
                "- {} at {}\n",
                record.kind,
                record.when.format("%Y-%m-%d %H:%M:%S")
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.stream.url = "rtmp://example/live".to_string();
        config
    }

    #[test]
    fn test_status_report_contents() {
        let config = test_config();
        let mut stats = StreamStats::new(&config);
        stats.total_videos = 12;
        stats.restarts = 2;
        stats.retries = 1;
        stats.stream_downtime = 65;
        stats.note_exception("relay died");

        let report = build_status_report(&stats, 5);
        assert!(report.contains("Videos played: 12"));
        assert!(report.contains("Stream restarts: 2"));
        assert!(report.contains("Retries after errors: 1"));
        assert!(report.contains("1 minute, 5 seconds"));
        assert!(report.contains("relay died"));
    }

    #[test]
    fn test_status_report_without_errors() {
        let config = test_config();
        let stats = StreamStats::new(&config);
        let report = build_status_report(&stats, 5);
        assert!(report.contains("No recent errors."));
    }

    #[test]
    fn test_resume_position_boundaries() {
        // Under one rewind length snaps to zero
        assert_eq!(resume_position(29, 300, 30, 0), 0);
        // Exactly one rewind length rewinds to zero
        assert_eq!(resume_position(30, 300, 30, 0), 0);
        // Past the end of the item snaps to zero
        assert_eq!(resume_position(300, 300, 30, 0), 0);
        // Normal rewind
        assert_eq!(resume_position(90, 300, 30, 0), 60);
        // The resume floor wins over the rewind
        assert_eq!(resume_position(90, 300, 30, 75), 75);
        // Unknown duration never triggers the past-the-end snap
        assert_eq!(resume_position(90, 0, 30, 0), 60);
    }
}
