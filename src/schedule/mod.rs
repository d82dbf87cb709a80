//! Schedule generation
//!
//! From the current playlist position, produce a forward-looking JSON
//! document of upcoming and recent items with estimated timestamps. The
//! walk is cyclic: after the playlist tail it wraps to the beginning.
//! Excluded and too-short items are hidden but their lengths are carried
//! forward so later timestamps stay aligned with the wall clock, and
//! restart directives and the stream-time budget insert simulated
//! restart offsets.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::playlist::{Directive, Playlist, PlaylistEntry};
use crate::services::media_prober::MediaProber;
use crate::stats::StreamStats;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One record in `coming_up_next` or `previous_files`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub name: String,
    pub time: String,
    pub unixtime: i64,
    pub length: u64,
    pub extra_info: String,
}

impl ScheduleItem {
    fn normal(name: &str, when: DateTime<Utc>, length: u64, extra_info: &str) -> Self {
        Self {
            entry_type: "normal".to_string(),
            name: name.to_string(),
            time: when.format(TIME_FORMAT).to_string(),
            unixtime: when.timestamp(),
            length,
            extra_info: extra_info.to_string(),
        }
    }

    fn extra(text: &str) -> Self {
        Self {
            entry_type: "extra".to_string(),
            name: String::new(),
            time: String::new(),
            unixtime: 0,
            length: 0,
            extra_info: text.to_string(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.entry_type == "normal"
    }
}

/// The document written to the schedule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDoc {
    pub program_start_time: String,
    pub video_start_time: String,
    pub offset_time: i64,
    pub coming_up_next: Vec<ScheduleItem>,
    pub previous_files: Vec<ScheduleItem>,
    pub script_version: String,
}

/// One problem encountered while generating, reported in aggregate
/// through a single `schedule_error` alert.
#[derive(Debug, Clone)]
pub struct ScheduleIssue {
    pub line: u32,
    pub reason: String,
}

impl ScheduleIssue {
    pub fn describe(&self) -> String {
        format!("Line {}: {}", self.line, self.reason)
    }
}

/// Snapshot of the stats fields the walk depends on, taken under the
/// stats lock so generation itself can run without holding it.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSnapshot {
    pub elapsed_time: u64,
    pub stream_time_remaining: i64,
}

pub struct ScheduleWriter {
    config: Arc<Config>,
    prober: Arc<dyn MediaProber>,
    exclude_prefixes: Vec<String>,
}

impl ScheduleWriter {
    pub fn new(config: Arc<Config>, prober: Arc<dyn MediaProber>) -> Self {
        let exclude_prefixes = config.exclude_prefixes_folded();
        Self {
            config,
            prober,
            exclude_prefixes,
        }
    }

    /// Whether a display name is hidden from the schedule.
    pub fn is_excluded(&self, display_name: &str) -> bool {
        let folded = display_name.to_lowercase().replace('\\', "/");
        self.exclude_prefixes
            .iter()
            .any(|prefix| folded.starts_with(prefix.as_str()))
    }

    /// Walk the playlist cyclically from `entry_index` and build the
    /// `coming_up_next` records. `entry_index` must point at a normal
    /// entry (the currently playing item), which is always emitted.
    pub async fn build_upcoming(
        &self,
        playlist: &Playlist,
        entry_index: usize,
        snapshot: ScheduleSnapshot,
        extra_entries: &[String],
        now: DateTime<Utc>,
    ) -> (Vec<ScheduleItem>, Vec<ScheduleIssue>) {
        let schedule = &self.config.schedule;
        let padding = self.config.stream.video_padding_secs;
        let full_budget = self.config.time_before_restart_secs() as i64;
        let upcoming_secs = self.config.upcoming_length_secs();
        let restart_minimum = self.config.restart_minimum_secs();

        let mut items = Vec::new();
        let mut issues = Vec::new();

        // Extras handed in by the supervisor come before the current item.
        for text in extra_entries {
            items.push(ScheduleItem::extra(text));
        }

        // The currently playing item is emitted unconditionally with its
        // real start timestamp.
        let (current_line, current_entry) = &playlist[entry_index];
        let current_len = match current_entry {
            PlaylistEntry::Normal {
                display_name,
                absolute_path,
                inline_info,
            } => match self.prober.duration(absolute_path).await {
                Ok(length) => {
                    items.push(ScheduleItem::normal(display_name, now, length, inline_info));
                    length
                }
                Err(e) => {
                    issues.push(ScheduleIssue {
                        line: *current_line,
                        reason: e.to_string(),
                    });
                    items.push(ScheduleItem::normal(display_name, now, 0, inline_info));
                    0
                }
            },
            other => {
                debug!("Schedule asked to start at non-video entry {other:?}");
                return (items, issues);
            }
        };

        // Skipped runtime of the current video is not part of the
        // timestamp math for subsequent entries.
        let elapsed = if snapshot.elapsed_time < self.config.cursor.rewind_secs {
            0
        } else {
            snapshot.elapsed_time
        };

        let mut restart_duration_memo: Option<u64> = None;
        let advance = current_len.saturating_sub(elapsed) + padding;
        let mut current_time = now + ChronoDuration::seconds(advance as i64);
        let mut total_duration = advance;
        let mut remaining = snapshot.stream_time_remaining - advance as i64;
        let mut sim_stream_duration =
            (full_budget - snapshot.stream_time_remaining).max(0) as u64 + advance;
        let mut pending_offset: u64 = 0;

        if full_budget > 0 && remaining <= 0 {
            pending_offset += self.restart_duration(&mut restart_duration_memo).await;
            remaining = full_budget;
            sim_stream_duration = 0;
        }

        let mut normals = 0usize;
        let mut idle_entries = 0usize;

        let cyclic = playlist
            .iter()
            .skip(entry_index + 1)
            .chain(playlist.iter().cycle());

        for pair in cyclic {
            let (line, entry) = (pair.0, &pair.1);
            if normals >= schedule.min_videos
                && (normals >= schedule.max_videos || total_duration > upcoming_secs)
            {
                break;
            }

            // A playlist with nothing schedulable must not spin forever.
            idle_entries += 1;
            if idle_entries > playlist.len() {
                break;
            }

            match entry {
                PlaylistEntry::Blank => continue,
                PlaylistEntry::Extra { text } => {
                    items.push(ScheduleItem::extra(text));
                }
                PlaylistEntry::Command { directive, .. } => match directive {
                    Directive::Restart => {
                        if sim_stream_duration > restart_minimum {
                            pending_offset +=
                                self.restart_duration(&mut restart_duration_memo).await;
                            sim_stream_duration = 0;
                            remaining = full_budget;
                        }
                    }
                    Directive::InstantRestart => {
                        if sim_stream_duration > restart_minimum {
                            pending_offset += self.config.stream.restart_wait_secs;
                            sim_stream_duration = 0;
                            remaining = full_budget;
                        }
                    }
                    Directive::Stop => break,
                    Directive::Mail | Directive::Exception => {}
                },
                PlaylistEntry::Normal {
                    display_name,
                    absolute_path,
                    inline_info,
                } => {
                    let length = match self.prober.duration(absolute_path).await {
                        Ok(length) => length,
                        Err(e) => {
                            issues.push(ScheduleIssue {
                                line,
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    };

                    // Hidden items still advance the clock.
                    if self.is_excluded(display_name) || length < schedule.min_video_secs {
                        debug!(
                            "Not adding entry {line}. {display_name} to schedule: excluded"
                        );
                        let advance = length + padding;
                        pending_offset += advance;
                        total_duration += advance;
                        remaining -= advance as i64;
                        sim_stream_duration += advance;
                        continue;
                    }

                    // Crossing the stream-time budget simulates a restart
                    // before this item.
                    if full_budget > 0 && (length + padding) as i64 > remaining {
                        pending_offset +=
                            self.restart_duration(&mut restart_duration_memo).await;
                        remaining = full_budget;
                        sim_stream_duration = 0;
                    }

                    current_time += ChronoDuration::seconds(pending_offset as i64);
                    pending_offset = 0;

                    items.push(ScheduleItem::normal(
                        display_name,
                        current_time,
                        length,
                        inline_info,
                    ));
                    normals += 1;
                    idle_entries = 0;

                    let advance = length + padding;
                    current_time += ChronoDuration::seconds(advance as i64);
                    total_duration += advance;
                    remaining -= advance as i64;
                    sim_stream_duration += advance;
                }
            }
        }

        (items, issues)
    }

    /// Fold the previous generation's records into `previous_files` and
    /// remember the new generation as `recent`. Called under the stats
    /// lock.
    pub fn apply_history(
        &self,
        stats: &mut StreamStats,
        items: &[ScheduleItem],
        update_previous: bool,
        now: DateTime<Utc>,
    ) {
        let schedule = &self.config.schedule;
        let previous_length_secs = self.config.previous_length_secs() as i64;

        if let Some(previous) = stats.previous_files.as_mut() {
            if update_previous && !stats.recent_playlist.is_empty() {
                // An encoder retry regenerates the same head item; in
                // that case previous_files already ends with it.
                let retry_case = previous.back() == stats.recent_playlist.front();
                if !retry_case {
                    while let Some(item) = stats.recent_playlist.pop_front() {
                        let is_normal = item.is_normal();
                        previous.push_back(item);
                        if is_normal {
                            break;
                        }
                    }
                }

                let normal_count =
                    |deque: &VecDeque<ScheduleItem>| deque.iter().filter(|i| i.is_normal()).count();

                while normal_count(previous) > schedule.previous_max_videos {
                    previous.pop_front();
                }

                // Stale pruning: tight mode drops every expired normal
                // item, loose mode keeps one extra.
                let cutoff = now.timestamp() - previous_length_secs;
                let mut budget = previous
                    .iter()
                    .filter(|item| item.is_normal() && item.unixtime < cutoff)
                    .count() as i64;
                if !schedule.previous_prune_tight {
                    budget -= 1;
                }

                while budget > 0 && normal_count(previous) > schedule.previous_min_videos {
                    if let Some(popped) = previous.pop_front() {
                        if popped.is_normal() {
                            budget -= 1;
                        }
                    } else {
                        break;
                    }
                }
            }

            stats.recent_playlist = items.iter().cloned().collect();
        }
    }

    /// Assemble the full document. Called under the stats lock.
    pub fn document(
        &self,
        stats: &StreamStats,
        items: Vec<ScheduleItem>,
        video_start: DateTime<Utc>,
    ) -> ScheduleDoc {
        ScheduleDoc {
            program_start_time: stats.program_start_time.format(TIME_FORMAT).to_string(),
            video_start_time: video_start.format(TIME_FORMAT).to_string(),
            offset_time: self.config.schedule.offset_mins,
            coming_up_next: items,
            previous_files: stats
                .previous_files
                .as_ref()
                .map(|deque| deque.iter().cloned().collect())
                .unwrap_or_default(),
            script_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Convenience wrapper running the full pipeline against directly
    /// owned stats. The supervisor uses the split API so the stats lock
    /// is never held across probing.
    pub async fn generate(
        &self,
        playlist: &Playlist,
        entry_index: usize,
        stats: &mut StreamStats,
        extra_entries: &[String],
        update_previous: bool,
        now: DateTime<Utc>,
    ) -> (ScheduleDoc, Vec<ScheduleIssue>) {
        let snapshot = ScheduleSnapshot {
            elapsed_time: stats.elapsed_time,
            stream_time_remaining: stats.stream_time_remaining,
        };
        let (items, issues) = self
            .build_upcoming(playlist, entry_index, snapshot, extra_entries, now)
            .await;
        self.apply_history(stats, &items, update_previous, now);
        let doc = self.document(stats, items, now);
        (doc, issues)
    }

    /// Write the document to the configured schedule file. Best-effort:
    /// failures are logged, not propagated.
    pub async fn write(&self, doc: &ScheduleDoc) {
        let Some(path) = &self.config.paths.schedule_file else {
            return;
        };

        let json = match serde_json::to_string(doc) {
            Ok(json) => json,
            Err(e) => {
                warn!("Error serializing schedule: {e}");
                return;
            }
        };

        if let Err(e) = tokio::fs::write(path, json).await {
            warn!("Error writing schedule file {}: {e}", path.display());
        }
    }

    /// Combined length of the restart clips plus the inter-stream wait,
    /// used for simulated restarts. Memoized per generation.
    async fn restart_duration(&self, memo: &mut Option<u64>) -> u64 {
        if let Some(duration) = memo {
            return *duration;
        }

        let padding = self.config.stream.video_padding_secs;
        let mut duration = self.config.stream.restart_wait_secs;
        for clip in [
            &self.config.stream.restart_before_video,
            &self.config.stream.restart_after_video,
        ]
        .into_iter()
        .flatten()
        {
            duration += self.clip_length(clip).await + padding;
        }

        *memo = Some(duration);
        duration
    }

    async fn clip_length(&self, path: &Path) -> u64 {
        match self.prober.duration(path).await {
            Ok(length) => length,
            Err(e) => {
                debug!("Restart clip {} not probed: {e}", path.display());
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProbeError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Duration probe scripted by file stem.
    struct ScriptedProber {
        durations: HashMap<String, u64>,
    }

    impl ScriptedProber {
        fn new(durations: &[(&str, u64)]) -> Arc<Self> {
            Arc::new(Self {
                durations: durations
                    .iter()
                    .map(|(name, length)| (name.to_string(), *length))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl MediaProber for ScriptedProber {
        async fn duration(&self, path: &Path) -> Result<u64, ProbeError> {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.durations
                .get(&stem)
                .copied()
                .ok_or_else(|| ProbeError::Missing {
                    path: path.to_path_buf(),
                })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.stream.url = "rtmp://example/live".to_string();
        config.stream.video_padding_secs = 0;
        config.stream.time_before_restart_mins = 60;
        config.stream.restart_wait_secs = 420;
        config.schedule.min_videos = 1;
        config.schedule.max_videos = 1;
        config.schedule.upcoming_length_mins = 100_000;
        config.schedule.min_video_secs = 0;
        config.paths.media_dir = PathBuf::from("/media");
        config
    }

    fn playlist_from(lines: &[&str]) -> Playlist {
        crate::playlist::parse_lines(
            lines.iter().map(|line| line.to_string()),
            Path::new("/media"),
        )
        .unwrap()
    }

    fn snapshot(remaining: i64) -> ScheduleSnapshot {
        ScheduleSnapshot {
            elapsed_time: 0,
            stream_time_remaining: remaining,
        }
    }

    #[tokio::test]
    async fn test_current_item_has_real_timestamp() {
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[("a", 100), ("b", 200)]);
        let writer = ScheduleWriter::new(config, prober);
        let playlist = playlist_from(&["a.mp4", "b.mp4"]);
        let now = Utc::now();

        let (items, issues) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        assert!(issues.is_empty());
        assert_eq!(items[0].name, "a");
        assert_eq!(items[0].unixtime, now.timestamp());
        assert_eq!(items[1].name, "b");
        assert_eq!(items[1].unixtime, now.timestamp() + 100);
    }

    #[tokio::test]
    async fn test_excluded_length_carries_forward() {
        let mut config = test_config();
        config.schedule.exclude_prefixes = vec!["skipme".to_string()];
        let prober = ScriptedProber::new(&[("a", 100), ("skipme", 40), ("b", 200)]);
        let writer = ScheduleWriter::new(Arc::new(config), prober);
        let playlist = playlist_from(&["a.mp4", "skipme.mp4", "b.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(items[1].unixtime, now.timestamp() + 100 + 40);
    }

    #[tokio::test]
    async fn test_short_video_hidden_but_counted() {
        let mut config = test_config();
        config.schedule.min_video_secs = 60;
        let prober = ScriptedProber::new(&[("a", 100), ("bump", 15), ("b", 200)]);
        let writer = ScheduleWriter::new(Arc::new(config), prober);
        let playlist = playlist_from(&["a.mp4", "bump.mp4", "b.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(items[1].unixtime, now.timestamp() + 115);
    }

    #[tokio::test]
    async fn test_stop_directive_terminates_enumeration() {
        let mut config = test_config();
        config.schedule.max_videos = 6;
        let prober = ScriptedProber::new(&[("a", 100), ("b", 200), ("c", 300)]);
        let writer = ScheduleWriter::new(Arc::new(config), prober);
        let playlist = playlist_from(&["a.mp4", "b.mp4", "%STOP", "c.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_extras_emitted_without_timestamps() {
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[("a", 100), ("b", 200)]);
        let writer = ScheduleWriter::new(config, prober);
        let playlist = playlist_from(&["a.mp4", ":Up next", "b.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &["Pregame".to_string()], now)
            .await;
        assert_eq!(items[0].entry_type, "extra");
        assert_eq!(items[0].extra_info, "Pregame");
        assert_eq!(items[1].name, "a");
        assert_eq!(items[2].entry_type, "extra");
        assert_eq!(items[2].extra_info, "Up next");
        assert_eq!(items[3].name, "b");
    }

    #[tokio::test]
    async fn test_probe_failure_recorded_and_skipped() {
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[("a", 100), ("c", 300)]);
        let writer = ScheduleWriter::new(config, prober);
        let playlist = playlist_from(&["a.mp4", "missing.mp4", "c.mp4"]);
        let now = Utc::now();

        let (items, issues) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].line, 2);
        // Skipped probe failures do not shift later timestamps
        assert_eq!(items[1].unixtime, now.timestamp() + 100);
    }

    #[tokio::test]
    async fn test_budget_crossing_inserts_simulated_restart() {
        // Budget 1h; current item consumes 3000s, the next (800s) no
        // longer fits, so a simulated restart (wait 420s) lands first.
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[("a", 3000), ("b", 800)]);
        let writer = ScheduleWriter::new(config, prober);
        let playlist = playlist_from(&["a.mp4", "b.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        assert_eq!(items[1].name, "b");
        assert_eq!(items[1].unixtime, now.timestamp() + 3000 + 420);
    }

    #[tokio::test]
    async fn test_restart_directive_gated_by_minimum_time() {
        // Well under the 30-minute minimum: the %RESTART adds nothing.
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[("a", 100), ("b", 200)]);
        let writer = ScheduleWriter::new(config, prober);
        let playlist = playlist_from(&["a.mp4", "%RESTART", "b.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        assert_eq!(items[1].unixtime, now.timestamp() + 100);
    }

    #[tokio::test]
    async fn test_restart_directive_applies_after_minimum_time() {
        let mut config = test_config();
        config.stream.restart_minimum_mins = 1;
        let prober = ScriptedProber::new(&[("a", 100), ("b", 200)]);
        let writer = ScheduleWriter::new(Arc::new(config), prober);
        let playlist = playlist_from(&["a.mp4", "%RESTART", "b.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(3600), &[], now)
            .await;
        // 100s consumed > 60s minimum, so the restart wait is added
        assert_eq!(items[1].unixtime, now.timestamp() + 100 + 420);
    }

    #[tokio::test]
    async fn test_enumeration_bounds() {
        let mut config = test_config();
        config.schedule.max_videos = 6;
        let prober = ScriptedProber::new(&[("a", 100), ("b", 100), ("c", 100)]);
        let writer = ScheduleWriter::new(Arc::new(config), prober);
        // 3-entry playlist cycles; max_videos 6 bounds the walk
        let playlist = playlist_from(&["a.mp4", "b.mp4", "c.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(&playlist, 0, snapshot(100_000), &[], now)
            .await;
        // Current item plus six more
        assert_eq!(items.iter().filter(|i| i.is_normal()).count(), 7);
        assert_eq!(items.last().unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_elapsed_time_shortens_first_advance() {
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[("a", 500), ("b", 100)]);
        let writer = ScheduleWriter::new(config, prober);
        let playlist = playlist_from(&["a.mp4", "b.mp4"]);
        let now = Utc::now();

        let (items, _) = writer
            .build_upcoming(
                &playlist,
                0,
                ScheduleSnapshot {
                    elapsed_time: 200,
                    stream_time_remaining: 3600,
                },
                &[],
                now,
            )
            .await;
        // 300 seconds of the current item remain
        assert_eq!(items[1].unixtime, now.timestamp() + 300);
    }

    fn item(name: &str, unixtime: i64, length: u64) -> ScheduleItem {
        ScheduleItem {
            entry_type: "normal".to_string(),
            name: name.to_string(),
            time: String::new(),
            unixtime,
            length,
            extra_info: String::new(),
        }
    }

    #[test]
    fn test_apply_history_moves_one_normal() {
        let mut config = test_config();
        config.schedule.previous_max_videos = 5;
        config.schedule.previous_min_videos = 1;
        let config = Arc::new(config);
        let prober = ScriptedProber::new(&[]);
        let writer = ScheduleWriter::new(config.clone(), prober);
        let mut stats = StreamStats::new(&config);
        let now = Utc::now();

        stats.recent_playlist =
            VecDeque::from(vec![ScheduleItem::extra("note"), item("a", now.timestamp(), 100)]);

        writer.apply_history(&mut stats, &[item("b", now.timestamp(), 50)], true, now);

        let previous = stats.previous_files.as_ref().unwrap();
        assert_eq!(previous.len(), 2);
        assert_eq!(previous[0].entry_type, "extra");
        assert_eq!(previous[1].name, "a");
        // recent replaced by the new generation
        assert_eq!(stats.recent_playlist.len(), 1);
        assert_eq!(stats.recent_playlist[0].name, "b");
    }

    #[test]
    fn test_apply_history_retry_case_is_a_no_op() {
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[]);
        let writer = ScheduleWriter::new(config.clone(), prober);
        let mut stats = StreamStats::new(&config);
        let now = Utc::now();

        let head = item("a", now.timestamp(), 100);
        stats.previous_files.as_mut().unwrap().push_back(head.clone());
        stats.recent_playlist = VecDeque::from(vec![head.clone(), item("b", now.timestamp(), 50)]);

        writer.apply_history(&mut stats, &[head.clone()], true, now);

        // The tail already equals the first recent item: nothing moves
        let previous = stats.previous_files.as_ref().unwrap();
        assert_eq!(previous.len(), 1);
    }

    #[test]
    fn test_apply_history_prunes_to_max() {
        let mut config = test_config();
        config.schedule.previous_max_videos = 2;
        config.schedule.previous_min_videos = 1;
        config.schedule.previous_length_mins = 10_000;
        let config = Arc::new(config);
        let prober = ScriptedProber::new(&[]);
        let writer = ScheduleWriter::new(config.clone(), prober);
        let mut stats = StreamStats::new(&config);
        let now = Utc::now();

        let previous = stats.previous_files.as_mut().unwrap();
        for i in 0..3 {
            previous.push_back(item(&format!("old{i}"), now.timestamp(), 10));
        }
        stats.recent_playlist = VecDeque::from(vec![item("a", now.timestamp(), 100)]);

        writer.apply_history(&mut stats, &[item("b", now.timestamp(), 50)], true, now);

        let previous = stats.previous_files.as_ref().unwrap();
        assert_eq!(previous.iter().filter(|i| i.is_normal()).count(), 2);
        assert_eq!(previous[0].name, "old2");
        assert_eq!(previous[1].name, "a");
    }

    #[test]
    fn test_apply_history_stale_pruning_keeps_minimum() {
        let mut config = test_config();
        config.schedule.previous_max_videos = 10;
        config.schedule.previous_min_videos = 2;
        config.schedule.previous_length_mins = 1;
        config.schedule.previous_prune_tight = true;
        let config = Arc::new(config);
        let prober = ScriptedProber::new(&[]);
        let writer = ScheduleWriter::new(config.clone(), prober);
        let mut stats = StreamStats::new(&config);
        let now = Utc::now();

        let stale = now.timestamp() - 3600;
        let previous = stats.previous_files.as_mut().unwrap();
        for i in 0..4 {
            previous.push_back(item(&format!("old{i}"), stale, 10));
        }
        stats.recent_playlist = VecDeque::from(vec![item("a", now.timestamp(), 100)]);

        writer.apply_history(&mut stats, &[item("b", now.timestamp(), 50)], true, now);

        // All five normals are stale candidates, but the configured
        // minimum of two must survive
        let previous = stats.previous_files.as_ref().unwrap();
        assert_eq!(previous.iter().filter(|i| i.is_normal()).count(), 2);
    }

    #[test]
    fn test_loose_pruning_keeps_one_extra() {
        let mut config = test_config();
        config.schedule.previous_max_videos = 10;
        config.schedule.previous_min_videos = 1;
        config.schedule.previous_length_mins = 1;
        config.schedule.previous_prune_tight = false;
        let config = Arc::new(config);
        let prober = ScriptedProber::new(&[]);
        let writer = ScheduleWriter::new(config.clone(), prober);
        let mut stats = StreamStats::new(&config);
        let now = Utc::now();

        let stale = now.timestamp() - 3600;
        let previous = stats.previous_files.as_mut().unwrap();
        for i in 0..3 {
            previous.push_back(item(&format!("old{i}"), stale, 10));
        }
        stats.recent_playlist = VecDeque::from(vec![item("a", now.timestamp(), 100)]);

        writer.apply_history(&mut stats, &[item("b", now.timestamp(), 50)], true, now);

        // Tight mode would drop all stale items down to the minimum;
        // loose keeps one more than that
        let previous = stats.previous_files.as_ref().unwrap();
        let tight_result = 1;
        assert_eq!(
            previous.iter().filter(|i| i.is_normal()).count(),
            tight_result + 1
        );
    }

    #[tokio::test]
    async fn test_document_shape() {
        let config = Arc::new(test_config());
        let prober = ScriptedProber::new(&[("a", 100)]);
        let writer = ScheduleWriter::new(config.clone(), prober);
        let mut stats = StreamStats::new(&config);
        let playlist = playlist_from(&["a.mp4"]);
        let now = Utc::now();

        let (doc, issues) = writer
            .generate(&playlist, 0, &mut stats, &[], true, now)
            .await;
        assert!(issues.is_empty());
        assert_eq!(doc.script_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(doc.offset_time, 0);

        // Round-trip: keys and values survive re-parsing
        let json = serde_json::to_string(&doc).unwrap();
        let reparsed: ScheduleDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed.coming_up_next, doc.coming_up_next);
        assert_eq!(reparsed.video_start_time, doc.video_start_time);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["coming_up_next"][0]["type"], "normal");
    }
}
