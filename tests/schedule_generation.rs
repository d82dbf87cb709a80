//! End-to-end schedule generation over a realistic playlist: alternate
//! names, inline info, extras, an excluded item, a restart directive and
//! playlist wraparound.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use stream_sentry::config::Config;
use stream_sentry::errors::ProbeError;
use stream_sentry::playlist::PlaylistLoader;
use stream_sentry::schedule::ScheduleWriter;
use stream_sentry::services::MediaProber;
use stream_sentry::stats::StreamStats;

/// Duration probe scripted by file stem.
struct ScriptedProber {
    durations: HashMap<String, u64>,
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

fn scripted_prober() -> Arc<ScriptedProber> {
    let durations = [
        ("Test file 1", 1000),
        ("Test file 2", 360),
        ("Test file 3", 180),
        ("Test file 4", 270),
        ("Test file 5", 720),
        ("Test file 6", 30),
        ("Test file 7", 100),
        ("Test file 8", 180),
        ("Test file 9", 270),
    ]
    .into_iter()
    .map(|(name, length)| (name.to_string(), length))
    .collect();
    Arc::new(ScriptedProber { durations })
}

fn scenario_config(alt_names_file: &Path) -> Config {
    let mut config = Config::default();
    config.stream.url = "rtmp://stream.example.com/live".to_string();
    config.stream.video_padding_secs = 0;
    config.stream.time_before_restart_mins = 60;
    config.stream.restart_wait_secs = 420;
    config.schedule.min_videos = 1;
    config.schedule.max_videos = 6;
    config.schedule.upcoming_length_mins = 100_000;
    config.schedule.min_video_secs = 0;
    config.schedule.exclude_prefixes = vec!["Test file 7".to_string()];
    config.schedule.previous_min_videos = 1;
    config.schedule.previous_max_videos = 1;
    config.schedule.previous_length_mins = 100_000;
    config.paths.media_dir = "/media/videos".into();
    config.paths.alt_names_file = Some(alt_names_file.to_path_buf());
    config
}

const PLAYLIST_LINES: &[&str] = &[
    "Test file 1.mp4",
    ":Comment 1",
    "Test file 2.mp4",
    "Test file 3.mp4 :Extra info from inline comment",
    "Test file 4.mp4",
    "Test file 5.mp4",
    ":Comment 2",
    ":Comment 3",
    "Test file 6.mp4",
    "Test file 7.mp4",
    "%RESTART",
    "Test file 8.mp4",
    "Test file 9.mp4",
];

#[tokio::test]
async fn test_happy_path_with_excluded_item() {
    let dir = tempfile::tempdir().unwrap();
    let alt_path = dir.path().join("alt_names.json");
    std::fs::write(
        &alt_path,
        r#"{"Test file 4": "Replacement occurs on test file 4"}"#,
    )
    .unwrap();

    let config = Arc::new(scenario_config(&alt_path));
    let loader = PlaylistLoader::new(&config);
    let playlist = loader
        .load_lines(PLAYLIST_LINES.iter().map(|line| line.to_string()))
        .unwrap();

    let writer = ScheduleWriter::new(config.clone(), scripted_prober());
    let mut stats = StreamStats::new(&config);

    // First generation: "Test file 4" (index 4) is playing. Its record
    // becomes the head of `recent`, to be folded into previous_files on
    // the next call.
    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let (doc, issues) = writer.generate(&playlist, 4, &mut stats, &[], true, t0).await;
    assert!(issues.is_empty());
    assert_eq!(
        doc.coming_up_next[0].name,
        "Replacement occurs on test file 4"
    );
    assert_eq!(doc.coming_up_next[0].length, 270);
    assert!(doc.previous_files.is_empty());

    // Second generation: "Test file 5" (index 5) is playing.
    let t1 = t0 + chrono::Duration::seconds(270);
    let (doc, issues) = writer.generate(&playlist, 5, &mut stats, &[], true, t1).await;
    assert!(issues.is_empty());

    let items = &doc.coming_up_next;

    // Currently playing item with its real start timestamp
    assert_eq!(items[0].name, "Test file 5");
    assert_eq!(items[0].length, 720);
    assert_eq!(items[0].unixtime, t1.timestamp());

    // The two extras that follow it in the playlist
    assert_eq!(items[1].entry_type, "extra");
    assert_eq!(items[1].extra_info, "Comment 2");
    assert_eq!(items[2].extra_info, "Comment 3");

    // Test file 6 starts when Test file 5 ends
    assert_eq!(items[3].name, "Test file 6");
    assert_eq!(items[3].unixtime, t1.timestamp() + 720);

    // Test file 7 is excluded but its length rolls into the next
    // timestamp; the %RESTART is under the restart-minimum and adds
    // nothing
    assert_eq!(items[4].name, "Test file 8");
    assert_eq!(items[4].unixtime, items[3].unixtime + 30 + 100);

    assert_eq!(items[5].name, "Test file 9");
    assert_eq!(items[5].unixtime, items[4].unixtime + 180);

    // Wraparound to the head of the playlist
    assert_eq!(items[6].name, "Test file 1");
    assert_eq!(items[6].unixtime, items[5].unixtime + 270);

    assert_eq!(items[7].entry_type, "extra");
    assert_eq!(items[7].extra_info, "Comment 1");

    assert_eq!(items[8].name, "Test file 2");
    assert_eq!(items[8].unixtime, items[6].unixtime + 1000);

    assert_eq!(items[9].name, "Test file 3");
    assert_eq!(items[9].unixtime, items[8].unixtime + 360);
    assert_eq!(items[9].extra_info, "Extra info from inline comment");

    // Six normal entries follow the current item, then the walk stops
    assert_eq!(items.len(), 10);

    // The previously playing item surfaced in previous_files under its
    // alternate name
    assert_eq!(doc.previous_files.len(), 1);
    assert_eq!(
        doc.previous_files[0].name,
        "Replacement occurs on test file 4"
    );
    assert_eq!(doc.previous_files[0].length, 270);

    // Timestamps are strictly non-decreasing
    let mut last = 0;
    for item in items.iter().filter(|item| item.is_normal()) {
        assert!(item.unixtime >= last);
        last = item.unixtime;
    }
}

#[tokio::test]
async fn test_wraparound_preserves_previous_files() {
    let dir = tempfile::tempdir().unwrap();
    let alt_path = dir.path().join("alt_names.json");
    std::fs::write(&alt_path, "{}").unwrap();

    let config = Arc::new(scenario_config(&alt_path));
    let loader = PlaylistLoader::new(&config);
    let playlist = loader
        .load_lines(PLAYLIST_LINES.iter().map(|line| line.to_string()))
        .unwrap();

    let writer = ScheduleWriter::new(config.clone(), scripted_prober());
    let mut stats = StreamStats::new(&config);

    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    writer.generate(&playlist, 11, &mut stats, &[], true, t0).await;

    // Playing the last entry, then wrapping to index 0
    let t1 = t0 + chrono::Duration::seconds(180);
    writer.generate(&playlist, 12, &mut stats, &[], true, t1).await;
    let t2 = t1 + chrono::Duration::seconds(270);
    let (doc, _) = writer.generate(&playlist, 0, &mut stats, &[], true, t2).await;

    // previous_files survived the wraparound, holding the most recent
    // completed item (bounded at previous_max_videos = 1)
    assert_eq!(doc.previous_files.len(), 1);
    assert_eq!(doc.previous_files[0].name, "Test file 9");
    assert_eq!(doc.coming_up_next[0].name, "Test file 1");
}

#[tokio::test]
async fn test_schedule_survives_json_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let alt_path = dir.path().join("alt_names.json");
    std::fs::write(&alt_path, "{}").unwrap();

    let config = Arc::new(scenario_config(&alt_path));
    let loader = PlaylistLoader::new(&config);
    let playlist = loader
        .load_lines(PLAYLIST_LINES.iter().map(|line| line.to_string()))
        .unwrap();

    let writer = ScheduleWriter::new(config.clone(), scripted_prober());
    let mut stats = StreamStats::new(&config);

    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let (doc, _) = writer.generate(&playlist, 0, &mut stats, &[], true, t0).await;

    let json = serde_json::to_string(&doc).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert!(value["program_start_time"].is_string());
    assert!(value["video_start_time"].is_string());
    assert!(value["offset_time"].is_number());
    assert!(value["coming_up_next"].is_array());
    assert!(value["previous_files"].is_array());
    assert_eq!(value["script_version"], env!("CARGO_PKG_VERSION"));

    let reparsed: stream_sentry::schedule::ScheduleDoc = serde_json::from_str(&json).unwrap();
    assert_eq!(reparsed.coming_up_next, doc.coming_up_next);
    assert_eq!(reparsed.previous_files, doc.previous_files);
}
