/// Configuration default values
///
/// All default values for configuration options in one place, so that they
/// are easily changeable without hunting through the section structs.

// Path defaults
pub const DEFAULT_ENCODER_BINARY: &str = "/usr/local/bin/ffmpeg";
pub const DEFAULT_RELAY_BINARY: &str = "/usr/local/bin/ffmpeg";
pub const DEFAULT_PROBE_BINARY: &str = "/usr/local/bin/ffprobe";
pub const DEFAULT_MEDIA_DIR: &str = "/media/videos";
pub const DEFAULT_PLAYLIST: &str = "playlist.txt";
pub const DEFAULT_CURSOR_FILE: &str = "play_index.txt";

// Stream defaults
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_VIDEO_PADDING_SECS: u64 = 2;
pub const DEFAULT_ENCODER_ARGS: &str = "-hide_banner -loglevel error -re -ss {skip_time} -i {file} -filter_complex \"tpad=stop_duration={video_padding};apad=pad_dur={video_padding}\" -c:v libx264 -b:v 4000k -c:a aac -b:a 192k -f flv -g 60 rtmp://localhost:1935/live/";
pub const DEFAULT_RELAY_ARGS: &str = "-hide_banner -loglevel error -i rtmp://localhost:1935/live -c:v copy -c:a copy -f flv {stream_url}";
pub const DEFAULT_TIME_BEFORE_RESTART_MINS: u64 = 1440;
pub const DEFAULT_RESTART_WAIT_SECS: u64 = 10;
pub const DEFAULT_RESTART_MINIMUM_MINS: u64 = 30;
pub const DEFAULT_WAIT_AFTER_RETRY_SECS: u64 = 5;

// Cursor defaults
pub const DEFAULT_RECORD_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REWIND_SECS: u64 = 30;

// Schedule defaults
pub const DEFAULT_SCHEDULE_MIN_VIDEOS: usize = 1;
pub const DEFAULT_SCHEDULE_MAX_VIDEOS: usize = 15;
pub const DEFAULT_UPCOMING_LENGTH_MINS: u64 = 240;
pub const DEFAULT_PREVIOUS_MIN_VIDEOS: usize = 1;
pub const DEFAULT_PREVIOUS_MAX_VIDEOS: usize = 3;
pub const DEFAULT_PREVIOUS_LENGTH_MINS: u64 = 30;
pub const DEFAULT_MIN_VIDEO_SECS: u64 = 0;

// Retry defaults
pub const DEFAULT_RETRY_ATTEMPTS: i32 = 0;
pub const DEFAULT_RETRY_PERIOD_SECS: u64 = 5;

// Remote defaults
pub const DEFAULT_REMOTE_PORT: u16 = 22;
pub const DEFAULT_UPLOAD_ATTEMPTS: i32 = 5;
pub const DEFAULT_TRANSFER_BINARY: &str = "scp";

// Mail defaults
pub const DEFAULT_MAIL_PORT: u16 = 587;
pub const DEFAULT_MAIL_ENV_PREFIX: &str = "STREAM_SENTRY_MAIL_";
pub const DEFAULT_MAIL_PROGRAM_NAME: &str = "stream-sentry";
pub const DEFAULT_MAX_ERRORS_REPORTED: usize = 10;

// Misc defaults
pub const DEFAULT_PLAY_HISTORY_LENGTH: usize = 10;
pub const DEFAULT_MANUAL_RESTART_DELAY_SECS: u64 = 10;
