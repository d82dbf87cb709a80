//! Human-readable time spans for log lines and alert bodies

/// Format a number of seconds as `H:MM:SS`.
pub fn format_hms(seconds: u64) -> String {
    let (hr, rem) = (seconds / 3600, seconds % 3600);
    let (min, sec) = (rem / 60, rem % 60);
    format!("{hr}:{min:02}:{sec:02}")
}

/// Format a number of seconds as a plain-English span, e.g.
/// `"2 days, 3 hours, 1 minute"`. Spans under one second are reported as
/// `"less than a second"`.
pub fn format_span(seconds: u64) -> String {
    if seconds < 1 {
        return "less than a second".to_string();
    }

    let (days, rem) = (seconds / 86400, seconds % 86400);
    let (hr, rem) = (rem / 3600, rem % 3600);
    let (min, sec) = (rem / 60, rem % 60);

    let mut parts = Vec::new();
    for (value, unit) in [(days, "day"), (hr, "hour"), (min, "minute"), (sec, "second")] {
        if value > 0 {
            let plural = if value == 1 { "" } else { "s" };
            parts.push(format!("{value} {unit}{plural}"));
        }
    }

    parts.join(", ")
}
