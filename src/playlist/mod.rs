//! Playlist model and loader
//!
//! The playlist is a line-oriented UTF-8 text file. Blank lines and lines
//! starting with `;`, `#` or `//` carry no data but keep line numbers
//! stable; `:` lines are annotations rendered into the schedule; `%` lines
//! are stream-control directives; everything else names a video file.

mod loader;

pub use loader::{AltNames, PlaylistLoader};

use std::path::{Path, PathBuf};

use crate::errors::PlaylistError;

/// A `%`-prefixed stream-control directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Tear the relay down and bring it back up, with optional
    /// pre/post clips
    Restart,
    /// Restart without the pre/post clips
    InstantRestart,
    /// Shut down cleanly
    Stop,
    /// Mail the operator, optionally with a message
    Mail,
    /// Raise a synthetic failure to exercise recovery
    Exception,
}

impl Directive {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "RESTART" => Some(Self::Restart),
            "INSTANT_RESTART" => Some(Self::InstantRestart),
            "STOP" => Some(Self::Stop),
            "MAIL" => Some(Self::Mail),
            "EXCEPTION" => Some(Self::Exception),
            _ => None,
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Restart => "RESTART",
            Self::InstantRestart => "INSTANT_RESTART",
            Self::Stop => "STOP",
            Self::Mail => "MAIL",
            Self::Exception => "EXCEPTION",
        };
        f.write_str(name)
    }
}

/// One parsed playlist line. Consumers match exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistEntry {
    /// A video file to play
    Normal {
        /// Name shown in the schedule; the alternate-name map may
        /// replace it
        display_name: String,
        /// Source path resolved against the media base directory
        absolute_path: PathBuf,
        /// Text split off a trailing ` :suffix` on the line
        inline_info: String,
    },
    /// An annotation attached to the next video in the schedule
    Extra { text: String },
    /// A stream-control directive
    Command {
        directive: Directive,
        arg: Option<String>,
    },
    /// A blank line or comment; preserves line numbering
    Blank,
}

impl PlaylistEntry {
    /// Parse a single playlist line. `base_dir` anchors relative paths.
    pub fn parse(line: &str, base_dir: &Path) -> Result<Self, String> {
        if line.is_empty()
            || line.starts_with(';')
            || line.starts_with('#')
            || line.starts_with("//")
        {
            return Ok(Self::Blank);
        }

        if let Some(text) = line.strip_prefix(':') {
            return Ok(Self::Extra {
                text: text.to_string(),
            });
        }

        if let Some(rest) = line.strip_prefix('%') {
            let (word, arg) = match rest.split_once(' ') {
                Some((word, arg)) => (word, Some(arg.to_string())),
                None => (rest, None),
            };
            let directive =
                Directive::parse(word).ok_or_else(|| word.to_string())?;
            return Ok(Self::Command { directive, arg });
        }

        // A normal entry; ` :` (with the leading space) splits off
        // inline schedule info. Leading whitespace is part of the path.
        let (file_part, inline_info) = match line.split_once(" :") {
            Some((file, info)) => (file, info.to_string()),
            None => (line, String::new()),
        };

        let path = Path::new(file_part);
        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        };

        let display_name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self::Normal {
            display_name,
            absolute_path,
            inline_info,
        })
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal { .. })
    }
}

/// An ordered playlist: `(1-based line number, entry)` pairs. Line
/// numbers are stable identifiers used in logs and alerts.
pub type Playlist = Vec<(u32, PlaylistEntry)>;

/// Convenience constructor used by the loader and by tests.
pub(crate) fn parse_lines(
    lines: impl IntoIterator<Item = String>,
    base_dir: &Path,
) -> Result<Playlist, PlaylistError> {
    let mut playlist = Playlist::new();
    for (index, line) in lines.into_iter().enumerate() {
        let line_num = index as u32 + 1;
        let entry = PlaylistEntry::parse(&line, base_dir).map_err(|directive| {
            PlaylistError::UnknownDirective {
                line: line_num,
                directive,
            }
        })?;
        playlist.push((line_num, entry));
    }
    Ok(playlist)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PathBuf {
        PathBuf::from("/media/videos")
    }

    #[test]
    fn test_blank_and_comment_lines() {
        for line in ["", "; comment", "# comment", "// comment"] {
            assert_eq!(PlaylistEntry::parse(line, &base()).unwrap(), PlaylistEntry::Blank);
        }
    }

    #[test]
    fn test_extra_line() {
        assert_eq!(
            PlaylistEntry::parse(":Movie night", &base()).unwrap(),
            PlaylistEntry::Extra {
                text: "Movie night".to_string()
            }
        );
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(
            PlaylistEntry::parse("%RESTART", &base()).unwrap(),
            PlaylistEntry::Command {
                directive: Directive::Restart,
                arg: None
            }
        );
        assert_eq!(
            PlaylistEntry::parse("%MAIL check the encoder", &base()).unwrap(),
            PlaylistEntry::Command {
                directive: Directive::Mail,
                arg: Some("check the encoder".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_directive_rejected() {
        assert!(PlaylistEntry::parse("%FROBNICATE", &base()).is_err());
    }

    #[test]
    fn test_normal_relative_path() {
        let entry = PlaylistEntry::parse("shows/Episode 1.mp4", &base()).unwrap();
        assert_eq!(
            entry,
            PlaylistEntry::Normal {
                display_name: "Episode 1".to_string(),
                absolute_path: PathBuf::from("/media/videos/shows/Episode 1.mp4"),
                inline_info: String::new(),
            }
        );
    }

    #[test]
    fn test_normal_absolute_path() {
        let entry = PlaylistEntry::parse("/mnt/other/clip.mkv", &base()).unwrap();
        match entry {
            PlaylistEntry::Normal { absolute_path, .. } => {
                assert_eq!(absolute_path, PathBuf::from("/mnt/other/clip.mkv"));
            }
            other => panic!("expected normal entry, got {other:?}"),
        }
    }

    #[test]
    fn test_inline_info_split() {
        let entry = PlaylistEntry::parse("clip.mp4 :premiere", &base()).unwrap();
        match entry {
            PlaylistEntry::Normal {
                display_name,
                inline_info,
                ..
            } => {
                assert_eq!(display_name, "clip");
                assert_eq!(inline_info, "premiere");
            }
            other => panic!("expected normal entry, got {other:?}"),
        }
    }

    #[test]
    fn test_colon_without_space_stays_in_path() {
        // Only " :" (space then colon) starts inline info
        let entry = PlaylistEntry::parse("a:b.mp4", &base()).unwrap();
        match entry {
            PlaylistEntry::Normal { absolute_path, .. } => {
                assert_eq!(absolute_path, PathBuf::from("/media/videos/a:b.mp4"));
            }
            other => panic!("expected normal entry, got {other:?}"),
        }
    }

    #[test]
    fn test_leading_whitespace_preserved() {
        let entry = PlaylistEntry::parse("  indented.mp4", &base()).unwrap();
        match entry {
            PlaylistEntry::Normal { absolute_path, .. } => {
                assert_eq!(absolute_path, PathBuf::from("/media/videos/  indented.mp4"));
            }
            other => panic!("expected normal entry, got {other:?}"),
        }
    }

    #[test]
    fn test_line_numbers_start_at_one() {
        let playlist = parse_lines(
            ["a.mp4".to_string(), String::new(), "b.mp4".to_string()],
            &base(),
        )
        .unwrap();
        assert_eq!(playlist.len(), 3);
        assert_eq!(playlist[0].0, 1);
        assert_eq!(playlist[1].1, PlaylistEntry::Blank);
        assert_eq!(playlist[2].0, 3);
    }
}
