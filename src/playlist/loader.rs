//! Playlist file loading and alternate-name resolution

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{Directive, Playlist, PlaylistEntry, parse_lines};
use crate::config::Config;
use crate::errors::PlaylistError;

/// Display-name overrides keyed by original display name.
pub type AltNames = HashMap<String, String>;

/// Loads the playlist once at startup. Recreating the playlist requires
/// a program restart.
pub struct PlaylistLoader {
    base_dir: PathBuf,
    alt_names: AltNames,
    stop_after_last: bool,
}

impl PlaylistLoader {
    pub fn new(config: &Config) -> Self {
        let alt_names = config
            .paths
            .alt_names_file
            .as_deref()
            .map(load_alt_names)
            .unwrap_or_default();

        Self {
            base_dir: config.paths.media_dir.clone(),
            alt_names,
            stop_after_last: config.stream.stop_after_last_video,
        }
    }

    /// Load and parse the playlist file. An empty playlist is fatal.
    pub fn load(&self, path: &Path) -> Result<Playlist, PlaylistError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlaylistError::FileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                PlaylistError::Io(e)
            }
        })?;

        // A UTF-8 BOM on the first line is tolerated.
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(&raw);

        // Emptiness is judged on the file's real content, before any
        // synthetic entries are appended.
        if raw.lines().next().is_none() {
            return Err(PlaylistError::Empty {
                path: path.display().to_string(),
            });
        }

        self.load_lines(raw.lines().map(str::to_string))
    }

    /// Parse an in-memory sequence of playlist lines.
    pub fn load_lines(
        &self,
        lines: impl IntoIterator<Item = String>,
    ) -> Result<Playlist, PlaylistError> {
        let mut playlist = parse_lines(lines, &self.base_dir)?;

        for (line_num, entry) in &mut playlist {
            match entry {
                PlaylistEntry::Normal { display_name, .. } => {
                    if let Some(replacement) = self.alt_names.get(display_name) {
                        debug!(
                            "Line {line_num}: display name '{display_name}' replaced with \
                             '{replacement}'"
                        );
                        *display_name = replacement.clone();
                    }
                }
                PlaylistEntry::Extra { text } => {
                    debug!("Line {line_num}: extra entry: {text}");
                }
                PlaylistEntry::Command { directive, .. } => {
                    debug!("Line {line_num}: {directive} directive");
                }
                PlaylistEntry::Blank => {}
            }
        }

        // A playlist with no real entries gets no synthetic STOP either.
        if self.stop_after_last && !playlist.is_empty() {
            let line_num = playlist.len() as u32 + 1;
            playlist.push((
                line_num,
                PlaylistEntry::Command {
                    directive: Directive::Stop,
                    arg: None,
                },
            ));
        }

        Ok(playlist)
    }
}

/// Read the alternate-names JSON map. A missing or malformed file is a
/// warning, not an error; non-string values keep the original name.
fn load_alt_names(path: &Path) -> AltNames {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Alternate names file {} not readable: {e}", path.display());
            return AltNames::new();
        }
    };

    let parsed: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Error parsing alternate names file {}: {e}", path.display());
            return AltNames::new();
        }
    };

    let Some(object) = parsed.as_object() else {
        warn!("Alternate names file {} is not a JSON object", path.display());
        return AltNames::new();
    };

    let mut map = AltNames::new();
    for (name, value) in object {
        match value.as_str() {
            Some(replacement) => {
                map.insert(name.clone(), replacement.to_string());
            }
            None => {
                warn!("Alternate name for {name} is not a valid string");
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loader_with(config: impl FnOnce(&mut Config)) -> PlaylistLoader {
        let mut cfg = Config::default();
        cfg.paths.media_dir = PathBuf::from("/media/videos");
        config(&mut cfg);
        PlaylistLoader::new(&cfg)
    }

    #[test]
    fn test_load_lines_applies_alt_names() {
        let dir = tempfile::tempdir().unwrap();
        let alt_path = dir.path().join("alt_names.json");
        std::fs::write(
            &alt_path,
            r#"{"Test file 4": "Replacement occurs on test file 4", "Bad": 7}"#,
        )
        .unwrap();

        let loader = loader_with(|cfg| {
            cfg.paths.alt_names_file = Some(alt_path.clone());
        });

        let playlist = loader
            .load_lines(["Test file 4.mp4".to_string(), "Bad.mp4".to_string()])
            .unwrap();

        match &playlist[0].1 {
            PlaylistEntry::Normal { display_name, .. } => {
                assert_eq!(display_name, "Replacement occurs on test file 4");
            }
            other => panic!("unexpected entry {other:?}"),
        }
        // Non-string replacement keeps the original name
        match &playlist[1].1 {
            PlaylistEntry::Normal { display_name, .. } => assert_eq!(display_name, "Bad"),
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_stop_after_last_appends_stop() {
        let loader = loader_with(|cfg| {
            cfg.stream.stop_after_last_video = true;
        });
        let playlist = loader.load_lines(["a.mp4".to_string()]).unwrap();
        assert_eq!(playlist.len(), 2);
        assert_eq!(
            playlist[1],
            (
                2,
                PlaylistEntry::Command {
                    directive: Directive::Stop,
                    arg: None
                }
            )
        );
    }

    #[test]
    fn test_load_tolerates_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlist.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"\xef\xbb\xbfa.mp4\nb.mp4\n").unwrap();

        let loader = loader_with(|_| {});
        let playlist = loader.load(&path).unwrap();
        match &playlist[0].1 {
            PlaylistEntry::Normal { display_name, .. } => assert_eq!(display_name, "a"),
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_missing_playlist_is_fatal() {
        let loader = loader_with(|_| {});
        let err = loader.load(Path::new("/nonexistent/playlist.txt")).unwrap_err();
        assert!(matches!(err, PlaylistError::FileNotFound { .. }));
    }

    #[test]
    fn test_empty_playlist_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlist.txt");
        std::fs::write(&path, "").unwrap();

        let loader = loader_with(|_| {});
        let err = loader.load(&path).unwrap_err();
        assert!(matches!(err, PlaylistError::Empty { .. }));
    }

    #[test]
    fn test_empty_playlist_fatal_even_with_stop_after_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlist.txt");
        std::fs::write(&path, "").unwrap();

        // The synthetic STOP must not turn an empty file into a
        // one-entry playlist.
        let loader = loader_with(|cfg| {
            cfg.stream.stop_after_last_video = true;
        });
        let err = loader.load(&path).unwrap_err();
        assert!(matches!(err, PlaylistError::Empty { .. }));
    }

    #[test]
    fn test_no_synthetic_stop_for_empty_lines() {
        let loader = loader_with(|cfg| {
            cfg.stream.stop_after_last_video = true;
        });
        let playlist = loader.load_lines(std::iter::empty::<String>()).unwrap();
        assert!(playlist.is_empty());
    }
}
