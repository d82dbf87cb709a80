//! Release version checking
//!
//! Periodically fetches the project's releases list and compares the
//! newest matching release against the version we already know about.
//! A `version.json` sidecar remembers the latest observed tag across
//! restarts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default location of the releases list; override with
/// [`VersionProber::with_releases_url`].
const RELEASES_URL: &str =
    "https://api.github.com/repos/stream-sentry/stream-sentry/releases";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A release worth telling the operator about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub name: String,
    pub is_prerelease: bool,
    pub tag: String,
    pub notes: String,
    pub url: String,
}

/// Result of one version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheckOutcome {
    /// Nothing newer than what we already know
    NoNewRelease,
    /// A strictly newer release exists
    NewRelease(ReleaseInfo),
    /// Network or HTTP failure; check again in an hour
    TryAgainLater,
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    name: String,
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    body: String,
    #[serde(default)]
    html_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionSidecar {
    version: String,
    prerelease: bool,
}

pub struct VersionProber {
    client: reqwest::Client,
    releases_url: String,
    sidecar_path: PathBuf,
    include_prereleases: bool,
}

impl VersionProber {
    pub fn new(sidecar_path: impl Into<PathBuf>, include_prereleases: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            releases_url: RELEASES_URL.to_string(),
            sidecar_path: sidecar_path.into(),
            include_prereleases,
        }
    }

    /// Fetch releases from a different endpoint.
    pub fn with_releases_url(mut self, url: impl Into<String>) -> Self {
        self.releases_url = url.into();
        self
    }

    /// Fetch the releases list and compare against `newest_known`.
    pub async fn check(&self, newest_known: &str) -> VersionCheckOutcome {
        let releases: Vec<Release> = match self.fetch_releases().await {
            Ok(releases) => releases,
            Err(e) => {
                warn!("Version check failed: {e:#}");
                return VersionCheckOutcome::TryAgainLater;
            }
        };

        // The first release whose prerelease flag matches the user's
        // preference is the candidate.
        let Some(candidate) = releases
            .into_iter()
            .find(|release| release.prerelease == self.include_prereleases)
        else {
            debug!("No release matching prerelease={}", self.include_prereleases);
            return VersionCheckOutcome::NoNewRelease;
        };

        self.write_sidecar(&candidate);

        if version_components(&candidate.tag_name) > version_components(newest_known) {
            VersionCheckOutcome::NewRelease(ReleaseInfo {
                name: candidate.name,
                is_prerelease: candidate.prerelease,
                tag: candidate.tag_name,
                notes: candidate.body,
                url: candidate.html_url,
            })
        } else {
            debug!(
                "Newest release {} is not newer than {newest_known}",
                candidate.tag_name
            );
            VersionCheckOutcome::NoNewRelease
        }
    }

    async fn fetch_releases(&self) -> Result<Vec<Release>> {
        self.client
            .get(&self.releases_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("fetching {}", self.releases_url))?
            .json()
            .await
            .context("parsing releases list")
    }

    /// Always rewrite the sidecar with the latest observed release.
    fn write_sidecar(&self, release: &Release) {
        let sidecar = VersionSidecar {
            version: release.tag_name.trim_start_matches('v').to_string(),
            prerelease: release.prerelease,
        };
        match serde_json::to_string(&sidecar) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.sidecar_path, json) {
                    warn!(
                        "Error writing version sidecar {}: {e}",
                        self.sidecar_path.display()
                    );
                }
            }
            Err(e) => warn!("Error serializing version sidecar: {e}"),
        }
    }

    /// Load the previously observed version from the sidecar, if any.
    pub fn load_sidecar(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.sidecar_path).ok()?;
        let sidecar: VersionSidecar = serde_json::from_str(&raw).ok()?;
        Some(sidecar.version)
    }
}

/// Numeric `major.minor.patch` components of a version tag. A leading
/// `v` is ignored; missing or non-numeric components compare as 0.
pub fn version_components(tag: &str) -> (u64, u64, u64) {
    let mut parts = tag
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|part| part.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_components() {
        assert_eq!(version_components("1.2.3"), (1, 2, 3));
        assert_eq!(version_components("v2.0.10"), (2, 0, 10));
        assert_eq!(version_components("3"), (3, 0, 0));
        assert_eq!(version_components("garbage"), (0, 0, 0));
    }

    #[test]
    fn test_version_ordering_is_numeric() {
        assert!(version_components("0.10.0") > version_components("0.9.9"));
        assert!(version_components("1.0.0") > version_components("0.99.99"));
        assert!(version_components("2.0.0") == version_components("v2.0.0"));
    }

    #[tokio::test]
    async fn test_unreachable_host_returns_try_again_later() {
        let dir = tempfile::tempdir().unwrap();
        let prober = VersionProber::new(dir.path().join("version.json"), false)
            .with_releases_url("http://127.0.0.1:1/releases");
        assert_eq!(
            prober.check("0.1.0").await,
            VersionCheckOutcome::TryAgainLater
        );
    }

    #[test]
    fn test_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.json");
        let prober = VersionProber::new(&path, false);

        prober.write_sidecar(&Release {
            name: "Release 1.4.0".to_string(),
            tag_name: "v1.4.0".to_string(),
            prerelease: false,
            body: String::new(),
            html_url: String::new(),
        });

        assert_eq!(prober.load_sidecar().as_deref(), Some("1.4.0"));
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], "1.4.0");
        assert_eq!(value["prerelease"], false);
    }
}
