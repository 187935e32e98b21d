use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SelenaConfig {
    pub paths: PathsSection,
    pub years: YearsSection,
    pub retry: RetrySection,
    pub verifier: VerifierSection,
    pub pacing: PacingSection,
}

impl SelenaConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.output_root).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub output_root: String,
    pub report_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YearsSection {
    /// Reporting years fetched per identifier, in download order.
    pub targets: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub growth_factor: f64,
    pub delay_cap_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifierSection {
    pub poll_timeout_secs: u64,
    pub quiet_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub min_archive_bytes: u64,
    pub archive_pattern: String,
}

impl VerifierSection {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacingSection {
    pub identifier_delay_ms: [u64; 2],
    pub step_delay_ms: [u64; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub chromium: ChromiumSection,
    pub portal: PortalSection,
    pub selectors: SelectorSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub nav_timeout_secs: u64,
    pub step_timeout_secs: u64,
}

impl ChromiumSection {
    pub fn nav_timeout(&self) -> Duration {
        Duration::from_secs(self.nav_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSection {
    pub base_url: String,
    pub user_agent: String,
    pub accept_language: Option<String>,
}

/// Every piece of page markup the portal layer touches. Markup drift on the
/// registry site is absorbed by editing these, never the state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSection {
    pub result_row: String,
    pub result_identifier: String,
    pub organization_marker: String,
    pub dialog_marker: String,
    pub download_button_candidates: Vec<String>,
    pub download_button_label: String,
    pub select_all_candidates: Vec<String>,
    pub select_all_label: String,
    pub archive_button_candidates: Vec<String>,
    pub archive_button_label: String,
    pub year_button_template: String,
    pub captcha_markers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub selena: SelenaConfig,
    pub browser: BrowserConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let selena = load_selena_config(dir.join("selena.toml"))?;
        let browser = load_browser_config(dir.join("browser.toml"))?;
        Ok(Self { selena, browser })
    }
}

pub fn load_selena_config<P: AsRef<Path>>(path: P) -> Result<SelenaConfig> {
    load_toml(path)
}

pub fn load_browser_config<P: AsRef<Path>>(path: P) -> Result<BrowserConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_configs() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let bundle = ConfigBundle::from_directory(dir).expect("configs should parse");
        assert_eq!(bundle.selena.years.targets, vec![2023, 2022]);
        assert_eq!(bundle.selena.retry.max_attempts, 3);
        assert!(bundle.browser.portal.base_url.starts_with("https://"));
        assert!(!bundle.browser.selectors.captcha_markers.is_empty());
    }

    #[test]
    fn missing_config_reports_path() {
        let err = load_selena_config("does-not-exist.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => {
                assert_eq!(path, PathBuf::from("does-not-exist.toml"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
