use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::intake::{IdentityPolicy, IntakeScript, DEFAULT_ALLOWED_DOMAINS};
use crate::prompts;

pub const CONFIG_ENV: &str = "SURVEY_PULSE_CONFIG";
pub const API_BASE_ENV: &str = "SURVEY_PULSE_API_BASE";

/// Runtime settings, read from YAML. Every field has a default so an empty
/// file (or no file) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base: String,
    pub allowed_domains: Vec<String>,
    pub script: Vec<String>,
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub timezone: String,
    pub years: Vec<String>, // initial year selection; empty = years found in the first snapshot
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5000/api".to_string(),
            allowed_domains: DEFAULT_ALLOWED_DOMAINS.iter().map(|d| d.to_string()).collect(),
            script: prompts::default_script(),
            refresh_interval_secs: 10,
            request_timeout_secs: 15,
            timezone: "UTC".to_string(),
            years: Vec::new(),
            output_dir: PathBuf::from("out"),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        // serde_yaml reads an empty document as unit, not as an empty map
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parsing config YAML")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text)
    }

    /// CLI path > `SURVEY_PULSE_CONFIG` > defaults, then the API base env override.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let mut cfg = match cli_path.map(Path::to_path_buf).or(env_path) {
            Some(p) => {
                if !p.exists() {
                    bail!(
                        "config not found at {}\n\
                         Use --config to point at a YAML file, or set {}.",
                        p.display(),
                        CONFIG_ENV
                    );
                }
                debug!("Loading config from {}", p.display());
                Self::from_file(&p)?
            }
            None => {
                debug!("No config file given, using defaults");
                Self::default()
            }
        };
        if let Ok(base) = std::env::var(API_BASE_ENV) {
            debug!("API base overridden by {}: {}", API_BASE_ENV, base);
            cfg.api_base = base;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.api_url()?;
        self.tz()?;
        if self.script.is_empty() {
            bail!("script must contain at least one prompt");
        }
        if self.script.iter().any(|p| p.trim().is_empty()) {
            bail!("script prompts must not be blank");
        }
        if self.allowed_domains.is_empty() {
            bail!("allowed_domains must not be empty");
        }
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be positive");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn api_url(&self) -> Result<Url> {
        let url = Url::parse(&self.api_base)
            .with_context(|| format!("invalid api_base {:?}", self.api_base))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("api_base must be http(s), got {}", url.scheme());
        }
        Ok(url)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("unknown timezone {:?}: {}", self.timezone, e))
    }

    pub fn intake_script(&self) -> Result<IntakeScript> {
        Ok(IntakeScript::new(self.script.clone())?)
    }

    pub fn identity_policy(&self) -> Result<IdentityPolicy> {
        IdentityPolicy::from_domains(self.allowed_domains.as_slice())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(AppConfig::from_yaml("").unwrap(), AppConfig::default());
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_yaml_overrides_selected_fields() {
        let cfg = AppConfig::from_yaml(
            r#"
api_base: "https://survey.example.org/api"
refresh_interval_secs: 30
timezone: "America/Lima"
years: ["2024", "2025"]
script:
  - "¿Qué tal?"
  - "¿Algo más?"
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(30));
        assert_eq!(cfg.intake_script().unwrap().len(), 2);
        assert_eq!(cfg.tz().unwrap(), chrono_tz::America::Lima);
        assert_eq!(cfg.allowed_domains.len(), 4);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let bad_tz = AppConfig { timezone: "Mars/Olympus".into(), ..Default::default() };
        assert!(bad_tz.validate().is_err());

        let no_script = AppConfig { script: vec![], ..Default::default() };
        assert!(no_script.validate().is_err());

        let zero = AppConfig { refresh_interval_secs: 0, ..Default::default() };
        assert!(zero.validate().is_err());

        let ftp = AppConfig { api_base: "ftp://host/api".into(), ..Default::default() };
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("config not found"));
    }
}
