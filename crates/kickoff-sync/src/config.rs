use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kickoff_adapters::{InjuryAdapterConfig, QuotaPolicy};
use kickoff_storage::HttpClientConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_VAR: &str = "KICKOFF_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "kickoff.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub hour_utc: u32,
    /// Once the hour has passed for today, wait for the next Monday instead of tomorrow.
    pub weekly: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour_utc: 6,
            weekly: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub competitions: Vec<String>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjurySection {
    #[serde(flatten)]
    pub adapter: InjuryAdapterConfig,
    pub schedule: ScheduleConfig,
    pub quota: QuotaPolicy,
}

impl Default for InjurySection {
    fn default() -> Self {
        Self {
            adapter: InjuryAdapterConfig::default(),
            schedule: ScheduleConfig {
                hour_utc: 8,
                ..Default::default()
            },
            quota: QuotaPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub data_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_concurrency: usize,
    pub elo: ProviderConfig,
    pub xg: ProviderConfig,
    pub odds: ProviderConfig,
    pub injuries: InjurySection,
}

fn top_five() -> Vec<String> {
    ["PL", "PD", "BL1", "SA", "FL1"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut odds_competitions = top_five();
        odds_competitions.extend(["ELC", "DED", "PPL"].map(String::from));
        Self {
            data_path: PathBuf::from("./data/kickoff.json"),
            user_agent: "kickoff-sync/0.1".to_string(),
            http_timeout_secs: 30,
            http_concurrency: 4,
            elo: ProviderConfig {
                base_url: "http://api.clubelo.com".to_string(),
                competitions: Vec::new(),
                schedule: ScheduleConfig::default(),
            },
            xg: ProviderConfig {
                base_url: "https://understat.com".to_string(),
                competitions: top_five(),
                schedule: ScheduleConfig {
                    hour_utc: 4,
                    weekly: true,
                    ..Default::default()
                },
            },
            odds: ProviderConfig {
                base_url: "https://www.football-data.co.uk".to_string(),
                competitions: odds_competitions,
                schedule: ScheduleConfig {
                    hour_utc: 5,
                    weekly: true,
                    ..Default::default()
                },
            },
            injuries: InjurySection::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parsing sync configuration")
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load(&path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("KICKOFF_DATA_PATH") {
            self.data_path = PathBuf::from(path);
        }
        if let Some(key) = lookup("API_FOOTBALL_KEY") {
            self.injuries.adapter.api_key = key;
        }
        if let Some(secs) = lookup("KICKOFF_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = secs;
        }
        if let Some(agent) = lookup("KICKOFF_USER_AGENT") {
            self.user_agent = agent;
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.http_concurrency,
        }
    }
}
