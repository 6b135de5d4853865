use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Deserializer, Serialize};

use crate::affinity::WORST_SCORE;
use crate::error::{Result, ScheduleError};
use crate::family::FamilyTag;
use crate::policy::{DEFAULT_DEGRADED_PENALTY, DEFAULT_SUPER_POD_PENALTY};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8899";

/// Scheduler configuration, read from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Score added on nodes with a degraded network
    #[serde(deserialize_with = "deserialize_u32_from_string")]
    pub degraded_penalty: u32,
    /// Score added on nodes outside the super-pod a job already uses
    #[serde(deserialize_with = "deserialize_u32_from_string")]
    pub super_pod_penalty: u32,
    /// Families the scheduler accepts; jobs and nodes of others are rejected
    pub enabled_families: Vec<FamilyTag>,
    pub listen_addr: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            degraded_penalty: DEFAULT_DEGRADED_PENALTY,
            super_pod_penalty: DEFAULT_SUPER_POD_PENALTY,
            enabled_families: FamilyTag::ALL.to_vec(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// # Errors
    ///
    /// - [`ScheduleError::Config`] if the YAML does not parse or holds
    ///   unusable values
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).change_context(ScheduleError::Config {
            message: "invalid scheduler configuration".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// - [`ScheduleError::Config`] if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .change_context_lazy(|| ScheduleError::Config {
                message: format!("cannot read {}", path.display()),
            })?;
        Self::from_yaml_str(&raw).attach_printable_lazy(|| format!("file: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Report::new(ScheduleError::Config { message }));
        if self.enabled_families.is_empty() {
            return invalid("enabledFamilies must name at least one family".to_string());
        }
        for (name, penalty) in [
            ("degradedPenalty", self.degraded_penalty),
            ("superPodPenalty", self.super_pod_penalty),
        ] {
            if penalty >= WORST_SCORE {
                return invalid(format!("{name} {penalty} must stay below {WORST_SCORE}"));
            }
        }
        Ok(())
    }
}

/// Accepts both `16` and `"16"`, as the operator renders every value as a string.
fn deserialize_u32_from_string<'de, D>(deserializer: D) -> core::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(u32),
    }

    match StringOrInt::deserialize(deserializer)? {
        StringOrInt::String(s) => s.trim().parse::<u32>().map_err(|e| {
            serde::de::Error::custom(format!("Failed to parse integer from string '{s}': {e}"))
        }),
        StringOrInt::Int(n) => Ok(n),
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NPU_SCHEDULER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the scheduler configuration, e.g. /etc/npu-scheduler/config.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "NPU_SCHEDULER_LISTEN_ADDR",
        help = "HTTP extender listen address, overrides listenAddr from the configuration"
    )]
    pub listen_addr: Option<String>,

    #[arg(
        long,
        env = "NPU_SCHEDULER_LOG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_path: Option<PathBuf>,
}

impl DaemonArgs {
    /// The configuration file merged with command-line overrides.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::Config`] if the configuration file is unusable
    pub fn resolve_config(&self) -> Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => SchedulerConfig::load(path)?,
            None => SchedulerConfig::default(),
        };
        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr.clone();
        }
        Ok(config)
    }
}
