//! Runtime configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::admission::Policy;
use crate::error::{ConfigError, PolicyError};
use crate::llm::{BreakerConfig, LlmConfig};
use crate::scheduler::RunOptions;

const DEFAULT_DB_PATH: &str = "./data/proposal-pilot.db";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_SCOPE: &str = "default";

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct PilotConfig {
    pub db_path: PathBuf,
    pub tenant_id: String,
    pub user_id: String,
    /// JSON file holding a partial policy. Defaults apply when unset.
    pub policy_path: Option<PathBuf>,
    pub run: RunOptions,
    /// Timeout for each store call.
    pub store_timeout: Duration,
    pub llm: LlmConfig,
    /// Cron expression. When set the binary keeps running.
    pub schedule: Option<String>,
    /// Directory for the daily rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl PilotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get("ANTHROPIC_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

        let defaults = RunOptions::default();
        let run = RunOptions {
            max_items: parse_or(&get, "PROPOSAL_PILOT_MAX_ITEMS", defaults.max_items)?,
            auto_process: bool_or(&get, "PROPOSAL_PILOT_AUTO_PROCESS", defaults.auto_process)?,
            notify_on_high_value: bool_or(
                &get,
                "PROPOSAL_PILOT_NOTIFY_HIGH_VALUE",
                defaults.notify_on_high_value,
            )?,
            retry_failed: bool_or(&get, "PROPOSAL_PILOT_RETRY_FAILED", defaults.retry_failed)?,
            max_dispatch_attempts: parse_or(
                &get,
                "PROPOSAL_PILOT_MAX_DISPATCH_ATTEMPTS",
                defaults.max_dispatch_attempts,
            )?,
            custom_instructions: get("PROPOSAL_PILOT_INSTRUCTIONS"),
        };
        if run.max_items == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROPOSAL_PILOT_MAX_ITEMS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let store_timeout = Duration::from_secs(parse_or(&get, "PROPOSAL_PILOT_STORE_TIMEOUT_SECS", 10u64)?);
        let llm_timeout = Duration::from_secs(parse_or(&get, "PROPOSAL_PILOT_LLM_TIMEOUT_SECS", 60u64)?);

        Ok(Self {
            db_path: get("PROPOSAL_PILOT_DB_PATH")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
                .into(),
            tenant_id: get("PROPOSAL_PILOT_TENANT").unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            user_id: get("PROPOSAL_PILOT_USER").unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            policy_path: get("PROPOSAL_PILOT_POLICY").map(PathBuf::from),
            run,
            store_timeout,
            llm: LlmConfig {
                api_key: SecretString::from(api_key),
                model: get("PROPOSAL_PILOT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                timeout: llm_timeout,
                breaker: BreakerConfig::default(),
            },
            schedule: get("PROPOSAL_PILOT_SCHEDULE"),
            log_dir: get("PROPOSAL_PILOT_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Load the run policy: the overrides file if configured, else defaults.
    pub fn load_policy(&self) -> Result<Policy, PolicyError> {
        match &self.policy_path {
            Some(path) => Policy::load(path),
            None => Ok(Policy::default()),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got {v:?}"),
            }),
        },
    }
}
