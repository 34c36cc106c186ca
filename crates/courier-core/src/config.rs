//! Configuration - 起動時に一度だけ組み立てる不変の設定
//!
//! 優先順位（後勝ち）:
//! 1. environment preset（development / testing / production）
//! 2. TOML ファイル（`--config`）
//! 3. CLI の上書き（呼び出し側が直接フィールドを書き換える）
//!
//! 組み立て後は `validate()` を通し、`Arc` か値で Worker / Orchestrator に渡す。
//! 実行中に書き換えることはない。

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;
use crate::domain::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Testing,
    #[default]
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testing" | "test" => Ok(Environment::Testing),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::UnknownEnvironment(s.to_string())),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a loser does after the tie-break went against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoserPolicy {
    /// Move on to the next candidate in the same cycle.
    #[default]
    PickDifferent,
    /// Back off and contend for the same order again, if it is still
    /// available.
    RetrySame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub repo_url: String,
    /// Local clone used by this process.
    pub workdir: PathBuf,
    pub branch: String,
    #[serde(rename = "command_timeout_secs", with = "duration_secs")]
    pub command_timeout: Duration,
    /// Store operations retried this many times before the cycle is skipped.
    pub max_retries: u32,
    #[serde(rename = "backoff_base_secs", with = "duration_secs")]
    pub backoff_base: Duration,
    #[serde(rename = "backoff_max_secs", with = "duration_secs")]
    pub backoff_max: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            workdir: PathBuf::from("courier-repo"),
            branch: "main".to_string(),
            command_timeout: Duration::from_secs(60),
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl StoreSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_retries(self.max_retries)
            .with_base_delay(self.backoff_base)
            .with_max_delay(self.backoff_max)
    }
}

/// Worker profile: stop thresholds and polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub max_work_orders: u32,
    pub max_consecutive_failures: u32,
    #[serde(rename = "max_idle_hours", with = "duration_hours")]
    pub max_idle: Duration,
    #[serde(rename = "poll_interval_secs", with = "duration_secs")]
    pub poll_interval: Duration,
    /// Fraction of `poll_interval` added or removed at random.
    pub poll_jitter: f64,
    pub max_infrastructure_failures: u32,
    pub export_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_command: Option<String>,
    #[serde(rename = "executor_timeout_secs", with = "duration_secs")]
    pub executor_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_work_orders: 10,
            max_consecutive_failures: 15,
            max_idle: Duration::from_secs(2 * 3600),
            poll_interval: Duration::from_secs(30),
            poll_jitter: 0.2,
            max_infrastructure_failures: 5,
            export_dir: PathBuf::from("sessions"),
            executor_command: None,
            executor_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSettings {
    /// Wait between publishing an intent and reading everyone's intents.
    #[serde(rename = "contention_window_secs", with = "duration_secs")]
    pub contention_window: Duration,
    /// Intents older than this are ignored and later swept.
    #[serde(rename = "intent_ttl_secs", with = "duration_secs")]
    pub intent_ttl: Duration,
    pub max_claim_attempts: u32,
    pub loser_policy: LoserPolicy,
    pub shuffle_candidates: bool,
    /// Candidates tried per cycle before going idle.
    pub max_candidates_per_cycle: usize,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            contention_window: Duration::from_secs(2),
            intent_ttl: Duration::from_secs(10 * 60),
            max_claim_attempts: 3,
            loser_policy: LoserPolicy::PickDifferent,
            shuffle_candidates: true,
            max_candidates_per_cycle: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Age of `claimed_at` after which an active claim is revoked.
    #[serde(rename = "staleness_threshold_secs", with = "duration_secs")]
    pub staleness_threshold: Duration,
    /// Attempt ceiling; reaching it moves the order to `failed/`.
    pub max_attempts: u32,
    #[serde(rename = "retention_secs", with = "duration_secs")]
    pub retention: Duration,
    /// Replenish when `available` holds fewer orders than this.
    pub available_floor: usize,
    pub replenish_batch: usize,
    #[serde(rename = "cycle_interval_secs", with = "duration_secs")]
    pub cycle_interval: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(2 * 3600),
            max_attempts: 3,
            retention: Duration::from_secs(7 * 24 * 3600),
            available_floor: 10,
            replenish_batch: 50,
            cycle_interval: Duration::from_secs(5 * 60),
            seed_file: None,
        }
    }
}

/// Whole configuration, shared by the worker and the orchestrator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    pub environment: Environment,
    pub store: StoreSettings,
    pub worker: WorkerSettings,
    pub claim: ClaimSettings,
    pub orchestrator: OrchestratorSettings,
}

impl CourierConfig {
    /// Preset for an environment.
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            ..Self::default()
        };
        match environment {
            Environment::Development => {
                config.worker.max_work_orders = 3;
                config.worker.max_idle = Duration::from_secs(30 * 60);
                config.worker.poll_interval = Duration::from_secs(10);
                config.orchestrator.cycle_interval = Duration::from_secs(60);
            }
            Environment::Testing => {
                config.worker.max_work_orders = 5;
                config.worker.max_idle = Duration::from_secs(3600);
                config.worker.poll_interval = Duration::from_secs(15);
            }
            Environment::Production => {}
        }
        config
    }

    /// Preset, then the TOML file on top (when given).
    pub fn load(environment: Environment, path: Option<&Path>) -> Result<Self, ConfigError> {
        let preset = Self::for_environment(environment);
        let Some(path) = path else {
            return Ok(preset);
        };

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::layer_toml(preset, &text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay a TOML document on `base`; keys missing from the document
    /// keep their `base` value.
    pub fn layer_toml(base: Self, text: &str) -> Result<Self, toml::de::Error> {
        let overlay: toml::Value = toml::from_str(text)?;
        let mut merged = match toml::Value::try_from(&base) {
            Ok(value) => value,
            // the preset always serialises; fall back to the document alone
            Err(_) => return overlay.try_into(),
        };
        merge_toml(&mut merged, overlay);
        merged.try_into()
    }

    /// Reject configurations the worker or orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_repo_url(&self.store.repo_url)?;
        if self.store.branch.trim().is_empty() {
            return Err(ConfigError::invalid("store.branch", "must not be empty"));
        }
        positive("store.command_timeout_secs", self.store.command_timeout)?;

        let w = &self.worker;
        if w.max_work_orders == 0 {
            return Err(ConfigError::invalid("worker.max_work_orders", "must be at least 1"));
        }
        if w.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid(
                "worker.max_consecutive_failures",
                "must be at least 1",
            ));
        }
        if w.max_infrastructure_failures == 0 {
            return Err(ConfigError::invalid(
                "worker.max_infrastructure_failures",
                "must be at least 1",
            ));
        }
        positive("worker.max_idle_hours", w.max_idle)?;
        positive("worker.poll_interval_secs", w.poll_interval)?;
        positive("worker.executor_timeout_secs", w.executor_timeout)?;
        if !(0.0..=1.0).contains(&w.poll_jitter) {
            return Err(ConfigError::invalid("worker.poll_jitter", "must be within 0.0..=1.0"));
        }

        let c = &self.claim;
        if c.max_claim_attempts == 0 {
            return Err(ConfigError::invalid("claim.max_claim_attempts", "must be at least 1"));
        }
        if c.max_candidates_per_cycle == 0 {
            return Err(ConfigError::invalid(
                "claim.max_candidates_per_cycle",
                "must be at least 1",
            ));
        }
        positive("claim.intent_ttl_secs", c.intent_ttl)?;
        if c.intent_ttl <= c.contention_window {
            return Err(ConfigError::invalid(
                "claim.intent_ttl_secs",
                "must be longer than the contention window",
            ));
        }

        let o = &self.orchestrator;
        if o.max_attempts == 0 {
            return Err(ConfigError::invalid("orchestrator.max_attempts", "must be at least 1"));
        }
        positive("orchestrator.staleness_threshold_secs", o.staleness_threshold)?;
        positive("orchestrator.cycle_interval_secs", o.cycle_interval)?;
        Ok(())
    }
}

fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

fn validate_repo_url(url: &str) -> Result<(), ConfigError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ConfigError::invalid("store.repo_url", "is required"));
    }
    const SCHEMES: [&str; 5] = ["https://", "http://", "ssh://", "git@", "file://"];
    if SCHEMES.iter().any(|s| url.starts_with(s)) || Path::new(url).exists() {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "store.repo_url",
            format!("{url:?} is neither a git URL nor an existing path"),
        ))
    }
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_toml(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Serde support for Duration as fractional seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| serde::de::Error::custom(format!("invalid duration {secs}")))
    }
}

/// Serde support for Duration as fractional hours
mod duration_hours {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_secs_f64() / 3600.0).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hours = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(hours * 3600.0)
            .map_err(|_| serde::de::Error::custom(format!("invalid duration {hours}h")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn valid() -> CourierConfig {
        let mut config = CourierConfig::for_environment(Environment::Testing);
        config.store.repo_url = "https://example.test/orders.git".to_string();
        config
    }

    #[rstest]
    #[case("development", Environment::Development)]
    #[case("TEST", Environment::Testing)]
    #[case("prod", Environment::Production)]
    fn environment_names_parse(#[case] raw: &str, #[case] expected: Environment) {
        assert_eq!(raw.parse::<Environment>().unwrap(), expected);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        assert!(matches!(
            "staging".parse::<Environment>(),
            Err(ConfigError::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn presets_differ_by_environment() {
        let dev = CourierConfig::for_environment(Environment::Development);
        let prod = CourierConfig::for_environment(Environment::Production);
        assert_eq!(dev.worker.max_work_orders, 3);
        assert_eq!(prod.worker.max_work_orders, 10);
        assert_eq!(prod.worker.max_consecutive_failures, 15);
        assert_eq!(prod.worker.max_idle, Duration::from_secs(7200));
    }

    #[test]
    fn toml_overrides_only_what_it_names() {
        let base = CourierConfig::for_environment(Environment::Development);
        let text = r#"
            [worker]
            max_idle_hours = 0.25
            poll_interval_secs = 1.5

            [claim]
            loser_policy = "retry_same"

            [orchestrator]
            staleness_threshold_secs = 600
        "#;
        let merged = CourierConfig::layer_toml(base.clone(), text).unwrap();

        assert_eq!(merged.worker.max_idle, Duration::from_secs(900));
        assert_eq!(merged.worker.poll_interval, Duration::from_millis(1500));
        assert_eq!(merged.claim.loser_policy, LoserPolicy::RetrySame);
        assert_eq!(merged.orchestrator.staleness_threshold, Duration::from_secs(600));
        // untouched keys keep the preset
        assert_eq!(merged.worker.max_work_orders, base.worker.max_work_orders);
        assert_eq!(merged.store.branch, "main");
    }

    #[test]
    fn negative_durations_fail_to_parse() {
        let err = CourierConfig::layer_toml(valid(), "[worker]\npoll_interval_secs = -1.0\n");
        assert!(err.is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "[store]\nrepo_url = \"git@example.test:orders.git\"\n").unwrap();
        let config = CourierConfig::load(Environment::Production, Some(&path)).unwrap();
        assert_eq!(config.store.repo_url, "git@example.test:orders.git");
        config.validate().unwrap();

        let missing = CourierConfig::load(Environment::Production, Some(&dir.path().join("x.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[rstest]
    #[case::empty_url("", "store.repo_url")]
    #[case::bogus_url("not a url", "store.repo_url")]
    fn bad_repo_urls_are_rejected(#[case] url: &str, #[case] field: &str) {
        let mut config = valid();
        config.store.repo_url = url.to_string();
        match config.validate() {
            Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected invalid {field}, got {other:?}"),
        }
    }

    #[test]
    fn existing_local_path_is_a_valid_repo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid();
        config.store.repo_url = dir.path().display().to_string();
        config.validate().unwrap();
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let mut config = valid();
        config.worker.max_consecutive_failures = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.orchestrator.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.claim.intent_ttl = config.claim.contention_window;
        assert!(config.validate().is_err());
    }
}
