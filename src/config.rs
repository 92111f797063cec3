//! Global configuration parsing and validation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::models::stage::{FailurePolicy, ReadinessCheck, Stage};
use crate::{AppError, Result};

fn default_ipc_name() -> String {
    "stagehand".into()
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("stagehand")
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_grace_period_ms() -> u64 {
    10_000
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}

/// Global configuration parsed from `stagehand.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Named pipe / Unix socket identifier for the control channel.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Directory holding the supervisor PID file.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Behaviour when a stage does not become ready.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Interval between readiness polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time children get to exit after SIGTERM before they are killed.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Interval between child liveness polls once the sequence completed.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Glob patterns of stale files removed before the first launch.
    #[serde(default)]
    pub stale_paths: Vec<String>,
    /// Stages, sorted into startup order by [`GlobalConfig::validate`].
    #[serde(rename = "stage", default)]
    pub stages: Vec<Stage>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string, validate it and sort the
    /// stages into startup order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Readiness poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Termination grace period.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Child monitor poll interval.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Path of the supervisor PID file.
    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("stagehand.pid")
    }

    /// Path of the IPC auth token file.
    #[must_use]
    pub fn token_path(&self) -> PathBuf {
        self.state_dir.join("stagehand.token")
    }

    fn validate(&mut self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(AppError::Config("at least one [[stage]] is required".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(AppError::Config(
                "monitor_interval_ms must be greater than zero".into(),
            ));
        }
        for pattern in &self.stale_paths {
            glob::Pattern::new(pattern)?;
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            validate_stage(stage)?;
            if !names.insert(stage.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        self.sort_stages()?;
        self.validate_dependencies()
    }

    /// Sort by explicit `order`, falling back to file position, and assign
    /// the startup-order index.
    fn sort_stages(&mut self) -> Result<()> {
        let mut keyed: Vec<(u32, Stage)> = Vec::with_capacity(self.stages.len());
        for (position, stage) in self.stages.drain(..).enumerate() {
            let fallback = u32::try_from(position)
                .map_err(|_| AppError::Config("too many stages".into()))?;
            keyed.push((stage.order.unwrap_or(fallback), stage));
        }
        keyed.sort_by_key(|(key, _)| *key);

        if let Some(pair) = keyed.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(AppError::Config(format!(
                "stages '{}' and '{}' share startup order {}",
                pair[0].1.name, pair[1].1.name, pair[0].0
            )));
        }

        self.stages = keyed
            .into_iter()
            .enumerate()
            .map(|(index, (_, mut stage))| {
                stage.index = index;
                stage
            })
            .collect();
        Ok(())
    }

    fn validate_dependencies(&self) -> Result<()> {
        let positions: HashMap<&str, usize> = self
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.index))
            .collect();

        for stage in &self.stages {
            for dep in &stage.depends_on {
                match positions.get(dep.as_str()) {
                    None => {
                        return Err(AppError::Config(format!(
                            "stage '{}' depends on unknown stage '{dep}'",
                            stage.name
                        )));
                    }
                    Some(&index) if index >= stage.index => {
                        return Err(AppError::Config(format!(
                            "stage '{}' depends on '{dep}', which does not start before it",
                            stage.name
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

fn validate_stage(stage: &Stage) -> Result<()> {
    if stage.name.trim().is_empty() {
        return Err(AppError::Config("stage name must not be empty".into()));
    }
    if stage.command.trim().is_empty() {
        return Err(AppError::Config(format!(
            "stage '{}' has an empty command",
            stage.name
        )));
    }
    if stage.readiness_timeout_ms == 0 {
        return Err(AppError::Config(format!(
            "stage '{}' readiness_timeout_ms must be greater than zero",
            stage.name
        )));
    }
    if let ReadinessCheck::LogLine { pattern } = &stage.readiness {
        Regex::new(pattern).map_err(|err| {
            AppError::Config(format!(
                "stage '{}' has an invalid log_line pattern: {err}",
                stage.name
            ))
        })?;
    }
    if stage.pid_file.is_some() && !stage.detaches {
        return Err(AppError::Config(format!(
            "stage '{}' sets pid_file without detaches = true",
            stage.name
        )));
    }
    Ok(())
}
