use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::DEFAULT_MAX_RETRIES;
use crate::orchestration::admission::{
    AdmissionRegistry, RequestLimit, DEFAULT_PROVIDER, DEFAULT_WINDOW, UNLIMITED,
};
use crate::orchestration::command::{CommandService, DEFAULT_PROGRAM, DEFAULT_TIMEOUT_SECS};
use crate::orchestration::executor::{ExecutorSettings, DEFAULT_MODEL};
use crate::orchestration::guardrail::GuardrailConfig;
use crate::orchestration::qc::DEFAULT_PASS_SCORE;
use crate::{olog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub worker_model: String,
    pub qc_model: String,
    pub max_retries: u32,
    pub qc_pass_score: u8,
    pub fail_fast: bool,
    pub task_timeout_secs: Option<u64>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            worker_model: DEFAULT_MODEL.to_string(),
            qc_model: DEFAULT_MODEL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            qc_pass_score: DEFAULT_PASS_SCORE,
            fail_fast: true,
            task_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// `-1` disables the quota.
    pub requests_per_hour: i64,
    /// Models whose id starts with one of these use this provider's queue.
    pub model_prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    /// Quota for models that match no provider; `-1` disables it.
    pub default_requests_per_hour: i64,
    /// Length of the quota window.
    pub window_secs: u64,
    pub providers: BTreeMap<String, ProviderSection>,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            default_requests_per_hour: UNLIMITED,
            window_secs: DEFAULT_WINDOW.as_secs(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSection {
    pub program: String,
    /// Extra arguments placed before the prompt.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub pass_model: bool,
    pub working_dir: Option<String>,
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            pass_model: true,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorSection,
    pub guardrail: GuardrailConfig,
    pub admission: AdmissionSection,
    pub command: CommandSection,
}

impl Config {
    pub fn orchestra_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".orchestra"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::orchestra_dir()?.join("orchestra.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        olog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            olog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        olog_debug!(
            "Config loaded: worker_model={}, qc_model={}, providers={}",
            config.executor.worker_model,
            config.executor.qc_model,
            config.admission.providers.len()
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                olog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        olog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject settings that would misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        RequestLimit::from_config(DEFAULT_PROVIDER, self.admission.default_requests_per_hour)?;
        for (name, provider) in &self.admission.providers {
            RequestLimit::from_config(name, provider.requests_per_hour)?;
        }

        let guardrail = &self.guardrail;
        if guardrail.tool_call_limit == 0 {
            return Err(Error::Validation(
                "guardrail.tool_call_limit must be at least 1".to_string(),
            ));
        }
        if !(guardrail.loop_duplicate_ratio > 0.0 && guardrail.loop_duplicate_ratio <= 1.0) {
            return Err(Error::Validation(format!(
                "guardrail.loop_duplicate_ratio must be in (0, 1], got {}",
                guardrail.loop_duplicate_ratio
            )));
        }
        if guardrail.max_identical_tool_calls == 0 {
            return Err(Error::Validation(
                "guardrail.max_identical_tool_calls must be at least 1".to_string(),
            ));
        }
        if self.executor.qc_pass_score > 100 {
            return Err(Error::Validation(format!(
                "executor.qc_pass_score must be 0-100, got {}",
                self.executor.qc_pass_score
            )));
        }
        if self.admission.window_secs == 0 {
            return Err(Error::Validation(
                "admission.window_secs must be positive".to_string(),
            ));
        }
        if self.executor.task_timeout_secs == Some(0) {
            return Err(Error::Validation(
                "executor.task_timeout_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            worker_model: self.executor.worker_model.clone(),
            qc_model: self.executor.qc_model.clone(),
            qc_pass_score: self.executor.qc_pass_score,
            default_max_retries: self.executor.max_retries,
            guardrail: self.guardrail.clone(),
            task_timeout: self.executor.task_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Build the per-provider admission queues.
    pub fn admission_registry(&self) -> Result<AdmissionRegistry> {
        let default_limit =
            RequestLimit::from_config(DEFAULT_PROVIDER, self.admission.default_requests_per_hour)?;
        let mut registry = AdmissionRegistry::with_window(
            default_limit,
            Duration::from_secs(self.admission.window_secs),
        );
        for (name, provider) in &self.admission.providers {
            for prefix in &provider.model_prefixes {
                registry.add_route(prefix, name);
            }
        }
        for (name, provider) in &self.admission.providers {
            registry.register(name, RequestLimit::from_config(name, provider.requests_per_hour)?);
        }
        Ok(registry)
    }

    pub fn command_service(&self) -> Result<CommandService> {
        let mut service = CommandService::new(&self.command.program)?
            .with_prefix_args(self.command.args.clone())
            .with_timeout(Duration::from_secs(self.command.timeout_secs))
            .with_pass_model(self.command.pass_model);
        if let Some(dir) = &self.command.working_dir {
            service = service.with_cwd(expand_tilde(dir));
        }
        Ok(service)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
