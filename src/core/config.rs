use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{MediatorError, Result};

/// Mediator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// Instance name used in logs
    pub name: String,
    /// Namespaces whose actions this mediator executes; `*` claims everything
    pub namespaces: Vec<String>,
    /// Types loaded and registered before the first execution
    pub prerequisite_types: Vec<String>,
    /// Engine bootstrap file run once before the first execution
    pub bootstrap_file: Option<PathBuf>,
    /// Timeout for serial number and declaration round trips
    pub reply_timeout_ms: u64,
    /// Timeout for a breakpoint round trip
    pub breakpoint_timeout_ms: u64,
    /// Upper bound on concurrent request workers (None = one task per request)
    pub dispatch_workers: Option<usize>,
    /// Upper bound on concurrent relay workers
    pub relay_workers: Option<usize>,
    /// Upper bound on concurrent constraint jobs
    pub constraint_workers: Option<usize>,
    /// Answer declaration fetch requests from the local model
    pub serve_declarations: bool,
    pub log_level: String,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            name: format!("mediator_{}", cuid2::create_id()),
            namespaces: Vec::new(),
            prerequisite_types: Vec::new(),
            bootstrap_file: None,
            reply_timeout_ms: 10_000,
            breakpoint_timeout_ms: 300_000, // 5 minutes
            dispatch_workers: None,
            relay_workers: None,
            constraint_workers: Some(4),
            serve_declarations: false,
            log_level: "info".to_string(),
        }
    }
}

impl MediatorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MediatorError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MediatorError::configuration_field(
                "name must not be empty",
                "name",
            ));
        }
        if self.reply_timeout_ms == 0 {
            return Err(MediatorError::configuration_field(
                "reply_timeout_ms must be greater than 0",
                "reply_timeout_ms",
            ));
        }
        if self.breakpoint_timeout_ms == 0 {
            return Err(MediatorError::configuration_field(
                "breakpoint_timeout_ms must be greater than 0",
                "breakpoint_timeout_ms",
            ));
        }
        for (field, bound) in [
            ("dispatch_workers", self.dispatch_workers),
            ("relay_workers", self.relay_workers),
            ("constraint_workers", self.constraint_workers),
        ] {
            if bound == Some(0) {
                return Err(MediatorError::configuration_field(
                    format!("{} must be greater than 0", field),
                    field,
                ));
            }
        }
        for ns in &self.namespaces {
            let valid = ns == "*"
                || (!ns.is_empty()
                    && ns.split('.').all(|part| {
                        !part.is_empty()
                            && part
                                .chars()
                                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
                    }));
            if !valid {
                return Err(MediatorError::configuration_field(
                    format!("invalid namespace '{}'", ns),
                    "namespaces",
                ));
            }
        }
        Ok(())
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn breakpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.breakpoint_timeout_ms)
    }

    /// Whether this mediator claims actions in `namespace`
    pub fn owns_namespace(&self, name: &crate::model::names::ActionName) -> bool {
        self.namespaces.iter().any(|ns| name.in_namespace(ns))
    }
}

/// Builder for [`MediatorConfig`]
#[derive(Debug, Default)]
pub struct MediatorConfigBuilder {
    config: MediatorConfig,
}

impl MediatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespaces.push(namespace.into());
        self
    }

    pub fn with_prerequisite_type(mut self, name: impl Into<String>) -> Self {
        self.config.prerequisite_types.push(name.into());
        self
    }

    pub fn with_bootstrap_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.bootstrap_file = Some(path.into());
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_breakpoint_timeout(mut self, timeout: Duration) -> Self {
        self.config.breakpoint_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.config.dispatch_workers = Some(workers);
        self
    }

    pub fn with_relay_workers(mut self, workers: usize) -> Self {
        self.config.relay_workers = Some(workers);
        self
    }

    pub fn with_constraint_workers(mut self, workers: usize) -> Self {
        self.config.constraint_workers = Some(workers);
        self
    }

    pub fn serve_declarations(mut self, serve: bool) -> Self {
        self.config.serve_declarations = serve;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn build(self) -> Result<MediatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
