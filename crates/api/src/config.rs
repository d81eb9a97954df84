use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use turbo_core::error::CoreError;
use turbo_core::process::{JobClass, ProcessConfig};
use turbo_pipeline::collaborators::{CommandStage, Collaborators};
use turbo_pipeline::config::{EngineConfig, QueueConfig, DEFAULT_CHANNEL_CAPACITY};

/// Reasons the server refuses to start with the given environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid engine configuration: {0}")]
    Engine(#[from] CoreError),
}

/// External command lines for the pipeline collaborators.
///
/// Unset preparation and postprocess commands pass their input through;
/// the simulation command is required by the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCommands {
    pub zones: Option<String>,
    pub population: Option<String>,
    pub vehicles: Option<String>,
    pub simulation: Option<String>,
    pub postprocess: Option<String>,
}

impl StageCommands {
    /// Build the collaborator set: request validation, then one external
    /// command per configured stage.
    pub fn collaborators(&self) -> Result<Collaborators, ConfigError> {
        let simulation = command("simulation", &self.simulation)
            .ok_or(ConfigError::Missing("STAGE_SIMULATION_CMD"))?;
        let mut collaborators = Collaborators::with_runner(Arc::new(simulation));
        if let Some(stage) = command("zones", &self.zones) {
            collaborators.zones = Arc::new(stage);
        }
        if let Some(stage) = command("population", &self.population) {
            collaborators.population = Arc::new(stage);
        }
        if let Some(stage) = command("vehicles", &self.vehicles) {
            collaborators.vehicles = Arc::new(stage);
        }
        if let Some(stage) = command("postprocess", &self.postprocess) {
            collaborators.postprocess = Arc::new(stage);
        }
        Ok(collaborators)
    }
}

fn command(stage: &'static str, line: &Option<String>) -> Option<CommandStage> {
    line.as_deref()
        .and_then(|l| CommandStage::from_command_line(stage, l))
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// Timeout for non-streaming requests in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Drain budget for background tasks on shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// SSE heartbeat cadence in seconds (default: `30`).
    pub heartbeat_interval_secs: u64,
    /// Admission, queue and channel settings for the engine.
    pub engine: EngineConfig,
    pub stages: StageCommands,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                             | Default                    |
    /// |-------------------------------------|----------------------------|
    /// | `HOST`                              | `0.0.0.0`                  |
    /// | `PORT`                              | `3000`                     |
    /// | `CORS_ORIGINS`                      | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS`              | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`             | `30`                       |
    /// | `HEARTBEAT_INTERVAL_SECS`           | `30`                       |
    /// | `PROCESS_{ADMIN,READ,COMPUTE}_MAX`  | `2` / `8` / `1`            |
    /// | `PROCESS_{..}_TIMEOUT_MS`           | `30000` / `30000` / `3600000` |
    /// | `COMPUTE_QUEUE_ENABLED`             | `true`                     |
    /// | `COMPUTE_QUEUE_MAX_SIZE`            | `16`                       |
    /// | `COMPUTE_QUEUE_TIMEOUT_MS`          | `600000`                   |
    /// | `PROGRESS_CHANNEL_CAPACITY`         | `64`                       |
    /// | `STAGE_{ZONES,POPULATION,VEHICLES,SIMULATION,POSTPROCESS}_CMD` | unset |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let host = env.string("HOST", "0.0.0.0");
        let port = env.parse("PORT", 3000u16)?;
        let cors_origins = env
            .string("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let request_timeout_secs = env.parse("REQUEST_TIMEOUT_SECS", 30u64)?;
        let shutdown_timeout_secs = env.parse("SHUTDOWN_TIMEOUT_SECS", 30u64)?;
        let heartbeat_interval_secs = env.parse("HEARTBEAT_INTERVAL_SECS", 30u64)?;
        if heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "HEARTBEAT_INTERVAL_SECS".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let defaults = EngineConfig::default();
        let mut processes = BTreeMap::new();
        for class in JobClass::ALL {
            let fallback = defaults.process(class);
            let prefix = format!("PROCESS_{}", class.as_str().to_ascii_uppercase());
            let max = env.parse(&format!("{prefix}_MAX"), fallback.max)?;
            let timeout_ms = env.parse(
                &format!("{prefix}_TIMEOUT_MS"),
                fallback.timeout.as_millis() as u64,
            )?;
            processes.insert(class, ProcessConfig::new(max, Duration::from_millis(timeout_ms)));
        }

        let queue = QueueConfig {
            enabled: env.flag("COMPUTE_QUEUE_ENABLED", defaults.queue.enabled)?,
            max_size: env.parse("COMPUTE_QUEUE_MAX_SIZE", defaults.queue.max_size)?,
            timeout: Duration::from_millis(env.parse(
                "COMPUTE_QUEUE_TIMEOUT_MS",
                defaults.queue.timeout.as_millis() as u64,
            )?),
        };

        let engine = EngineConfig {
            processes,
            queue,
            channel_capacity: env.parse("PROGRESS_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?,
            poll_interval: defaults.poll_interval,
        };
        engine.validate()?;

        let stages = StageCommands {
            zones: env.optional("STAGE_ZONES_CMD"),
            population: env.optional("STAGE_POPULATION_CMD"),
            vehicles: env.optional("STAGE_VEHICLES_CMD"),
            simulation: env.optional("STAGE_SIMULATION_CMD"),
            postprocess: env.optional("STAGE_POSTPROCESS_CMD"),
        };

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            heartbeat_interval_secs,
            engine,
            stages,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: name.to_string(),
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var: name.to_string(),
                    value,
                    reason: "expected true or false".into(),
                }),
            },
        }
    }
}
