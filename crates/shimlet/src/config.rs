//! Bridge configuration: builder methods plus environment overrides.

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;
use crate::supervisor::{CommandSpawner, WorkerSpawner};

/// Worker executable path.
pub const ENV_WORKER: &str = "SHIM_WORKER";
/// Any non-empty value logs every received line before it is parsed.
pub const ENV_DEBUG: &str = "DEBUG_SHIM";
/// `sequential` or `correlated`.
pub const ENV_CORRELATION: &str = "SHIM_CORRELATION";
/// Maximum accepted response line length in bytes.
pub const ENV_MAX_LINE_BYTES: &str = "SHIM_MAX_LINE_BYTES";

pub const DEFAULT_WORKER_PATH: &str = "./main";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// How response lines are matched to outstanding invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorrelationMode {
    /// No ids on the wire; one invocation at a time, matched by arrival order.
    Sequential,
    /// Requests carry an id that the worker echoes back.
    #[default]
    Correlated,
}

impl CorrelationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Correlated => "correlated",
        }
    }
}

impl FromStr for CorrelationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "correlated" => Ok(Self::Correlated),
            other => Err(format!(
                "expected 'sequential' or 'correlated', got '{other}'"
            )),
        }
    }
}

/// What happens to the host process once the worker is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalPolicy {
    /// Exit the host process with this status.
    Exit(i32),
    /// Keep running; every later invocation fails with `Unavailable`.
    Continue,
}

impl Default for FatalPolicy {
    fn default() -> Self {
        Self::Exit(1)
    }
}

/// Program, arguments and environment for the worker subprocess.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }
}

#[derive(Clone)]
pub struct BridgeConfig {
    pub worker: WorkerCommand,
    pub correlation: CorrelationMode,
    pub max_line_bytes: usize,
    pub debug_lines: bool,
    pub fatal_policy: FatalPolicy,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_PATH)
    }
}

impl BridgeConfig {
    pub fn new(worker: impl Into<PathBuf>) -> Self {
        Self {
            worker: WorkerCommand::new(worker),
            correlation: CorrelationMode::default(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            debug_lines: false,
            fatal_policy: FatalPolicy::default(),
            spawner: Arc::new(CommandSpawner),
        }
    }

    /// Defaults overridden by `SHIM_*` / `DEBUG_SHIM` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_WORKER).filter(|p| !p.is_empty()) {
            config.worker.program = PathBuf::from(path);
        }

        config.debug_lines = lookup(ENV_DEBUG).is_some_and(|v| !v.is_empty());

        if let Some(value) = lookup(ENV_CORRELATION) {
            config.correlation =
                value
                    .parse()
                    .map_err(|reason| ConfigError::InvalidValue {
                        var: ENV_CORRELATION,
                        value: value.clone(),
                        reason,
                    })?;
        }

        if let Some(value) = lookup(ENV_MAX_LINE_BYTES) {
            config.max_line_bytes = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::InvalidValue {
                        var: ENV_MAX_LINE_BYTES,
                        value,
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Err(e) => {
                    return Err(ConfigError::InvalidValue {
                        var: ENV_MAX_LINE_BYTES,
                        value,
                        reason: e.to_string(),
                    });
                }
            };
        }

        Ok(config)
    }

    pub fn with_worker(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker.program = program.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.worker.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.worker.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worker.current_dir = Some(dir.into());
        self
    }

    pub fn with_correlation(mut self, mode: CorrelationMode) -> Self {
        self.correlation = mode;
        self
    }

    pub fn with_max_line_bytes(mut self, n: usize) -> Self {
        self.max_line_bytes = n;
        self
    }

    pub fn with_debug_lines(mut self, enabled: bool) -> Self {
        self.debug_lines = enabled;
        self
    }

    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}
