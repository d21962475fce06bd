use std::path::PathBuf;
use std::time::Duration;

use axum::http::HeaderValue;
use evidence_sandbox::engine::{ExecutionLimits, DEFAULT_TIMEOUT_MS};
use evidence_store::sealed::SealingKey;
use evidence_store::SecretValue;

/// Startup configuration failures. The server refuses to start on any of
/// these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is invalid: {message}")]
    Invalid { var: &'static str, message: String },

    #[error("{var} must be set when {because} is set")]
    Missing {
        var: &'static str,
        because: &'static str,
    },
}

/// Where automation scripts are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStoreConfig {
    /// A directory on local disk.
    Local { dir: PathBuf },
    /// An S3 bucket, optionally under a key prefix.
    S3 { bucket: String, prefix: String },
}

/// How single-invocation runs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionBackend {
    /// On an engine thread of the API process.
    InProcess,
    /// In a fresh `evidence-runner` process per run.
    ChildProcess,
}

impl ExecutionBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim() {
            "in-process" => Ok(Self::InProcess),
            "child-process" => Ok(Self::ChildProcess),
            other => Err(ConfigError::Invalid {
                var: "EXECUTION_MODE",
                message: format!("expected `in-process` or `child-process`, got `{other}`"),
            }),
        }
    }
}

/// Sealed secret bundles shared with the runners.
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    pub dir: PathBuf,
    /// Base64 sealing key as configured.
    pub key: SecretValue,
    pub sealing_key: SealingKey,
}

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight runs (default: `30`).
    pub shutdown_timeout_secs: u64,
    pub script_store: ScriptStoreConfig,
    /// Absent when no secret bundles are configured; every `getSecret`
    /// then resolves to `null`.
    pub secrets: Option<SecretsConfig>,
    pub execution_backend: ExecutionBackend,
    /// Path of the `evidence-runner` binary.
    pub runner_path: PathBuf,
    /// Root directory of interactive sandboxes. Interactive runs are
    /// rejected as `SandboxUnavailable` when unset.
    pub sandbox_root: Option<PathBuf>,
    pub limits: ExecutionLimits,
    /// Attempts per run for retryable failures (default: `3`).
    pub dispatch_max_attempts: u32,
    /// How long terminal run records are kept (default: 7 days).
    pub run_retention_secs: u64,
    /// Enables the PostgreSQL run store when set.
    pub database_url: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                        |
    /// |--------------------------|--------------------------------|
    /// | `HOST`                   | `0.0.0.0`                      |
    /// | `PORT`                   | `3000`                         |
    /// | `CORS_ORIGINS`           | `http://localhost:5173`        |
    /// | `REQUEST_TIMEOUT_SECS`   | `30`                           |
    /// | `SHUTDOWN_TIMEOUT_SECS`  | `30`                           |
    /// | `SCRIPT_STORE_DIR`       | `./data/scripts`               |
    /// | `SCRIPT_STORE_S3_BUCKET` | unset (local store)            |
    /// | `SCRIPT_STORE_S3_PREFIX` | empty                          |
    /// | `SECRETS_DIR`            | unset                          |
    /// | `EVIDENCE_SECRETS_KEY`   | unset (required with dir)      |
    /// | `EXECUTION_MODE`         | `child-process`                |
    /// | `RUNNER_PATH`            | `evidence-runner` next to exe  |
    /// | `SANDBOX_ROOT`           | unset                          |
    /// | `AUTOMATION_TIMEOUT_MS`  | `3000`                         |
    /// | `DISPATCH_MAX_ATTEMPTS`  | `3`                            |
    /// | `RUN_RETENTION_SECS`     | `604800`                       |
    /// | `DATABASE_URL`           | unset (in-memory run store)    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_or(&var, "PORT", 3000u16)?;

        let cors_origins: Vec<String> = var("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for origin in &cors_origins {
            if origin.parse::<HeaderValue>().is_err() {
                return Err(ConfigError::Invalid {
                    var: "CORS_ORIGINS",
                    message: format!("invalid origin `{origin}`"),
                });
            }
        }

        let request_timeout_secs = parse_or(&var, "REQUEST_TIMEOUT_SECS", 30u64)?;
        let shutdown_timeout_secs = parse_or(&var, "SHUTDOWN_TIMEOUT_SECS", 30u64)?;

        let script_store = match var("SCRIPT_STORE_S3_BUCKET") {
            Some(bucket) => ScriptStoreConfig::S3 {
                bucket,
                prefix: var("SCRIPT_STORE_S3_PREFIX").unwrap_or_default(),
            },
            None => ScriptStoreConfig::Local {
                dir: var("SCRIPT_STORE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/scripts")),
            },
        };

        let secrets = match (var("SECRETS_DIR"), var("EVIDENCE_SECRETS_KEY")) {
            (Some(dir), Some(key)) => {
                let sealing_key =
                    SealingKey::from_base64(&key).map_err(|e| ConfigError::Invalid {
                        var: "EVIDENCE_SECRETS_KEY",
                        message: e.to_string(),
                    })?;
                Some(SecretsConfig {
                    dir: PathBuf::from(dir),
                    key: SecretValue::new(key),
                    sealing_key,
                })
            }
            (Some(_), None) => {
                return Err(ConfigError::Missing {
                    var: "EVIDENCE_SECRETS_KEY",
                    because: "SECRETS_DIR",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing {
                    var: "SECRETS_DIR",
                    because: "EVIDENCE_SECRETS_KEY",
                })
            }
            (None, None) => None,
        };

        let execution_backend = match var("EXECUTION_MODE") {
            Some(mode) => ExecutionBackend::parse(&mode)?,
            None => ExecutionBackend::ChildProcess,
        };

        let runner_path = var("RUNNER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_runner_path);

        let timeout_ms = parse_or(&var, "AUTOMATION_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "AUTOMATION_TIMEOUT_MS",
                message: "must be greater than zero".into(),
            });
        }
        let limits = ExecutionLimits::default().with_timeout(Duration::from_millis(timeout_ms));

        let dispatch_max_attempts = parse_or(&var, "DISPATCH_MAX_ATTEMPTS", 3u32)?;
        if dispatch_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "DISPATCH_MAX_ATTEMPTS",
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            script_store,
            secrets,
            execution_backend,
            runner_path,
            sandbox_root: var("SANDBOX_ROOT").map(PathBuf::from),
            limits,
            dispatch_max_attempts,
            run_retention_secs: parse_or(&var, "RUN_RETENTION_SECS", 7 * 24 * 3600u64)?,
            database_url: var("DATABASE_URL"),
        })
    }
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: name,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn default_runner_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("evidence-runner")))
        .unwrap_or_else(|| PathBuf::from("evidence-runner"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    // 32 zero bytes.
    const KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).expect("config");
        assert_eq!(config.port, 3000);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(
            config.script_store,
            ScriptStoreConfig::Local {
                dir: PathBuf::from("./data/scripts")
            }
        );
        assert!(config.secrets.is_none());
        assert_eq!(config.execution_backend, ExecutionBackend::ChildProcess);
        assert_eq!(config.limits.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.dispatch_max_attempts, 3);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("PORT", "8080"),
            ("CORS_ORIGINS", "https://a.example, https://b.example"),
            ("SCRIPT_STORE_S3_BUCKET", "scripts"),
            ("SCRIPT_STORE_S3_PREFIX", "automations"),
            ("SECRETS_DIR", "/var/secrets"),
            ("EVIDENCE_SECRETS_KEY", KEY),
            ("EXECUTION_MODE", "in-process"),
            ("AUTOMATION_TIMEOUT_MS", "1500"),
            ("SANDBOX_ROOT", "/var/sandboxes"),
        ])
        .expect("config");

        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_origins.len(), 2);
        assert_eq!(
            config.script_store,
            ScriptStoreConfig::S3 {
                bucket: "scripts".into(),
                prefix: "automations".into()
            }
        );
        let secrets = config.secrets.expect("secrets");
        assert_eq!(secrets.dir, PathBuf::from("/var/secrets"));
        assert_eq!(config.execution_backend, ExecutionBackend::InProcess);
        assert_eq!(config.limits.timeout_ms, 1500);
        assert_eq!(config.sandbox_root, Some(PathBuf::from("/var/sandboxes")));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert_matches!(
            config(&[("PORT", "not-a-port")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        );
        assert_matches!(
            config(&[("CORS_ORIGINS", "https://ok.example,bad\norigin")]),
            Err(ConfigError::Invalid { var: "CORS_ORIGINS", .. })
        );
        assert_matches!(
            config(&[("EXECUTION_MODE", "threads")]),
            Err(ConfigError::Invalid { var: "EXECUTION_MODE", .. })
        );
        assert_matches!(
            config(&[("AUTOMATION_TIMEOUT_MS", "0")]),
            Err(ConfigError::Invalid { var: "AUTOMATION_TIMEOUT_MS", .. })
        );
        assert_matches!(
            config(&[("SECRETS_DIR", "/s"), ("EVIDENCE_SECRETS_KEY", "short")]),
            Err(ConfigError::Invalid { var: "EVIDENCE_SECRETS_KEY", .. })
        );
    }

    #[test]
    fn secrets_dir_and_key_come_together() {
        assert_matches!(
            config(&[("SECRETS_DIR", "/s")]),
            Err(ConfigError::Missing { var: "EVIDENCE_SECRETS_KEY", .. })
        );
        assert_matches!(
            config(&[("EVIDENCE_SECRETS_KEY", KEY)]),
            Err(ConfigError::Missing { var: "SECRETS_DIR", .. })
        );
    }
}
