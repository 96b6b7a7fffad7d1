use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use stackd_networking::NodePortRange;
use tracing::info;

use crate::cleanup::ReconcilerConfig;
use crate::db::DbConfig;
use crate::stack::{AdmissionLimits, ServiceConfig};

/// Longest accepted value for any lifetime or retention setting (ten years).
const MAX_PERIOD_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayKind {
    Mock,
    Kubernetes(KubernetesSettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubernetesSettings {
    pub api_url: String,
    pub namespace: String,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub shutdown_timeout: Duration,
    /// `None` selects the in-memory store.
    pub database: Option<DbConfig>,
    pub run_migrations: bool,
    pub node_port_min: u16,
    pub node_port_max: u16,
    pub user_stack_limit: u32,
    pub stack_ttl: Duration,
    pub cleanup_interval: Duration,
    pub sweep_concurrency: usize,
    pub orphan_grace: Duration,
    pub terminal_retention: Duration,
    pub gateway_timeout: Duration,
    pub readiness_wait: Duration,
    pub gateway: GatewayKind,
}

/// Collects parse failures so they can be reported together.
struct EnvReader<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => default,
            Some(raw) => match raw.trim().parse() {
                Ok(value) => value,
                Err(e) => {
                    self.errors.push(format!("{key}={raw:?}: {e}"));
                    default
                }
            },
        }
    }

    fn flag(&mut self, key: &str, default: bool) -> bool {
        match self.optional(key).map(|v| v.trim().to_lowercase()) {
            None => default,
            Some(v) if v == "1" || v == "true" || v == "yes" => true,
            Some(v) if v == "0" || v == "false" || v == "no" => false,
            Some(v) => {
                self.errors.push(format!("{key}={v:?}: expected true or false"));
                default
            }
        }
    }

    fn secs(&mut self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.parse(key, default))
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut env = EnvReader {
            lookup,
            errors: Vec::new(),
        };

        let listen_addr = env.parse("STACKD_LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 8081)));
        let log_level = env.string("STACKD_LOG_LEVEL", "info");
        let shutdown_timeout = env.secs("STACKD_SHUTDOWN_TIMEOUT_SECS", 10);

        let database_url = env.optional("DATABASE_URL");
        let max_connections = env.parse("DB_MAX_CONNECTIONS", 10u32);
        let min_connections = env.parse("DB_MIN_CONNECTIONS", 1u32);
        let database = database_url.map(|database_url| DbConfig {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        });
        let run_migrations = env.flag("STACKD_RUN_MIGRATIONS", true);

        let node_port_min = env.parse("STACKD_NODE_PORT_MIN", 31001u16);
        let node_port_max = env.parse("STACKD_NODE_PORT_MAX", 32767u16);
        let user_stack_limit = env.parse("STACKD_USER_STACK_LIMIT", 3u32);
        let stack_ttl = env.secs("STACKD_STACK_TTL_SECS", 7200);
        let cleanup_interval = env.secs("STACKD_CLEANUP_INTERVAL_SECS", 60);
        let sweep_concurrency = env.parse("STACKD_SWEEP_CONCURRENCY", 4usize);
        let orphan_grace = env.secs("STACKD_ORPHAN_GRACE_SECS", 60);
        let terminal_retention = env.secs("STACKD_TERMINAL_RETENTION_SECS", 86400);
        let gateway_timeout = env.secs("STACKD_GATEWAY_TIMEOUT_SECS", 10);
        let readiness_wait = env.secs("STACKD_READINESS_WAIT_SECS", 0);

        let gateway = match env.string("STACKD_GATEWAY", "mock").to_lowercase().as_str() {
            "mock" => GatewayKind::Mock,
            "kubernetes" | "k8s" => GatewayKind::Kubernetes(KubernetesSettings {
                api_url: env.string("STACKD_K8S_API_URL", "https://kubernetes.default.svc"),
                namespace: env.string("STACKD_K8S_NAMESPACE", "stacks"),
                token_file: PathBuf::from(env.string(
                    "STACKD_K8S_TOKEN_FILE",
                    "/var/run/secrets/kubernetes.io/serviceaccount/token",
                )),
                ca_file: PathBuf::from(env.string(
                    "STACKD_K8S_CA_FILE",
                    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
                )),
            }),
            other => {
                env.errors
                    .push(format!("STACKD_GATEWAY={other:?}: expected mock or kubernetes"));
                GatewayKind::Mock
            }
        };

        let config = Self {
            listen_addr,
            log_level,
            shutdown_timeout,
            database,
            run_migrations,
            node_port_min,
            node_port_max,
            user_stack_limit,
            stack_ttl,
            cleanup_interval,
            sweep_concurrency,
            orphan_grace,
            terminal_retention,
            gateway_timeout,
            readiness_wait,
            gateway,
        };

        let mut errors = env.errors;
        errors.extend(config.validate());
        if !errors.is_empty() {
            bail!("invalid configuration: {}", errors.join("; "));
        }

        Ok(config)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.node_port_range() {
            errors.push(format!("node port range: {e}"));
        }
        if self.user_stack_limit == 0 {
            errors.push("STACKD_USER_STACK_LIMIT must be greater than zero".to_string());
        }
        if self.sweep_concurrency == 0 {
            errors.push("STACKD_SWEEP_CONCURRENCY must be greater than zero".to_string());
        }
        for (key, value) in [
            ("STACKD_STACK_TTL_SECS", self.stack_ttl),
            ("STACKD_CLEANUP_INTERVAL_SECS", self.cleanup_interval),
            ("STACKD_GATEWAY_TIMEOUT_SECS", self.gateway_timeout),
        ] {
            if value.is_zero() {
                errors.push(format!("{key} must be greater than zero"));
            }
        }
        for (key, value) in [
            ("STACKD_STACK_TTL_SECS", self.stack_ttl),
            ("STACKD_ORPHAN_GRACE_SECS", self.orphan_grace),
            ("STACKD_TERMINAL_RETENTION_SECS", self.terminal_retention),
        ] {
            if value.as_secs() > MAX_PERIOD_SECS {
                errors.push(format!("{key} must be at most {MAX_PERIOD_SECS}"));
            }
        }
        if let Some(db) = &self.database {
            if db.min_connections > db.max_connections {
                errors.push("DB_MIN_CONNECTIONS must not exceed DB_MAX_CONNECTIONS".to_string());
            }
        }

        errors
    }

    pub fn node_port_range(&self) -> Result<NodePortRange, stackd_networking::NetworkError> {
        NodePortRange::new(self.node_port_min, self.node_port_max)
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            user_stack_limit: self.user_stack_limit,
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            stack_ttl: chrono_secs(self.stack_ttl),
            readiness_wait: self.readiness_wait,
            ..ServiceConfig::default()
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            concurrency: self.sweep_concurrency,
            orphan_grace: chrono_secs(self.orphan_grace),
            terminal_retention: chrono_secs(self.terminal_retention),
        }
    }

    /// Log the effective configuration with credentials masked.
    pub fn log_summary(&self) {
        let database = self
            .database
            .as_ref()
            .map(|db| redact_url(&db.database_url))
            .unwrap_or_else(|| "memory".to_string());
        let gateway = match &self.gateway {
            GatewayKind::Mock => "mock".to_string(),
            GatewayKind::Kubernetes(k8s) => format!("kubernetes({}, ns={})", k8s.api_url, k8s.namespace),
        };

        info!(
            listen_addr = %self.listen_addr,
            database = %database,
            gateway = %gateway,
            node_port_min = self.node_port_min,
            node_port_max = self.node_port_max,
            user_stack_limit = self.user_stack_limit,
            stack_ttl_secs = self.stack_ttl.as_secs(),
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            sweep_concurrency = self.sweep_concurrency,
            readiness_wait_secs = self.readiness_wait.as_secs(),
            "Configuration loaded"
        );
    }
}

fn chrono_secs(d: Duration) -> chrono::Duration {
    // Bounded by MAX_PERIOD_SECS during validation.
    chrono::Duration::seconds(d.as_secs().min(MAX_PERIOD_SECS) as i64)
}

/// Mask a secret for logs, keeping two characters at each end of long values.
pub fn redact_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 8 {
        return "***".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}***{tail}")
}

/// Mask the password in a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let credentials = &rest[..at];
    match credentials.find(':') {
        Some(colon) => format!(
            "{}{}:****{}",
            &url[..scheme_end + 3],
            &credentials[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8081");
        assert!(config.database.is_none());
        assert_eq!(config.node_port_min, 31001);
        assert_eq!(config.node_port_max, 32767);
        assert_eq!(config.user_stack_limit, 3);
        assert_eq!(config.stack_ttl, Duration::from_secs(7200));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.readiness_wait, Duration::ZERO);
        assert_eq!(config.gateway, GatewayKind::Mock);
        assert!(config.run_migrations);
    }

    #[test]
    fn test_database_and_kubernetes() {
        let config = load(&[
            ("DATABASE_URL", "postgres://stackd:secret@db:5432/stackd"),
            ("DB_MAX_CONNECTIONS", "20"),
            ("STACKD_GATEWAY", "kubernetes"),
            ("STACKD_K8S_NAMESPACE", "ctf"),
        ])
        .unwrap();

        let db = config.database.unwrap();
        assert_eq!(db.max_connections, 20);
        let GatewayKind::Kubernetes(k8s) = config.gateway else {
            panic!("expected kubernetes gateway");
        };
        assert_eq!(k8s.namespace, "ctf");
        assert_eq!(k8s.api_url, "https://kubernetes.default.svc");
    }

    #[test]
    fn test_errors_are_aggregated() {
        let err = load(&[
            ("STACKD_NODE_PORT_MIN", "abc"),
            ("STACKD_USER_STACK_LIMIT", "0"),
            ("STACKD_GATEWAY", "nomad"),
        ])
        .unwrap_err()
        .to_string();

        assert!(err.contains("STACKD_NODE_PORT_MIN"), "{err}");
        assert!(err.contains("STACKD_USER_STACK_LIMIT"), "{err}");
        assert!(err.contains("STACKD_GATEWAY"), "{err}");
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let err = load(&[
            ("STACKD_NODE_PORT_MIN", "32000"),
            ("STACKD_NODE_PORT_MAX", "31000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("node port range"));
    }

    #[test]
    fn test_redact_secret() {
        assert_eq!(redact_secret("eyJhbGciOiJSUzI1NiJ9.payload.sig"), "ey***ig");
        assert_eq!(redact_secret("short"), "***");
        assert_eq!(redact_secret(""), "***");
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("postgres://stackd:hunter2@db:5432/stackd"),
            "postgres://stackd:****@db:5432/stackd"
        );
        assert_eq!(
            redact_url("postgres://db:5432/stackd"),
            "postgres://db:5432/stackd"
        );
        assert_eq!(redact_url("postgres://user@db/x"), "postgres://user@db/x");
    }
}
