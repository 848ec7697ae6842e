//! Configuration types.
//!
//! Everything the pipeline needs is resolved once at startup into an
//! immutable [`RouterConfig`] and handed to the orchestrator by value.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Confidence below which a classification is flagged for manual review.
pub const DEFAULT_REVIEW_THRESHOLD: u8 = 70;

/// Deliveries the queue makes before dead-lettering an entry.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default model for extraction and classification.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Static recipient → AP destination table.
///
/// Keys are normalised to lowercase so lookups ignore address case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<String, String>,
}

impl RoutingTable {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let routes = entries
            .into_iter()
            .map(|(k, v)| (normalize_address(k.as_ref()), v.into()))
            .collect();
        Self { routes }
    }

    /// Parse the JSON object form, e.g. `{"invoices@acme.com": "ap@acme.com"}`.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let parsed: BTreeMap<String, String> =
            serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
                key: "INVOICE_ROUTER_EMAIL_ROUTING".into(),
                message: format!("expected a JSON object of recipient -> destination: {e}"),
            })?;
        Ok(Self::new(parsed))
    }

    /// Destination for a recipient, if one is configured.
    pub fn destination_for(&self, recipient: &str) -> Option<&str> {
        self.routes
            .get(&normalize_address(recipient))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Pipeline policy, passed to the orchestrator at construction time.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub routing: RoutingTable,
    /// Classification confidence below this requires manual review.
    pub review_threshold: u8,
    /// Deliveries the queue makes before dead-lettering.
    pub max_attempts: u32,
    /// Upper bound on each external call (extraction, classification).
    pub stage_timeout: Duration,
}

impl PipelineConfig {
    pub fn new(routing: RoutingTable) -> Self {
        Self {
            routing,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stage_timeout: Duration::from_secs(600),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator loops running in parallel.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// How long a received entry stays invisible to other workers.
    pub visibility_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(900), // 15 minutes
        }
    }
}

/// Outbound SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Sender address; when unset, each email is sent from its destination inbox.
    pub from_address: Option<String>,
}

impl SmtpConfig {
    /// Build from environment. Returns `None` if `SMTP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;
        let port = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM_ADDRESS")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
    pub model: String,
    pub api_key: SecretString,
    pub db_path: PathBuf,
    pub blob_root: PathBuf,
    pub smtp: Option<SmtpConfig>,
}

impl RouterConfig {
    /// Read the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let routing_raw = std::env::var("INVOICE_ROUTER_EMAIL_ROUTING").map_err(|_| {
            ConfigError::MissingRequired {
                key: "INVOICE_ROUTER_EMAIL_ROUTING".into(),
                hint: "Set a JSON object mapping recipient addresses to AP inboxes.".into(),
            }
        })?;
        let routing = RoutingTable::from_json(&routing_raw)?;

        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;

        let mut pipeline = PipelineConfig::new(routing);
        pipeline.review_threshold =
            env_parse("INVOICE_ROUTER_REVIEW_THRESHOLD", DEFAULT_REVIEW_THRESHOLD)?;
        pipeline.max_attempts = env_parse("INVOICE_ROUTER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        pipeline.stage_timeout =
            Duration::from_secs(env_parse("INVOICE_ROUTER_STAGE_TIMEOUT_SECS", 600u64)?);

        let defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            concurrency: env_parse("INVOICE_ROUTER_CONCURRENCY", defaults.concurrency)?,
            poll_interval: Duration::from_secs(env_parse(
                "INVOICE_ROUTER_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            visibility_timeout: Duration::from_secs(env_parse(
                "INVOICE_ROUTER_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
            )?),
        };

        let config = Self {
            pipeline,
            worker,
            model: std::env::var("INVOICE_ROUTER_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key: SecretString::from(api_key),
            db_path: db_path_from_env(),
            blob_root: blob_root_from_env(),
            smtp: SmtpConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.routing.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "INVOICE_ROUTER_EMAIL_ROUTING".into(),
                message: "at least one recipient route is required".into(),
            });
        }
        if self.pipeline.review_threshold > 100 {
            return Err(ConfigError::InvalidValue {
                key: "INVOICE_ROUTER_REVIEW_THRESHOLD".into(),
                message: format!("{} is not within 0-100", self.pipeline.review_threshold),
            });
        }
        if self.pipeline.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INVOICE_ROUTER_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INVOICE_ROUTER_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Database location (`INVOICE_ROUTER_DB_PATH`).
///
/// Administrative commands only need storage, not the full configuration.
pub fn db_path_from_env() -> PathBuf {
    std::env::var("INVOICE_ROUTER_DB_PATH")
        .unwrap_or_else(|_| "./data/invoice-router.db".to_string())
        .into()
}

/// Raw message directory (`INVOICE_ROUTER_BLOB_ROOT`).
pub fn blob_root_from_env() -> PathBuf {
    std::env::var("INVOICE_ROUTER_BLOB_ROOT")
        .unwrap_or_else(|_| "./data/inbound".to_string())
        .into()
}

/// Parse an optional env var, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(routing: RoutingTable) -> RouterConfig {
        RouterConfig {
            pipeline: PipelineConfig::new(routing),
            worker: WorkerConfig::default(),
            model: DEFAULT_MODEL.into(),
            api_key: SecretString::from("test-key"),
            db_path: ":memory:".into(),
            blob_root: ".".into(),
            smtp: None,
        }
    }

    #[test]
    fn routing_table_parses_json_object() {
        let table =
            RoutingTable::from_json(r#"{"invoices@acme.com": "ap-inbox@acme.com"}"#).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.destination_for("invoices@acme.com"),
            Some("ap-inbox@acme.com")
        );
    }

    #[test]
    fn routing_table_lookup_ignores_case_and_whitespace() {
        let table = RoutingTable::new([("Invoices@ACME.com", "ap@acme.com")]);
        assert_eq!(table.destination_for(" invoices@acme.com "), Some("ap@acme.com"));
    }

    #[test]
    fn routing_table_has_no_default() {
        let table = RoutingTable::new([("invoices@acme.com", "ap@acme.com")]);
        assert_eq!(table.destination_for("random@unmapped.com"), None);
    }

    #[test]
    fn routing_table_rejects_non_object_json() {
        let err = RoutingTable::from_json(r#"["a", "b"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn pipeline_defaults_match_policy() {
        let config = PipelineConfig::new(RoutingTable::default());
        assert_eq!(config.review_threshold, 70);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn validate_rejects_empty_routing() {
        let config = config_with(RoutingTable::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = config_with(RoutingTable::new([("a@x.com", "b@x.com")]));
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = config_with(RoutingTable::new([("a@x.com", "b@x.com")]));
        assert!(config.validate().is_ok());
    }
}
