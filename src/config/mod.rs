//! Bus configuration.
//!
//! Loaded from YAML files and environment variables through the `config`
//! crate. Every field has a default, so an empty source set yields a usable
//! configuration for a local broker.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::broadcast::StaticAddressResolver;
use crate::broker::{PROXY_EXCHANGE_NAME, PUBSUB_ROUTING_KEY};
use crate::error::{BusError, Result};

/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "messagebus";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MESSAGEBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MESSAGEBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MESSAGEBUS_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub amqp: AmqpSettings,
    pub client: ClientSettings,
    /// Application id to source node (queue) table.
    pub apps: BTreeMap<String, String>,
}

/// Broker connection and routing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
    /// Exchange broadcasts are published to.
    pub exchange: String,
    /// Routing key for broadcasts.
    pub pubsub_routing_key: String,
    /// Unacked deliveries the broker may push to one consumer.
    pub prefetch: u16,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: PROXY_EXCHANGE_NAME.to_string(),
            pubsub_routing_key: PUBSUB_ROUTING_KEY.to_string(),
            prefetch: 16,
        }
    }
}

/// Identity of this client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub app_id: String,
    /// Queue to consume. Falls back to the `apps` entry for `app_id`.
    pub queue: Option<String>,
    /// Body size limit enforced by `ValidateBodySize`.
    pub max_body_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            app_id: "messagebus".to_string(),
            queue: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `messagebus.yaml` in the current directory (if it exists)
    /// 2. the file at `path` (if provided)
    /// 3. the file named by `MESSAGEBUS_CONFIG` (if set)
    /// 4. `MESSAGEBUS__*` environment variables, `__` separating levels
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BusError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.amqp.exchange.is_empty() {
            return Err(BusError::Config("amqp.exchange must not be empty".to_string()));
        }
        if self.amqp.prefetch == 0 {
            return Err(BusError::Config("amqp.prefetch must be at least 1".to_string()));
        }
        if self.client.app_id.is_empty() {
            return Err(BusError::Config("client.app_id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Queue this client consumes from, if one is known.
    pub fn consumer_queue(&self) -> Option<String> {
        self.client
            .queue
            .clone()
            .or_else(|| self.apps.get(&self.client.app_id).cloned())
    }

    /// Address table for the send path.
    pub fn address_resolver(&self) -> StaticAddressResolver {
        StaticAddressResolver::new(self.apps.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::AddressResolver;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.amqp.exchange, "exchange.proxy");
        assert_eq!(config.amqp.pubsub_routing_key, "routingkey.proxy.message.pubsub");
        assert_eq!(config.amqp.prefetch, 16);
        assert_eq!(config.client.max_body_bytes, 1024 * 1024);
        assert!(config.apps.is_empty());
        assert_eq!(config.consumer_queue(), None);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = yaml_file(
            r#"
amqp:
  url: amqp://rabbit:5672/%2f
  prefetch: 4
client:
  app_id: billing
  max_body_bytes: 2048
apps:
  billing: queue.billing
  orders: queue.orders
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.amqp.url, "amqp://rabbit:5672/%2f");
        assert_eq!(config.amqp.prefetch, 4);
        assert_eq!(config.amqp.exchange, PROXY_EXCHANGE_NAME);
        assert_eq!(config.client.app_id, "billing");
        assert_eq!(config.client.max_body_bytes, 2048);
        assert_eq!(config.consumer_queue().as_deref(), Some("queue.billing"));

        let resolver = config.address_resolver();
        assert_eq!(resolver.resolve("orders").as_deref(), Some("queue.orders"));
        assert_eq!(resolver.resolve("unknown"), None);
    }

    #[test]
    #[serial]
    fn test_explicit_queue_wins_over_apps_table() {
        let file = yaml_file(
            r#"
client:
  app_id: billing
  queue: queue.override
apps:
  billing: queue.billing
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.consumer_queue().as_deref(), Some("queue.override"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = yaml_file("amqp:\n  url: amqp://from-file:5672\n");
        std::env::set_var("MESSAGEBUS__AMQP__URL", "amqp://from-env:5672");

        let result = Config::load(file.path().to_str());
        std::env::remove_var("MESSAGEBUS__AMQP__URL");

        assert_eq!(result.unwrap().amqp.url, "amqp://from-env:5672");
    }

    #[test]
    #[serial]
    fn test_config_env_var_names_file() {
        let file = yaml_file("client:\n  app_id: from-env-file\n");
        std::env::set_var(CONFIG_ENV_VAR, file.path());

        let result = Config::load(None);
        std::env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(result.unwrap().client.app_id, "from-env-file");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::load(Some("/nonexistent/messagebus-test.yaml"));
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_zero_prefetch_is_rejected() {
        let file = yaml_file("amqp:\n  prefetch: 0\n");
        let result = Config::load(file.path().to_str());
        assert!(matches!(result, Err(BusError::Config(ref m)) if m.contains("prefetch")));
    }
}
