use crate::ledger::{Amount, Category, RpcEndpoint};
use crate::policy::Policy;
use crate::poll::PollSettings;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub watchers: Vec<WatcherConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_host")]
    pub host: String,
    #[serde(default = "default_rpc_port")]
    pub port: u16,
    /// Loaded from env THA_RPC_USER when set.
    #[serde(default)]
    pub user: String,
    /// Loaded from env THA_RPC_PASSWORD when set.
    #[serde(default)]
    pub password: String,
    /// Upper bound on any single RPC call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// One monitored wallet: its policy, cadence and follow-up action.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub name: String,
    /// Wallet path segment; absent means the node's default endpoint.
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default = "default_category", deserialize_with = "strict_category")]
    pub category: Category,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    #[serde(default)]
    pub expected_amount: Option<Amount>,
    #[serde(default, deserialize_with = "strict_optional_category")]
    pub detail_category: Option<Category>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_true")]
    pub include_watch_only: bool,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Append-only file of acted-on txids, for dedup across restarts.
    #[serde(default)]
    pub seen_path: Option<PathBuf>,
    #[serde(default)]
    pub action: ActionConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionConfig {
    /// Send funds to `destination`: the qualifying amount, or `amount` when set.
    Forward {
        destination: String,
        #[serde(default)]
        amount: Option<Amount>,
    },
    /// Spawn `program` with the transaction in its environment.
    Invoke {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    #[default]
    Log,
}

// Ledger input maps unknown categories to `Other`; a typo in config must not.
fn strict_category<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Category, D::Error> {
    let name = String::deserialize(deserializer)?;
    name.parse().map_err(serde::de::Error::custom)
}

fn strict_optional_category<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Category>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|name| name.parse().map_err(serde::de::Error::custom))
        .transpose()
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}
fn default_rpc_port() -> u16 {
    18332
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_category() -> Category {
    Category::Receive
}
fn default_min_confirmations() -> u32 {
    1
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_page_size() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_max_consecutive_failures() -> u32 {
    5
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            port: default_rpc_port(),
            user: String::new(),
            password: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl WatcherConfig {
    pub fn new(name: &str, wallet: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            wallet: wallet.map(str::to_string),
            category: default_category(),
            min_confirmations: default_min_confirmations(),
            expected_amount: None,
            detail_category: None,
            poll_interval_secs: default_poll_interval_secs(),
            page_size: default_page_size(),
            include_watch_only: true,
            max_consecutive_failures: default_max_consecutive_failures(),
            seen_path: None,
            action: ActionConfig::Log,
        }
    }

    pub fn policy(&self) -> Policy {
        Policy {
            required_category: self.category,
            min_confirmations: self.min_confirmations,
            expected_amount: self.expected_amount,
            required_detail_category: self.detail_category,
        }
    }

    pub fn poll_settings(&self, query_timeout: Duration) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            page_size: self.page_size,
            include_watch_only: self.include_watch_only,
            max_consecutive_failures: self.max_consecutive_failures,
            query_timeout,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Config with env-only connection settings and one logging watcher on
    /// the wallet named by THA_WALLET (or the default endpoint).
    pub fn from_env() -> Self {
        let wallet = std::env::var("THA_WALLET").ok();
        let mut config = Config {
            rpc: RpcConfig::default(),
            logging: LoggingConfig::default(),
            watchers: vec![WatcherConfig::new(
                wallet.as_deref().unwrap_or("default"),
                wallet.as_deref(),
            )],
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        // Secrets never need to live in the config file.
        if let Ok(user) = std::env::var("THA_RPC_USER") {
            self.rpc.user = user;
        }
        if let Ok(password) = std::env::var("THA_RPC_PASSWORD") {
            self.rpc.password = password;
        }
        if let Ok(host) = std::env::var("THA_RPC_HOST") {
            self.rpc.host = host;
        }
        if let Some(port) = std::env::var("THA_RPC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.rpc.port = port;
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.rpc.user.is_empty() && !self.rpc.password.is_empty()
    }

    /// Fails with `MissingEnv` naming the first credential still unset.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.rpc.user.is_empty() {
            return Err(ConfigError::MissingEnv("THA_RPC_USER".to_string()));
        }
        if self.rpc.password.is_empty() {
            return Err(ConfigError::MissingEnv("THA_RPC_PASSWORD".to_string()));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.timeout_secs)
    }

    /// Endpoint for `wallet` with this config's host and credentials.
    pub fn endpoint(&self, wallet: Option<&str>) -> RpcEndpoint {
        RpcEndpoint {
            host: self.rpc.host.clone(),
            port: self.rpc.port,
            user: self.rpc.user.clone(),
            password: self.rpc.password.clone(),
            wallet: wallet.map(str::to_string),
            timeout: self.query_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.watchers.is_empty() {
            return invalid("no watchers configured".to_string());
        }
        if self.rpc.timeout_secs == 0 {
            return invalid("rpc.timeout_secs must be positive".to_string());
        }

        let mut names = HashSet::new();
        for w in &self.watchers {
            if !names.insert(w.name.as_str()) {
                return invalid(format!("duplicate watcher name {:?}", w.name));
            }
            if w.page_size == 0 {
                return invalid(format!("watcher {:?}: page_size must be positive", w.name));
            }
            if w.poll_interval_secs == 0 {
                return invalid(format!(
                    "watcher {:?}: poll_interval_secs must be positive",
                    w.name
                ));
            }
            if w.max_consecutive_failures == 0 {
                return invalid(format!(
                    "watcher {:?}: max_consecutive_failures must be positive",
                    w.name
                ));
            }
            if matches!(w.expected_amount, Some(a) if a < Amount::ZERO) {
                return invalid(format!(
                    "watcher {:?}: expected_amount must not be negative",
                    w.name
                ));
            }
            match &w.action {
                ActionConfig::Forward {
                    destination,
                    amount,
                } => {
                    if destination.trim().is_empty() {
                        return invalid(format!(
                            "watcher {:?}: forward destination is empty",
                            w.name
                        ));
                    }
                    if matches!(amount, Some(a) if !a.is_positive()) {
                        return invalid(format!(
                            "watcher {:?}: forward amount must be positive",
                            w.name
                        ));
                    }
                }
                ActionConfig::Invoke { program, .. } => {
                    if program.trim().is_empty() {
                        return invalid(format!("watcher {:?}: invoke program is empty", w.name));
                    }
                }
                ActionConfig::Log => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const PAIRING: &str = r#"
        [rpc]
        user = "nucash"
        password = "x"

        [logging]
        level = "debug"
        json = true

        [[watchers]]
        name = "reward"
        wallet = "RECEIVE"
        detail_category = "generate"
        action = { kind = "forward", destination = "1HXJUf7zwHZ5K2vhf9fMueMkXzjMUgDv6k" }

        [[watchers]]
        name = "payout"
        wallet = "SEND"
        expected_amount = 50
        poll_interval_secs = 30
        seen_path = "payout.seen"

        [watchers.action]
        kind = "invoke"
        program = "/usr/local/bin/payout"
        args = ["--batch", "500"]
    "#;

    #[test]
    fn test_parse_pairing() {
        let config = Config::parse(PAIRING).unwrap();
        config.validate().unwrap();

        assert_eq!(config.rpc.host, "127.0.0.1");
        assert_eq!(config.rpc.port, 18332);
        assert!(config.has_credentials());
        assert!(config.logging.json);

        let reward = &config.watchers[0];
        assert_eq!(reward.category, Category::Receive);
        assert_eq!(reward.min_confirmations, 1);
        assert_eq!(reward.detail_category, Some(Category::Generate));
        assert_eq!(reward.page_size, 10);
        assert!(matches!(reward.action, ActionConfig::Forward { amount: None, .. }));

        let payout = &config.watchers[1];
        assert_eq!(
            payout.expected_amount,
            Some(Amount::from_decimal(dec!(50)).unwrap())
        );
        assert_eq!(payout.seen_path.as_deref(), Some(Path::new("payout.seen")));
        assert_eq!(
            payout.action,
            ActionConfig::Invoke {
                program: "/usr/local/bin/payout".to_string(),
                args: vec!["--batch".to_string(), "500".to_string()],
            }
        );
    }

    #[test]
    fn test_policy_and_settings_from_watcher() {
        let config = Config::parse(PAIRING).unwrap();
        let payout = &config.watchers[1];
        let policy = payout.policy();
        assert_eq!(policy.required_category, Category::Receive);
        assert_eq!(policy.min_confirmations, 1);
        assert_eq!(policy.required_detail_category, None);

        let settings = payout.poll_settings(config.query_timeout());
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert_eq!(settings.query_timeout, Duration::from_secs(30));
        assert_eq!(settings.max_consecutive_failures, 5);
    }

    #[test]
    fn test_default_action_is_log() {
        let config = Config::parse("[[watchers]]\nname = \"listen\"\n").unwrap();
        assert_eq!(config.watchers[0].action, ActionConfig::Log);
        assert!(!config.has_credentials());
        assert!(matches!(
            config.require_credentials(),
            Err(ConfigError::MissingEnv(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_watchers() {
        let mut config = Config::parse(PAIRING).unwrap();
        config.watchers[1].name = "reward".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::parse(PAIRING).unwrap();
        config.watchers[0].page_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::parse(PAIRING).unwrap();
        config.watchers[0].action = ActionConfig::Forward {
            destination: " ".to_string(),
            amount: None,
        };
        assert!(config.validate().is_err());

        let mut config = Config::parse(PAIRING).unwrap();
        config.watchers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_uses_wallet() {
        let config = Config::parse(PAIRING).unwrap();
        let endpoint = config.endpoint(Some("RECEIVE"));
        assert_eq!(endpoint.url(), "http://127.0.0.1:18332/wallet/RECEIVE");
        assert_eq!(endpoint.user, "nucash");
    }

    #[test]
    fn test_validate_rejects_unknown_category() {
        let err = Config::parse("[[watchers]]\nname = \"r\"\ncategory = \"recieve\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("recieve"));

        let err = Config::parse("[[watchers]]\nname = \"r\"\ndetail_category = \"genrate\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let config = Config::parse(
            "[[watchers]]\nname = \"r\"\ncategory = \"other\"\ndetail_category = \"Generate\"\n",
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.watchers[0].category, Category::Other);
        assert_eq!(config.watchers[0].detail_category, Some(Category::Generate));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::parse("watchers = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
