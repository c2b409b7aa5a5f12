//! Configuration management for Floodgate.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{Algorithm, BucketLimits, Policy, WindowLimits};

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limit policies
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Shared store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Upper bound on one store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prepended to every policy prefix, for sharing one Redis between deployments
    #[serde(default)]
    pub key_namespace: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
            key_namespace: None,
        }
    }
}

impl StoreConfig {
    /// Store round-trip timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// The limit policies guarding the service's endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Sign-in attempts
    #[serde(default = "default_signin")]
    pub signin: Policy,

    /// Sign-up attempts
    #[serde(default = "default_signup")]
    pub signup: Policy,

    /// General API writes
    #[serde(default = "default_api")]
    pub api: Policy,

    /// Chat messages on persistent connections
    #[serde(default = "default_chat")]
    pub chat: Policy,

    /// Profile picture uploads
    #[serde(default = "default_upload")]
    pub upload: Policy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            signin: default_signin(),
            signup: default_signup(),
            api: default_api(),
            chat: default_chat(),
            upload: default_upload(),
        }
    }
}

const AUTH_MESSAGE: &str = "Too many attempts. Please try again later.";

fn default_signin() -> Policy {
    Policy::new(
        "fixed_limit",
        Algorithm::FixedWindow(WindowLimits {
            limit: 5,
            window_ms: 60_000,
        }),
    )
    .with_message(AUTH_MESSAGE)
}

fn default_signup() -> Policy {
    Policy::new(
        "fixed_limit_signup",
        Algorithm::FixedWindow(WindowLimits {
            limit: 3,
            window_ms: 5 * 60_000,
        }),
    )
    .with_message(AUTH_MESSAGE)
}

fn default_api() -> Policy {
    Policy::new(
        "rate_limit",
        Algorithm::SlidingCounter(WindowLimits {
            limit: 50,
            window_ms: 60_000,
        }),
    )
    .with_message("API rate limit exceeded. Please try again later or upgrade your plan.")
}

fn default_chat() -> Policy {
    Policy::new(
        "chat_rate",
        Algorithm::SlidingLog(WindowLimits {
            limit: 20,
            window_ms: 10_000,
        }),
    )
    .with_message("You're sending messages too fast. Please slow down.")
}

fn default_upload() -> Policy {
    Policy::new(
        "upload_bucket",
        Algorithm::TokenBucket(BucketLimits {
            capacity: 10,
            refill_rate: 1.0,
        }),
    )
    .with_message("Upload rate exceeded. Please wait a few seconds before uploading again.")
}

impl LimitsConfig {
    /// All policies with their names.
    pub fn policies(&self) -> [(&'static str, &Policy); 5] {
        [
            ("signin", &self.signin),
            ("signup", &self.signup),
            ("api", &self.api),
            ("chat", &self.chat),
            ("upload", &self.upload),
        ]
    }

    fn policies_mut(&mut self) -> [&mut Policy; 5] {
        [
            &mut self.signin,
            &mut self.signup,
            &mut self.api,
            &mut self.chat,
            &mut self.upload,
        ]
    }
}

impl FloodgateConfig {
    /// Parse a YAML document. Missing sections take their defaults.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(contents).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Layer an optional file and `FLOODGATE__*` environment variables over
    /// the defaults, e.g. `FLOODGATE__STORE__URL=redis://cache:6379`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&FloodgateConfig::default())
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        let mut builder = ::config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("FLOODGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid limits and prefixes shared between policies.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store.timeout_ms must be > 0".to_string(),
            ));
        }

        let mut prefixes = HashSet::new();
        for (name, policy) in self.limits.policies() {
            policy.validate().map_err(|e| match e {
                FloodgateError::Config(msg) => {
                    FloodgateError::Config(format!("limits.{name}: {msg}"))
                }
                other => other,
            })?;
            if !prefixes.insert(policy.prefix.as_str()) {
                return Err(FloodgateError::Config(format!(
                    "limits.{name}: prefix {:?} is already used by another policy",
                    policy.prefix
                )));
            }
        }
        Ok(())
    }

    /// The limit policies with the store namespace applied to their prefixes.
    pub fn namespaced_limits(&self) -> LimitsConfig {
        let mut limits = self.limits.clone();
        if let Some(namespace) = self.store.key_namespace.as_deref().filter(|ns| !ns.is_empty()) {
            for policy in limits.policies_mut() {
                policy.prefix = format!("{namespace}_{}", policy.prefix);
            }
        }
        limits
    }
}
