use std::{env, fmt, net::SocketAddr, time::Duration};

use storypulse_core::lifecycle::VerificationMode;
use url::Url;

use super::server_bind_address;

const DEFAULT_DATABASE_URL: &str = "sqlite://storypulse.db?mode=rwc";
const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.instagram.com/";
const DEFAULT_OAUTH_BASE_URL: &str = "https://api.instagram.com/oauth/";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_EVALUATOR_INTERVAL_SECS: u64 = 7200;
const DEFAULT_TOKEN_CHECK_INTERVAL_SECS: u64 = 3600;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Instagram app credentials and endpoints.
#[derive(Clone)]
pub struct InstagramSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Url,
    pub graph_base_url: Url,
    pub oauth_base_url: Url,
}

impl fmt::Debug for InstagramSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstagramSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("graph_base_url", &self.graph_base_url.as_str())
            .field("oauth_base_url", &self.oauth_base_url.as_str())
            .finish()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Used when the tenant has no secret of its own.
    pub webhook_app_secret: Option<String>,
    pub webhook_verify_token: Option<String>,
    pub cron_secret: String,
    pub auth_token_secret: String,
    pub instagram: InstagramSettings,
    pub public_base_url: Url,
    pub evaluator_interval: Duration,
    pub token_check_interval: Duration,
    pub verification_mode: VerificationMode,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    ///
    /// Secrets are mandatory in production; other environments fall back to fixed development values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let secret = |name: &'static str, dev_default: &str| -> Result<String, ConfigError> {
            match optional(name) {
                Some(value) => Ok(value),
                None if environment.is_production() => Err(ConfigError::MissingVar(name)),
                None => Ok(dev_default.to_string()),
            }
        };

        let cron_secret = secret("CRON_SECRET", "dev-cron-secret")?;
        let auth_token_secret = secret("AUTH_TOKEN_SECRET", "dev-auth-token-secret")?;
        let client_id = secret("INSTAGRAM_CLIENT_ID", "dev-instagram-client")?;
        let client_secret = secret("INSTAGRAM_CLIENT_SECRET", "dev-instagram-secret")?;
        let redirect_uri = parse_url(
            "INSTAGRAM_REDIRECT_URI",
            &secret(
                "INSTAGRAM_REDIRECT_URI",
                "http://127.0.0.1:8080/instagram/callback",
            )?,
        )?;

        let instagram = InstagramSettings {
            client_id,
            client_secret,
            redirect_uri,
            graph_base_url: url_var("INSTAGRAM_GRAPH_BASE_URL", DEFAULT_GRAPH_BASE_URL)?,
            oauth_base_url: url_var("INSTAGRAM_OAUTH_BASE_URL", DEFAULT_OAUTH_BASE_URL)?,
        };

        let verification_mode = match optional("MENTION_VERIFICATION_MODE") {
            Some(value) => value
                .parse::<VerificationMode>()
                .map_err(|_| ConfigError::InvalidVerificationMode(value))?,
            None => VerificationMode::GraphProbe,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: optional("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            webhook_app_secret: optional("WEBHOOK_APP_SECRET"),
            webhook_verify_token: optional("WEBHOOK_VERIFY_TOKEN"),
            cron_secret,
            auth_token_secret,
            instagram,
            public_base_url: url_var("PUBLIC_BASE_URL", DEFAULT_PUBLIC_BASE_URL)?,
            evaluator_interval: seconds_var(
                "EVALUATOR_INTERVAL_SECS",
                DEFAULT_EVALUATOR_INTERVAL_SECS,
            )?,
            token_check_interval: seconds_var(
                "TOKEN_CHECK_INTERVAL_SECS",
                DEFAULT_TOKEN_CHECK_INTERVAL_SECS,
            )?,
            verification_mode,
        })
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("environment", &self.environment)
            .field("database_url", &self.database_url)
            .field("webhook_app_secret", &self.webhook_app_secret.as_ref().map(|_| "<redacted>"))
            .field("webhook_verify_token", &self.webhook_verify_token.as_ref().map(|_| "<redacted>"))
            .field("cron_secret", &"<redacted>")
            .field("auth_token_secret", &"<redacted>")
            .field("instagram", &self.instagram)
            .field("public_base_url", &self.public_base_url.as_str())
            .field("evaluator_interval", &self.evaluator_interval)
            .field("token_check_interval", &self.token_check_interval)
            .field("verification_mode", &self.verification_mode)
            .finish()
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { var: name, source })
}

/// Parses a base URL, forcing a trailing slash so `Url::join` appends instead of replacing.
fn url_var(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let mut value = optional(name).unwrap_or_else(|| default.to_string());
    if !value.ends_with('/') {
        value.push('/');
    }
    parse_url(name, &value)
}

fn seconds_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs = match optional(name) {
        Some(value) => match value.parse::<u64>() {
            Ok(secs) if secs > 0 => secs,
            _ => return Err(ConfigError::InvalidNumber { var: name, value }),
        },
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    InvalidNumber {
        var: &'static str,
        value: String,
    },
    InvalidVerificationMode(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(name) => write!(f, "{name} must be set in production"),
            Self::InvalidUrl { var, source } => write!(f, "{var} is not a valid URL: {source}"),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive integer (got {value})")
            }
            Self::InvalidVerificationMode(value) => write!(
                f,
                "MENTION_VERIFICATION_MODE must be 'graph' or 'trust_expiry' (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindAddress(err) => Some(err),
            Self::InvalidUrl { source, .. } => Some(source),
            _ => None,
        }
    }
}
