use secrecy::Secret;
use service_core::config::{self as core_config, get_env, get_optional_env};
use service_core::error::AppError;
use service_core::middleware::signature::SignatureConfig;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Unset outside production means in-memory storage.
    pub mongodb: Option<MongoConfig>,
    /// Unset means process-local rate limit counters.
    pub redis: Option<RedisConfig>,
    pub rate_limit: RateLimitConfig,
    pub webhook: WebhookConfig,
    pub security: SecurityConfig,
    pub smtp: Option<SmtpConfig>,
    pub trial: TrialConfig,
    pub referral: ReferralConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: Secret<String>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Allow requests when the counter store is unreachable.
    pub fail_open: bool,
    pub eviction_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: Option<Secret<String>>,
    pub tolerance_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub signing_client_id: String,
    pub signing_secret: Secret<String>,
    pub nonce_ttl_seconds: u64,
    pub signature_config: SignatureConfig,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct TrialConfig {
    pub default_days: u32,
    pub max_days: u32,
}

#[derive(Debug, Clone)]
pub struct ReferralConfig {
    pub bonus_days: u32,
}

impl EntitlementConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let mongodb = match get_optional_env("MONGODB_URI") {
            Some(uri) => Some(MongoConfig {
                uri: Secret::new(uri),
                database: get_env("MONGODB_DATABASE", Some("entitlements"), is_prod)?,
            }),
            None => None,
        };

        let smtp = match get_optional_env("SMTP_HOST") {
            Some(host) => Some(SmtpConfig {
                host,
                port: parse_env("SMTP_PORT", "587")?,
                user: get_env("SMTP_USER", None, is_prod)?,
                password: Secret::new(get_env("SMTP_PASSWORD", None, is_prod)?),
                from: get_env("SMTP_FROM", None, is_prod)?,
            }),
            None => None,
        };

        let require_signatures: bool =
            parse_env("REQUIRE_SIGNATURES", if is_prod { "true" } else { "false" })?;

        let config = EntitlementConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("entitlement-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
            mongodb,
            redis: get_optional_env("REDIS_URL").map(|url| RedisConfig { url }),
            rate_limit: RateLimitConfig {
                fail_open: parse_env("RATE_LIMIT_FAIL_OPEN", "false")?,
                eviction_interval_seconds: parse_env(
                    "RATE_LIMIT_EVICTION_INTERVAL_SECONDS",
                    "60"
                )?,
            },
            webhook: WebhookConfig {
                secret: get_optional_env("PAYMENT_WEBHOOK_SECRET").map(Secret::new),
                tolerance_seconds: parse_env("PAYMENT_WEBHOOK_TOLERANCE_SECONDS", "300")?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                signing_client_id: get_env("SIGNING_CLIENT_ID", Some("frontend"), is_prod)?,
                signing_secret: Secret::new(get_env(
                    "SIGNING_SECRET",
                    Some("dev-signing-secret"),
                    is_prod,
                )?),
                nonce_ttl_seconds: parse_env("SIGNATURE_NONCE_TTL_SECONDS", "300")?,
                signature_config: SignatureConfig {
                    require_signatures,
                    excluded_paths: vec![
                        "/health".to_string(),
                        "/ready".to_string(),
                        "/metrics".to_string(),
                        "/webhooks/payments".to_string(),
                    ],
                    max_clock_skew_seconds: parse_env("SIGNATURE_MAX_CLOCK_SKEW_SECONDS", "60")?,
                },
            },
            smtp,
            trial: TrialConfig {
                default_days: parse_env("TRIAL_DEFAULT_DAYS", "7")?,
                max_days: parse_env("TRIAL_MAX_DAYS", "30")?,
            },
            referral: ReferralConfig {
                bonus_days: parse_env("REFERRAL_BONUS_DAYS", "30")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.trial.default_days == 0 || self.trial.default_days > self.trial.max_days {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TRIAL_DEFAULT_DAYS must be between 1 and TRIAL_MAX_DAYS"
            )));
        }

        if self.referral.bonus_days == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REFERRAL_BONUS_DAYS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.mongodb.is_none() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "MONGODB_URI is required in production"
                )));
            }

            if self.redis.is_none() {
                tracing::warn!("REDIS_URL not set in production; rate limits are per instance");
            }

            if self.webhook.secret.is_none() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "PAYMENT_WEBHOOK_SECRET is required in production"
                )));
            }

            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !self.security.signature_config.require_signatures {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "REQUIRE_SIGNATURES cannot be disabled in production"
                )));
            }
        }

        Ok(())
    }
}

/// Tunables keep their defaults in production too.
fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("Invalid value for {}: {}", key, e))
    })
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
