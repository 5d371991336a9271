//! Application state, router and server lifecycle.

use crate::config::EntitlementConfig;
use crate::handlers;
use crate::services::{
    EmailProvider, EmailService, EntitlementFacade, EntitlementRepository, HitCounter,
    InMemoryHitCounter, InMemoryRepository, MongoRepository, PaymentWebhookProcessor,
    RateLimitAuditSink, RateLimiter, RedisHitCounter, ReferralRewardEngine, SpecialAccountService,
    SubscriptionLedger, TrialLifecycleManager,
};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use mongodb::{options::ClientOptions, Client};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    signature::{signature_validation_middleware, SignatureConfig, SignatureStore},
    tracing::request_id_middleware,
};
use service_core::retry::RetryConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const NONCE_SUBJECT: &str = "signature-nonce";

#[derive(Clone)]
pub struct AppState {
    pub signature_config: SignatureConfig,
    pub signing_client_id: String,
    pub signing_secret: Secret<String>,
    pub nonce_ttl_seconds: u64,
    pub allowed_origins: Vec<String>,
    pub counter: Arc<dyn HitCounter>,
    pub rate_limiter: RateLimiter,
    pub ledger: SubscriptionLedger,
    pub webhooks: PaymentWebhookProcessor,
    pub trials: TrialLifecycleManager,
    pub referrals: ReferralRewardEngine,
    pub special_accounts: SpecialAccountService,
    pub entitlements: EntitlementFacade,
}

impl AppState {
    pub fn new(
        config: &EntitlementConfig,
        repo: Arc<dyn EntitlementRepository>,
        audit: Arc<dyn RateLimitAuditSink>,
        counter: Arc<dyn HitCounter>,
        email: Option<Arc<dyn EmailProvider>>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(counter.clone(), audit, config.rate_limit.fail_open);
        let ledger = SubscriptionLedger::new(repo.clone());
        let trials = TrialLifecycleManager::new(
            repo.clone(),
            config.trial.default_days,
            config.trial.max_days,
        );

        Self {
            signature_config: config.security.signature_config.clone(),
            signing_client_id: config.security.signing_client_id.clone(),
            signing_secret: config.security.signing_secret.clone(),
            nonce_ttl_seconds: config.security.nonce_ttl_seconds,
            allowed_origins: config.security.allowed_origins.clone(),
            counter,
            webhooks: PaymentWebhookProcessor::new(
                ledger.clone(),
                repo.clone(),
                config.webhook.secret.clone(),
                config.webhook.tolerance_seconds,
            ),
            referrals: ReferralRewardEngine::new(
                repo.clone(),
                ledger.clone(),
                config.referral.bonus_days,
            ),
            special_accounts: SpecialAccountService::new(
                repo,
                ledger.clone(),
                email,
                RetryConfig::default(),
            ),
            entitlements: EntitlementFacade::new(
                rate_limiter.clone(),
                ledger.clone(),
                trials.clone(),
            ),
            rate_limiter,
            ledger,
            trials,
        }
    }
}

impl AsRef<SignatureConfig> for AppState {
    fn as_ref(&self) -> &SignatureConfig {
        &self.signature_config
    }
}

#[async_trait::async_trait]
impl SignatureStore for AppState {
    /// Nonces share the hit counter: the first hit inside the TTL wins.
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError> {
        let ttl = chrono::Duration::seconds(self.nonce_ttl_seconds as i64);
        let window = self
            .counter
            .hit(NONCE_SUBJECT, nonce, ttl, Utc::now())
            .await
            .map_err(|e| {
                tracing::error!("Failed to record nonce {}: {}", nonce, e);
                AppError::InternalError(anyhow::anyhow!("Failed to validate nonce: {}", e))
            })?;
        Ok(window.count == 1)
    }

    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError> {
        if client_id == self.signing_client_id {
            Ok(Some(self.signing_secret.expose_secret().clone()))
        } else {
            Ok(None)
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}", o, e);
                None
            }
        })
        .collect();

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/rate-limit/check", post(handlers::entitlements::check_rate_limit))
        .route("/entitlements/check", post(handlers::entitlements::check_entitlement))
        .route("/subscriptions/me", get(handlers::subscriptions::get_my_subscription))
        .route("/admin/entitlements", post(handlers::admin::override_entitlement))
        .route("/admin/special-accounts", post(handlers::admin::create_special_account))
        .route("/webhooks/payments", post(handlers::webhooks::payment_webhook))
        .route("/trials", post(handlers::trials::start_trial))
        .route("/trials/eligibility", get(handlers::trials::trial_eligibility))
        .route("/trials/sweep", post(handlers::trials::sweep_trials))
        .route("/referrals", post(handlers::referrals::referral_action))
        .route("/referrals/code", get(handlers::referrals::get_referral_code))
        .route("/referrals/apply-bonus", post(handlers::referrals::apply_bonus))
        .with_state(state.clone())
        .layer(from_fn_with_state(
            state,
            signature_validation_middleware::<AppState>,
        ))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    user = tracing::field::Empty,
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    HeaderName::from_static("x-user-email"),
                    HeaderName::from_static("x-user-role"),
                    HeaderName::from_static("x-client-id"),
                    HeaderName::from_static("x-timestamp"),
                    HeaderName::from_static("x-nonce"),
                    HeaderName::from_static("x-signature"),
                ]),
        )
}

/// Periodically drop rate limit windows that have run out.
pub fn spawn_window_eviction(counter: Arc<dyn HitCounter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match counter.evict_expired(Utc::now()).await {
                Ok(remaining) => crate::services::metrics::set_tracked_windows(remaining),
                Err(e) => tracing::warn!(error = %e, "Rate limit window eviction failed"),
            }
        }
    })
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    eviction: JoinHandle<()>,
}

impl Application {
    pub async fn build(config: EntitlementConfig) -> Result<Self, AppError> {
        let (repo, audit): (Arc<dyn EntitlementRepository>, Arc<dyn RateLimitAuditSink>) =
            match &config.mongodb {
                Some(mongo) => {
                    let mut client_options = ClientOptions::parse(mongo.uri.expose_secret())
                        .await
                        .map_err(|e| {
                            tracing::error!("Failed to parse MongoDB connection string: {}", e);
                            AppError::DatabaseError(e.into())
                        })?;
                    client_options.app_name = Some(config.service_name.clone());

                    let client = Client::with_options(client_options).map_err(|e| {
                        tracing::error!("Failed to create MongoDB client: {}", e);
                        AppError::DatabaseError(e.into())
                    })?;
                    let repository = Arc::new(MongoRepository::new(&client.database(&mongo.database)));

                    repository.init_indexes().await.map_err(|e| {
                        tracing::error!("Failed to initialize database indexes: {}", e);
                        AppError::DatabaseError(e)
                    })?;
                    let audit: Arc<dyn RateLimitAuditSink> = repository.clone();
                    let repo: Arc<dyn EntitlementRepository> = repository;
                    (repo, audit)
                }
                None => {
                    tracing::warn!("MONGODB_URI not set; using in-memory storage");
                    let repository = Arc::new(InMemoryRepository::new());
                    let audit: Arc<dyn RateLimitAuditSink> = repository.clone();
                    let repo: Arc<dyn EntitlementRepository> = repository;
                    (repo, audit)
                }
            };

        let counter: Arc<dyn HitCounter> = match &config.redis {
            Some(redis) => Arc::new(RedisHitCounter::new(&redis.url).await.map_err(|e| {
                tracing::error!("Failed to connect to Redis: {}", e);
                AppError::InternalError(e)
            })?),
            None => {
                tracing::warn!("REDIS_URL not set; rate limit counters are process-local");
                Arc::new(InMemoryHitCounter::new())
            }
        };

        let email: Option<Arc<dyn EmailProvider>> = match &config.smtp {
            Some(smtp) => Some(Arc::new(EmailService::new(smtp)?)),
            None => {
                tracing::warn!("SMTP not configured; welcome emails are disabled");
                None
            }
        };

        let state = AppState::new(&config, repo, audit, counter.clone(), email);

        let eviction = spawn_window_eviction(
            counter,
            Duration::from_secs(config.rate_limit.eviction_interval_seconds.max(1)),
        );

        // Port 0 picks a random port for tests.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "Entitlement service listening");

        Ok(Self {
            port,
            listener,
            state,
            eviction,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        let result = axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        self.eviction.abort();
        tracing::info!("Service shutdown complete");
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
