use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use reqwest::Client;
use sqlx::PgPool;
use time::Duration as TimeDuration;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

use covergen_backend::config::{Config, ProviderKind};
use covergen_backend::db::postgres_auth_repository::{
    PostgresLegacyAuthRepository, PostgresPrimaryAuthRepository,
};
use covergen_backend::db::postgres_credit_repository::PostgresCreditRepository;
use covergen_backend::db::postgres_payment_repository::PostgresPaymentRepository;
use covergen_backend::db::postgres_user_mapping_repository::PostgresUserMappingRepository;
use covergen_backend::responses::JsonResponse;
use covergen_backend::routes::{
    auth::{handle_convert_legacy, handle_logout_all, handle_session},
    credits::{check_credits, get_credit_history, get_credits},
    generation::handle_generate,
    webhooks::{handle_payment_webhook, webhook_liveness},
};
use covergen_backend::services::credit_gate::CreditGate;
use covergen_backend::services::generation::HttpGenerationClient;
use covergen_backend::services::ledger::CreditLedger;
use covergen_backend::services::notifier::UsageTrackingNotifier;
use covergen_backend::services::payment_provider::{
    CreemProvider, PaymentProvider, StripeProvider,
};
use covergen_backend::services::payment_store::PaymentStore;
use covergen_backend::services::session_bridge::SessionBridge;
use covergen_backend::services::webhook::WebhookReconciler;
use covergen_backend::state::{AppState, CookieSettings};

#[cfg(feature = "tls")]
use axum_server::tls_rustls::RustlsConfig;

fn init_tracing(sentry_enabled: bool) {
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(sentry_enabled.then(|| sentry_tracing::layer()))
        .init();
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    let sentry_guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 0.1,
                ..Default::default()
            },
        ))
    });
    init_tracing(sentry_guard.is_some());

    // Default: 200ms/token (~5 req/sec) with short bursts for client polling
    let rate_limit_ms: u64 = env_or("RATE_LIMITER_MILLISECONDS", 200);
    let rate_limit_burst: u32 = env_or("RATE_LIMITER_BURST", 20);
    let global_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(rate_limit_ms)
            .burst_size(rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .ok_or_else(|| anyhow!("invalid rate limiter settings"))?,
    );

    let governor_limiter = global_governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let pool = establish_connection(&config.database_url).await?;
    if config.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        info!("database migrations applied");
    }

    let ledger = CreditLedger::new(Arc::new(PostgresCreditRepository { pool: pool.clone() }));
    let payments = PaymentStore::new(
        Arc::new(PostgresPaymentRepository { pool: pool.clone() }),
        config.transition_policy,
    );

    let provider: Arc<dyn PaymentProvider> = match config.payment_provider {
        ProviderKind::Stripe => Arc::new(StripeProvider::new(&config.payment_webhook_secret)),
        ProviderKind::Creem => Arc::new(CreemProvider::new(&config.payment_webhook_secret)),
    };
    let primary_auth = Arc::new(PostgresPrimaryAuthRepository::new(pool.clone()));
    let webhooks = WebhookReconciler::new(
        provider,
        payments.clone(),
        primary_auth.clone(),
        Arc::new(UsageTrackingNotifier { pool: pool.clone() }),
    );

    let sessions = SessionBridge::new(
        primary_auth,
        Arc::new(PostgresLegacyAuthRepository { pool: pool.clone() }),
        Arc::new(PostgresUserMappingRepository { pool: pool.clone() }),
        config.mapping_conflict_policy,
        TimeDuration::hours(config.session_ttl_hours),
    );

    let generator = Arc::new(HttpGenerationClient::new(
        Client::new(),
        config.generation_api_url.clone(),
        config.generation_api_key.clone(),
    ));

    let state = AppState {
        credit_gate: CreditGate::new(ledger.clone()),
        ledger,
        payments,
        webhooks,
        generator,
        sessions,
        cookies: Arc::new(CookieSettings {
            primary_name: config.session_cookie_name.clone(),
            legacy_name: config.legacy_session_cookie_name.clone(),
            secure: config.auth_cookie_secure,
        }),
    };

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .frontend_origin
                .parse::<HeaderValue>()
                .context("FRONTEND_ORIGIN is not a valid header value")?,
        )
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let auth_routes = Router::new()
        .route("/session", get(handle_session))
        .route("/logout-all", post(handle_logout_all))
        .route("/convert-legacy", post(handle_convert_legacy));

    let credit_routes = Router::new()
        .route("/", get(get_credits))
        .route("/history", get(get_credit_history))
        .route("/check", post(check_credits));

    // Provider callbacks are signed, not session-authenticated
    let webhook_routes = Router::new().route(
        "/payment",
        post(handle_payment_webhook).get(webhook_liveness),
    );

    let app = Router::new()
        .route("/", get(root))
        .route("/api/generate", post(handle_generate))
        .nest("/api/auth", auth_routes)
        .nest("/api/credits", credit_routes)
        .nest("/webhooks", webhook_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer {
            config: global_governor_conf,
        })
        .layer(cors);

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let addr = config.bind_addr;

    #[cfg(feature = "tls")]
    {
        let cert = std::env::var("DEV_CERT_LOCATION").context("DEV_CERT_LOCATION is not set")?;
        let key = std::env::var("DEV_KEY_LOCATION").context("DEV_KEY_LOCATION is not set")?;
        let tls_config = RustlsConfig::from_pem_file(cert, key)
            .await
            .context("failed to load TLS certs")?;

        info!(%addr, "listening with TLS");
        axum_server::bind_rustls(addr, tls_config)
            .serve(make_service)
            .await?;
        return Ok(());
    }

    #[allow(unreachable_code)]
    {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening without TLS");
        axum::serve(listener, make_service).await?;
        Ok(())
    }
}

async fn root() -> Response {
    JsonResponse::success("covergen backend is running").into_response()
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("connected to the database");
    Ok(pool)
}
