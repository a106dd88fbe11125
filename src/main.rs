use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lead_intake_api::config::Config;
use lead_intake_api::db::Database;
use lead_intake_api::graph_client::{GraphClient, TokenManager};
use lead_intake_api::handlers::{self, AppState};
use lead_intake_api::orchestrator::Pipeline;
use lead_intake_api::storage::IntakeStore;
use lead_intake_api::{google, intake, poller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_intake_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let store = Arc::new(IntakeStore::new(db.pool.clone()));

    let graph = GraphClient::new(
        config.graph_base_url.clone(),
        config.graph_api_version.clone(),
    )
    .map_err(|e| anyhow::anyhow!("Graph client initialization failed: {}", e))?;
    tracing::info!(
        "Graph API client initialized: {}/{}",
        config.graph_base_url,
        config.graph_api_version
    );

    let tokens = Arc::new(TokenManager::new(
        config.meta_app_id.clone(),
        config.meta_app_secret.clone(),
        config.meta_access_token.clone(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        graph.clone(),
        tokens.clone(),
        config.default_phone_region.clone(),
    ));

    // Daily token exchange keeps the long-lived token from expiring.
    {
        let tokens = tokens.clone();
        let graph = graph.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                if let Err(e) = tokens.refresh(&graph).await {
                    tracing::error!("Scheduled token refresh failed: {}", e);
                }
            }
        });
    }

    if config.polling_enabled {
        let pipeline = pipeline.clone();
        let interval = config.polling_interval_minutes;
        tokio::spawn(async move {
            poller::run_polling_loop(pipeline, interval).await;
        });
        tracing::info!("Polling loop started (every {} minute(s))", interval);
    }

    let app_state = AppState {
        pool: db.pool.clone(),
        config: config.clone(),
        store,
        pipeline,
        graph,
        tokens,
    };

    // Rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        // Provider webhooks
        .route(
            "/api/v1/webhooks/meta",
            get(intake::verify_webhook).post(intake::receive_webhook),
        )
        .route(
            "/api/v1/webhooks/google",
            post(google::receive_google_lead),
        )
        // Operations endpoints
        .route("/api/v1/ops/events/retry", post(handlers::retry_all_events))
        .route("/api/v1/ops/events/:id/retry", post(handlers::retry_event))
        .route("/api/v1/ops/events/:id", get(handlers::get_event))
        .route(
            "/api/v1/ops/forms/refresh/:page_id",
            post(handlers::refresh_forms),
        )
        .route(
            "/api/v1/ops/ads/:ad_id/forms",
            post(handlers::discover_ad_forms),
        )
        .layer(
            ServiceBuilder::new()
                // 5MB max payload
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting so the platform probe never 429s
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
