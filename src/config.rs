use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Meta Graph API base, e.g. https://graph.facebook.com
    pub graph_base_url: String,
    /// Graph API version segment, e.g. v21.0
    pub graph_api_version: String,
    /// App secret used for X-Hub-Signature-256 verification and token exchange.
    pub meta_app_secret: String,
    pub meta_app_id: String,
    /// Long-lived user access token (refreshed on a schedule, not per request).
    pub meta_access_token: String,
    /// Token echoed back on the GET verification handshake.
    pub meta_verify_token: String,
    /// Default region for bare national phone numbers, e.g. "IN".
    pub default_phone_region: String,
    pub polling_enabled: bool,
    pub polling_interval_minutes: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            graph_base_url: std::env::var("GRAPH_BASE_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com".to_string()),
            graph_api_version: std::env::var("GRAPH_API_VERSION")
                .unwrap_or_else(|_| "v21.0".to_string()),
            meta_app_secret: std::env::var("META_APP_SECRET")
                .map_err(|_| anyhow::anyhow!("META_APP_SECRET environment variable required"))
                .and_then(|secret| {
                    if secret.trim().is_empty() {
                        anyhow::bail!("META_APP_SECRET cannot be empty");
                    }
                    Ok(secret)
                })?,
            meta_app_id: std::env::var("META_APP_ID")
                .map_err(|_| anyhow::anyhow!("META_APP_ID environment variable required"))
                .and_then(|id| {
                    if id.trim().is_empty() {
                        anyhow::bail!("META_APP_ID cannot be empty");
                    }
                    Ok(id)
                })?,
            meta_access_token: std::env::var("META_ACCESS_TOKEN")
                .map_err(|_| anyhow::anyhow!("META_ACCESS_TOKEN environment variable required"))
                .and_then(|token| {
                    if token.trim().is_empty() {
                        anyhow::bail!("META_ACCESS_TOKEN cannot be empty");
                    }
                    Ok(token)
                })?,
            meta_verify_token: std::env::var("META_VERIFY_TOKEN")
                .map_err(|_| anyhow::anyhow!("META_VERIFY_TOKEN environment variable required"))
                .and_then(|token| {
                    if token.trim().is_empty() {
                        anyhow::bail!("META_VERIFY_TOKEN cannot be empty");
                    }
                    Ok(token)
                })?,
            default_phone_region: std::env::var("DEFAULT_PHONE_REGION")
                .unwrap_or_else(|_| "IN".to_string()),
            polling_enabled: std::env::var("POLLING_ENABLED")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            polling_interval_minutes: std::env::var("POLLING_INTERVAL_MINUTES")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("POLLING_INTERVAL_MINUTES must be a number"))?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!(
            "Graph API: {}/{}",
            config.graph_base_url,
            config.graph_api_version
        );
        tracing::debug!("Server Port: {}", config.port);
        if config.polling_enabled {
            tracing::info!(
                "Polling enabled every {} minute(s)",
                config.polling_interval_minutes
            );
        }

        Ok(config)
    }
}
