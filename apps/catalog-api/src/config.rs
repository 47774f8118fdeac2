/// Catalog API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string, used by both the query pool and the
    /// dedicated LISTEN connection.
    pub database_url: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Notification channel the change trigger publishes on.
    pub notify_channel: String,
}

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_NOTIFY_CHANNEL: &str = "data_updates";

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_url: normalize_database_url(&required_var("DATABASE_URL")),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            notify_channel: std::env::var("NOTIFY_CHANNEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_NOTIFY_CHANNEL.to_string()),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

/// Accept driver-qualified URLs (`postgresql+asyncpg://...`) from shared
/// deployment files and rewrite them to the plain `postgres://` form.
pub fn normalize_database_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) if scheme.starts_with("postgres") => format!("postgres://{rest}"),
        _ => url.to_string(),
    }
}
