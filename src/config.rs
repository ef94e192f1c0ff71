use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }

    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

/// Log line encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// `LOG_FORMAT` wins; otherwise JSON in production and pretty elsewhere.
    fn resolve(raw: Option<&str>, env: &Environment) -> Result<Self> {
        match raw.map(|s| s.trim().to_lowercase()) {
            None => Ok(if env.is_prod() { Self::Json } else { Self::Pretty }),
            Some(s) => match s.as_str() {
                "json" => Ok(Self::Json),
                "pretty" => Ok(Self::Pretty),
                "compact" => Ok(Self::Compact),
                other => bail!("unknown LOG_FORMAT {other:?}, expected json, pretty or compact"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown STORE_BACKEND {other:?}, expected postgres or memory"),
        }
    }
}

/// Marketplace rules that vary per deployment.
#[derive(Debug, Clone)]
pub struct MarketPolicy {
    pub min_task_budget: Decimal,
    /// Reject the other pending bids when one is accepted
    pub auto_reject_pending_bids: bool,
    pub max_upload_bytes: usize,
}

impl Default for MarketPolicy {
    fn default() -> Self {
        Self {
            min_task_budget: Decimal::from(10),
            auto_reject_pending_bids: true,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,
    pub log_format: LogFormat,

    // Store
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    pub read_retry_max_elapsed: Duration,

    // CORS
    pub cors_allow_origins: Vec<String>,

    // Supabase Auth
    pub supabase_jwt_secret: String,
    pub supabase_jwt_audience: String,

    // Object storage; uploads stay in memory when unset
    pub storage_url: Option<Url>,
    pub storage_service_key: String,
    pub storage_timeout_seconds: u64,

    pub policy: MarketPolicy,
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("ENV").unwrap_or_else(|_| "dev".to_string()));
        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let log_format = LogFormat::resolve(env::var("LOG_FORMAT").ok().as_deref(), &env)?;

        // Store
        let store_backend = StoreBackend::from_str(
            &env::var("STORE_BACKEND").unwrap_or_else(|_| "postgres".to_string()),
        )?;
        let database_url = match store_backend {
            StoreBackend::Postgres => env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            StoreBackend::Memory => env::var("DATABASE_URL").unwrap_or_default(),
        };
        let database_max_connections = parse_or("DATABASE_MAX_CONNECTIONS", 10);
        let run_migrations = flag("RUN_MIGRATIONS", false);
        let read_retry_max_elapsed =
            Duration::from_millis(parse_or("READ_RETRY_MAX_ELAPSED_MS", 10_000));

        // CORS
        let cors_allow_origins = env::var("CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        // Supabase Auth
        let supabase_jwt_secret =
            env::var("SUPABASE_JWT_SECRET").context("SUPABASE_JWT_SECRET must be set")?;
        let supabase_jwt_audience =
            env::var("SUPABASE_JWT_AUDIENCE").unwrap_or_else(|_| "authenticated".to_string());

        // Object storage
        let storage_url = match env::var("STORAGE_URL") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(Url::parse(raw.trim()).context("STORAGE_URL is not a valid URL")?)
            }
            _ => None,
        };
        let storage_service_key = match storage_url {
            Some(_) => env::var("STORAGE_SERVICE_KEY")
                .context("STORAGE_SERVICE_KEY must be set when STORAGE_URL is")?,
            None => String::new(),
        };
        let storage_timeout_seconds = parse_or("STORAGE_TIMEOUT_SECONDS", 30);

        let defaults = MarketPolicy::default();
        let policy = MarketPolicy {
            min_task_budget: parse_or("MIN_TASK_BUDGET", defaults.min_task_budget),
            auto_reject_pending_bids: flag(
                "AUTO_REJECT_PENDING_BIDS",
                defaults.auto_reject_pending_bids,
            ),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
        };

        Ok(Settings {
            env,
            server_addr,
            log_format,
            store_backend,
            database_url,
            database_max_connections,
            run_migrations,
            read_retry_max_elapsed,
            cors_allow_origins,
            supabase_jwt_secret,
            supabase_jwt_audience,
            storage_url,
            storage_service_key,
            storage_timeout_seconds,
            policy,
        })
    }

    /// Settings for tests and local runs against the memory backend.
    pub fn for_memory(jwt_secret: &str) -> Self {
        Settings {
            env: Environment::Dev,
            server_addr: "127.0.0.1:0".to_string(),
            log_format: LogFormat::Compact,
            store_backend: StoreBackend::Memory,
            database_url: String::new(),
            database_max_connections: 1,
            run_migrations: false,
            read_retry_max_elapsed: Duration::from_millis(500),
            cors_allow_origins: vec!["http://localhost:5173".to_string()],
            supabase_jwt_secret: jwt_secret.to_string(),
            supabase_jwt_audience: "authenticated".to_string(),
            storage_url: None,
            storage_service_key: String::new(),
            storage_timeout_seconds: 30,
            policy: MarketPolicy::default(),
        }
    }
}
