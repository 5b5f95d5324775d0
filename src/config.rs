use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use url::Url;

use crate::error::AppError;

/// Provider identity drawn into the report header. One configured block,
/// never inferred from "whichever organization is active".
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub name: String,
    pub provider_id: String,
    pub address: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    /// Directory holding the fillable report template. Single configured
    /// location; there is no fallback path chain.
    pub asset_root: PathBuf,
    /// Root under which `reports/<YYYY>/<MM>/<DD>/...` is written.
    pub reports_root: PathBuf,
    pub provider: ProviderProfile,
    pub notify_webhook: Option<Url>,
    pub audit_webhook: Option<Url>,
    pub render_concurrency: usize,
    pub render_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://nemt.db".to_string());
        let listen_addr: SocketAddr = env::var("APP_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid APP_LISTEN_ADDR: {err}")))?;

        let asset_root = env::var("ASSET_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("assets"));

        let reports_root = env::var("REPORTS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        let provider = ProviderProfile {
            name: env::var("PROVIDER_NAME")
                .unwrap_or_else(|_| "Desert Sun Medical Transport".to_string()),
            provider_id: env::var("PROVIDER_ID").unwrap_or_else(|_| "000000".to_string()),
            address: env::var("PROVIDER_ADDRESS")
                .unwrap_or_else(|_| "2402 W Campbell Ave, Phoenix, AZ 85015".to_string()),
            phone: env::var("PROVIDER_PHONE").unwrap_or_else(|_| "(602) 555-0100".to_string()),
        };

        let notify_webhook = parse_optional_url("NOTIFY_WEBHOOK_URL")?;
        let audit_webhook = parse_optional_url("AUDIT_WEBHOOK_URL")?;

        let render_concurrency = env::var("RENDER_CONCURRENCY")
            .unwrap_or_else(|_| "4".to_string())
            .parse::<usize>()
            .map_err(|err| AppError::Config(format!("invalid RENDER_CONCURRENCY: {err}")))?
            .max(1);

        let render_timeout_secs = env::var("RENDER_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .map_err(|err| AppError::Config(format!("invalid RENDER_TIMEOUT_SECS: {err}")))?;

        Ok(Self {
            database_url,
            listen_addr,
            asset_root,
            reports_root,
            provider,
            notify_webhook,
            audit_webhook,
            render_concurrency,
            render_timeout: Duration::from_secs(render_timeout_secs),
        })
    }
}

fn parse_optional_url(var: &str) -> Result<Option<Url>, AppError> {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => Url::parse(raw.trim())
            .map(Some)
            .map_err(|err| AppError::Config(format!("invalid {var}: {err}"))),
        _ => Ok(None),
    }
}
