use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub provider: ProviderConfig,
    pub billing: BillingConfig,
    pub push: PushConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct BillingConfig {
    /// Bearer token the billing webhook must present
    pub webhook_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct PushConfig {
    pub app_id: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the audio object gateway
    pub base_url: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MINBAR").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
