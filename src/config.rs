use anyhow::Result;
use serde::Deserialize;

use crate::protocol::{ProviderConfigs, SessionConfig};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    /// Server-side provider credentials; merged into sessions whose config
    /// names a provider without a key.
    #[serde(default)]
    pub providers: ProviderConfigs,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "ServiceConfig::default_name")]
    pub name: String,
    #[serde(default)]
    pub http: HttpConfig,
}

impl ServiceConfig {
    fn default_name() -> String {
        "stt-compare".to_string()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
    #[serde(default = "HttpConfig::default_port")]
    pub port: u16,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8000
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            port: Self::default_port(),
        }
    }
}

impl Config {
    /// Load from an optional config file plus `STT__`-prefixed environment
    /// variables (e.g. `STT__PROVIDERS__DEEPGRAM__APIKEY`).
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("STT").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Fill missing API keys in a session config from the server-side
    /// credentials. Only providers the client asked for are touched.
    pub fn merge_credentials(&self, session: &mut SessionConfig) {
        if let (Some(client), Some(server)) = (
            session.providers.deepgram.as_mut(),
            self.providers.deepgram.as_ref(),
        ) {
            if client.api_key.is_empty() {
                client.api_key = server.api_key.clone();
            }
        }
        if let (Some(client), Some(server)) = (
            session.providers.speechmatics.as_mut(),
            self.providers.speechmatics.as_ref(),
        ) {
            if client.api_key.is_empty() {
                client.api_key = server.api_key.clone();
            }
        }
    }
}
