use std::{env, fmt::Debug, net::SocketAddr};

use anyhow::Result;
use data_model::FeatureFlags;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_tracing: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub state_store_path: String,
    pub listen_addr: String,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_resync_interval_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_store_path = env::current_dir()
            .expect("current dir must be readable")
            .join("virtsnap_storage/state");
        ServerConfig {
            state_store_path: state_store_path.to_string_lossy().to_string(),
            listen_addr: "0.0.0.0:8700".to_string(),
            resync_interval_secs: default_resync_interval_secs(),
            structured_logging: false,
            features: FeatureFlags::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.resync_interval_secs == 0 {
            return Err(anyhow::anyhow!("resync_interval_secs must be non-zero"));
        }
        Ok(())
    }
}
