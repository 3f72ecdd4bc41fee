use serde::Deserialize;

fn default_enforcement_interval() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    /// Seconds between scheduled delinquency sweeps.
    #[serde(default = "default_enforcement_interval")]
    pub enforcement_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}
