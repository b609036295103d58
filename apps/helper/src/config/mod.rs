use config::Config;
use serde::Deserialize;

use std::path::PathBuf;

use punch_helper::HelperConfig;

mod logger;
pub use logger::LoggerConfig;

/// Full daemon configuration, from a TOML file.
#[derive(Deserialize)]
pub struct DaemonConfig {
    pub helper: HelperConfig,

    #[serde(default)]
    pub logger: LoggerConfig,
}

impl DaemonConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Configuration with nothing but a listen port, for flag-only runs.
    pub fn from_listen_port(listen_port: u16) -> Self {
        Self {
            helper: HelperConfig::new(listen_port),
            logger: LoggerConfig::default(),
        }
    }
}
