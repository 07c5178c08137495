use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::config::ForecastConfig;
use crate::errors::ForecastResult;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "helio.toml";

/// Environment prefix; `__` separates sections, e.g. `HELIO_PIPELINE__HORIZON_MINUTES`.
pub const ENV_PREFIX: &str = "HELIO_";

/// Layered provider chain: defaults, then the TOML file, then the environment.
pub fn figment(path: Option<&Path>, env_prefix: &str) -> Figment {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(ForecastConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(env_prefix).split("__"))
}

/// Load and validate the engine configuration.
///
/// A missing TOML file is not an error; its layer is simply empty.
pub fn load_config(path: Option<&Path>) -> ForecastResult<ForecastConfig> {
    load_config_with_prefix(path, ENV_PREFIX)
}

pub fn load_config_with_prefix(path: Option<&Path>, env_prefix: &str) -> ForecastResult<ForecastConfig> {
    let config: ForecastConfig = figment(path, env_prefix).extract()?;
    config.validate()?;
    Ok(config)
}

/// Render the effective configuration as TOML.
pub fn render_config(config: &ForecastConfig) -> ForecastResult<String> {
    toml::to_string_pretty(config)
        .map_err(|e| crate::errors::ForecastError::config(format!("cannot render config: {e}")))
}
