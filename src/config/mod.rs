//! Configuration types and loading

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{ClientConfig, Config, LogConfig, PoolConfig, ServerConfig, DEFAULT_L2TP_PORT};
