pub mod loader;
pub mod schema;

pub use {
    loader::{
        CONFIG_DIR_ENV, clear_config_dir, config_dir, discover_and_load, load_config,
        set_config_dir,
    },
    schema::{ModelgateConfig, OAuthSection, ProviderOverride},
};
