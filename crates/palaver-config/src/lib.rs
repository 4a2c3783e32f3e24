pub mod loader;
pub mod model;

pub use loader::load_from_env;
pub use model::{
    AppConfig, GatewayConfig, IntentKeywords, MemoryConfig, ProviderConfig, ToolConfig,
    ToolHostConfig,
};
