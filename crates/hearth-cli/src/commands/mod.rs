pub mod config;
pub mod models;
pub mod vault;

pub use config::ConfigCommand;
pub use models::ModelsCommand;
pub use vault::VaultCommand;
