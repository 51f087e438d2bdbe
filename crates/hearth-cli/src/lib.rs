pub mod commands;
pub mod error;
pub mod output;

pub use commands::{ConfigCommand, ModelsCommand, VaultCommand};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_size, truncate_string};
