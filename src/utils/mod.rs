pub mod constants;
pub mod helpers;
pub mod interrupt;
pub mod app_config;
pub mod logging;
pub mod prompt;

pub use constants::*;
pub use helpers::*;
pub use interrupt::Interrupt;
pub use app_config::{Identity, VaultConfig};
pub use prompt::{AssumeDefaults, Prompter, TerminalPrompter};
