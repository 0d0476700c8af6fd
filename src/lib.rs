pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;
pub use config::{Overrides, Settings};

pub use core::{
    anki::AnkiConnectClient,
    compiler::TypstCompiler,
    engine::{AbortHandle, SyncEngine},
    project::Project,
    scanner::CardScanner,
};
pub use domain::model::{Card, RunSummary};
pub use utils::error::{Result, Typ2AnkiError};
