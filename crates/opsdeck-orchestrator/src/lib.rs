pub mod catalog;
pub mod config;
pub mod error;
pub mod launcher;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod output;

pub use catalog::*;
pub use config::*;
pub use error::*;
pub use launcher::*;
pub use ledger::*;
pub use model::*;
pub use orchestrator::*;
pub use output::*;
