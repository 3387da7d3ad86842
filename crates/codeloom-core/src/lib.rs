pub mod codegen;
pub mod config;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod output_validator;
pub mod runtime;
pub mod state;

pub use codegen::*;
pub use config::*;
pub use error::*;
pub use metadata::*;
pub use orchestrator::*;
pub use output_validator::*;
pub use runtime::*;
pub use state::*;
