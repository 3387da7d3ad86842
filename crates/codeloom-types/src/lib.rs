pub mod cache;
pub mod context;
pub mod provider;
pub mod tool;

pub use cache::*;
pub use context::*;
pub use provider::*;
pub use tool::*;
