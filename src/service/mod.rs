//! Service layer module

pub mod context;
pub mod types;

pub use context::RuntimeContext;
pub use types::*;
