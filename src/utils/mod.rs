//! Shared helpers

pub mod image;
pub mod math;
