//! Common Utilities and Types Library
//!
//! Shared types and helpers used across the sidelink UE crates.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
