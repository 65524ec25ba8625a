/*!
 * Core Module
 * Synchronization primitives and error types
 */

pub mod errors;
pub mod sync;

// Re-export for convenience
pub use errors::*;
