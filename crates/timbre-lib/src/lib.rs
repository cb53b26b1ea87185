//! timbre-lib: voice conversion orchestration.
//!
//! Character resolution, entry-script templating, engine execution, the
//! audio cache bridge, and the HTTP API. Depends on timbre-core for pure types
//! and text processing.

pub mod bridge;
pub mod cache;
pub mod character;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod pipeline;
pub mod server;
pub mod template;

// Re-export timbre-core for convenience
pub use timbre_core;
