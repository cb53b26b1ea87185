//! timbre-core: pure types, request validation, script templating and the
//! audio codec.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod audio;
pub mod request;
pub mod script;
pub mod types;
