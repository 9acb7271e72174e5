//! Logging support for the holdings workspace.
//!
//! Library crates only emit `tracing` events; installing a subscriber is left to the
//! embedding process (or to tests) through [`logging::init`].

pub mod logging;
