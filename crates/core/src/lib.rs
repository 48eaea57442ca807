//! statewalk-core
//!
//! Core library for reconstructing function boundaries in native binaries and
//! propagating an opaque state value along their control flow.
//!
//! This crate defines the instruction/block model, the annotation store, the
//! analysis passes (boundary reconstruction and state calculation), the
//! loader/decoder collaborators, and the project database.
//!
//! All substantive logic lives here so that it is testable and reusable from
//! multiple frontends.

pub mod model;
pub mod annotations;
pub mod analysis;
pub mod services;
pub mod db;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
