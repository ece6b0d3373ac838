//! Core engine implementation

pub mod allocator;
pub mod block;
pub mod chain;
pub mod config;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod io;
pub mod timewheel;
pub mod volume;

pub use engine::Engine;
