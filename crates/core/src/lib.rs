//! Core utilities shared across the lumen crates.
//!
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Renderer configuration loaded from TOML

mod config;
mod error;
mod logging;
mod timer;

pub use config::{RendererConfig, WindowConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::Timer;
