//! Platform layer for the lumen renderer.
//!
//! Wraps a winit window and hands out the raw display and window handles
//! the Vulkan backend builds its surface from.

mod window;

pub use window::{Window, WindowHandles};

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
