//! Render engine boundary for the simian render farm.
//!
//! This crate provides:
//! - The `RenderEngine` trait workers render through
//! - A subprocess engine that invokes the external renderer per combination
//! - Timeout handling and stderr capture for failed renders

pub mod command;
pub mod engine;
pub mod error;

pub use command::{check_program, CommandRunner, RenderCommand};
pub use engine::{CommandRenderEngine, RenderEngine, RenderSettings};
pub use error::{RenderError, RenderResult};
