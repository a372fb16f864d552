//! Top-level renderer error type.

use thiserror::Error;

use crate::backend::BackendError;
use crate::shader::ShaderError;

/// Errors surfaced by the renderer to its caller.
#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    /// Queue submission failed. The frame loop cannot continue.
    #[error("Frame submission failed: {0}")]
    Submit(#[source] BackendError),
    #[error("Texture error: {0}")]
    Texture(String),
    #[error("Window error: {0}")]
    Window(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type RendererResult<T> = Result<T, RendererError>;
