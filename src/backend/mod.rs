//! Backend abstraction layer
//!
//! Provides the [`GpuBackend`] trait and the types shared by its implementations.

pub mod dummy;
pub mod traits;
pub mod types;
pub mod vulkan;

pub use dummy::{AcquireScript, BackendEvent, DummyBackend, PresentScript};
pub use traits::*;
pub use types::*;
