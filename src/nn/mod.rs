//! Neural network components

pub mod blocks;
pub mod checkpoint;
pub mod hooks;
pub mod layers;
pub mod models;
pub mod visit;

pub use blocks::*;
pub use checkpoint::{load_weights, save_weights, StateDict};
pub use hooks::{ForwardHook, HookHandle, HookRegistry};
pub use layers::*;
pub use models::*;
