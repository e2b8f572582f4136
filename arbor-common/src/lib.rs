// arbor-common - Wire protocol definitions shared by the Arbor client
//
// This crate defines the frame layout spoken over the client TCP session

pub mod error;
pub mod primitive;
pub mod types;
pub mod wire;

// Re-export for convenience
pub use error::*;
pub use primitive::Primitive;
pub use types::*;
pub use wire::{Frame, WireFormat};
