//! Vendor drivers (Atlas DSP, DirecTV, Global Caché iTach, Wolfpack matrix)

pub mod atlas;
pub mod directv;
pub mod handle;
pub mod itach;
pub mod traits;
pub mod wolfpack;

pub use handle::{DriverHandle, DriverSettings};
pub use traits::{CorrelationMode, DeviceDriver, FrameCodec};
