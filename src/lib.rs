//! Venue AV Control
//!
//! Control core for commercial audio/video hardware on a venue network.
//!
//! This library provides:
//! - Framed TCP transport with request/response correlation
//! - Drivers for Atlas gain DSPs, DirecTV receivers, iTach IR blasters
//!   and Wolfpack HDMI matrices
//! - Discovery by SSDP listening and bounded port scanning
//! - A connection manager that owns device lifecycle status

pub mod adapters;
pub mod bus;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod registry;
pub mod transport;

pub use device::{Capability, Device, DeviceId, DeviceStatus, DriverKind, Identification};
pub use error::DeviceError;
pub use manager::{ConnectionManager, ManagerError};
