//! Mock devices for driver and manager integration testing
//!
//! These mock servers speak the real wire protocols (Atlas JSON-over-TCP,
//! iTach line protocol, Wolfpack ASCII, DirecTV SHEF over HTTP) on random
//! local ports, so tests run without hardware.

#![allow(dead_code)]

pub mod atlas;
pub mod directv;
pub mod itach;
pub mod wolfpack;

pub use atlas::MockAtlasDsp;
pub use directv::MockDirectvReceiver;
pub use itach::MockItach;
pub use wolfpack::MockWolfpack;
