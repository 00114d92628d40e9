//! Streams, the registry routing host callbacks to them, and the loop threads
//! those callbacks run on.

pub mod bridge;
pub mod registry;
pub mod runner;
pub mod service;
pub mod stream;
