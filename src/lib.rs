//! Docker Volume Snapshot
//!
//! Creates and restores tar snapshots of Docker volumes by running a
//! short-lived helper container that mounts the volume and a host directory.

pub mod cli;
pub mod core;
pub mod utils;
