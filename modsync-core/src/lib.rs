//! Modsync library exports
//!
//! Repository aggregation, local module scanning and the install pipeline
//! for Magisk/KernelSU style root modules.

pub mod checksum;
pub mod compat;
pub mod config;
pub mod install;
pub mod local;
pub mod model;
pub mod net;
pub mod props;
pub mod repo;
pub mod store;
pub mod sync;
