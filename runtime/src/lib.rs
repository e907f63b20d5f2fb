//! Shared-memory runtime for the Hartree engines.
//!
//! The engines in this workspace are driven by a fixed team of threads laid
//! out as a four-level group hierarchy (JC/PC/IC/JR). This crate provides the
//! pieces the engines share:
//!
//! - [`ThreadComm`]: the communicator tree with nested sense-reversal
//!   barriers,
//! - [`Worker`]: a thread's coordinate within the hierarchy,
//! - [`PackBuffer`]: aligned scratch for packed matrix panels,
//! - [`CommShape`]: the environment-driven thread configuration.

mod comm;
mod config;
mod errors;
mod pack;
mod worker;

pub use comm::ThreadComm;
pub use config::{read_nway_from_env, CommShape};
pub use errors::RuntimeError;
pub use pack::PackBuffer;
pub use worker::Worker;
