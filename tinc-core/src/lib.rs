#![forbid(unsafe_code)]

//! Core utilities shared across the tinc workspace.
//!
//! This crate intentionally stays lightweight and I/O-free apart from
//! reading configuration files. It provides the error domain, the layered
//! key/value configuration store, the timer queue driving the daemon's
//! event loop, and a handful of shared scalar types.

pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::{Config, ConfigEntry};
pub use error::{Error, Result};
pub use event::{TimerId, Timers};
pub use types::{valid_node_name, NodeOptions, PROTOCOL_VERSION};
