#![forbid(unsafe_code)]

//! Virtual network device (VND) frame I/O.
//!
//! The routing core sees a device as two things: a stream of raw frames
//! read from the host, and a sink it can write frames back into. Both are
//! channel-backed here, so the daemon's event loop never blocks on the
//! device. Instantiating the interface itself (ioctl sequences, address
//! assignment) is left to the host configuration and the up/down hook
//! scripts.

mod device;

pub use device::{in_memory, open_file, InMemoryVnd, VndHandle, VndMode};
