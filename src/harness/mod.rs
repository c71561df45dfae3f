//! Traffic harnesses for measuring relay throughput.
//!
//! - `sink`: accepts clients, discards what they send and reports rates
//! - `load`: pushes a fixed chunk at a target for a set duration

pub mod load;
pub mod sink;
