//! Simulated hardware for exercising the acquisition exchange end to end.

pub mod mock;

pub use mock::{MockScanHead, ReceivedCommand, COUNTS_PER_VOLT};
