//! Payload decoding.
//!
//! Converts raw characteristic bytes into physical readings.

pub mod decoder;

pub use decoder::{decode, raw_value};
