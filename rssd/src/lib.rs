//! The building blocks of a single-stage, anchor-based video object detector.

mod common;
pub mod anchors;
pub mod boxes;
pub mod coder;
pub mod config;
pub mod error;
pub mod loss;
pub mod rnn;
pub mod seq;

pub use error::DetectError;
