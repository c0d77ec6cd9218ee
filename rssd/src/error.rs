//! Typed failures carried inside [anyhow::Error].

use thiserror::Error;

/// Unrecoverable detector errors.
///
/// Data sparsity (frames without objects, batches without positive anchors)
/// is not represented here. It is absorbed by the callee and logged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },
    #[error("fg_iou_threshold ({fg}) must not be less than bg_iou_threshold ({bg})")]
    InvalidThreshold { fg: f64, bg: f64 },
    #[error("encoded class {class} is out of range [1, {num_classes})")]
    InvalidLabel { class: i64, num_classes: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DetectError {
    pub fn shape<E, F>(what: &'static str, expected: E, found: F) -> Self
    where
        E: std::fmt::Debug,
        F: std::fmt::Debug,
    {
        Self::ShapeMismatch {
            what,
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        }
    }
}
