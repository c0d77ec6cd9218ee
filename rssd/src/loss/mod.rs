//! Localization and classification losses over encoded anchor targets.

mod bounded_iou;
mod config;
mod cross_entropy;
mod focal_loss;
mod hard_negative;
mod smooth_l1;
mod ssd_loss;

pub use bounded_iou::*;
pub use config::*;
pub use cross_entropy::*;
pub use focal_loss::*;
pub use hard_negative::*;
pub use smooth_l1::*;
pub use ssd_loss::*;
