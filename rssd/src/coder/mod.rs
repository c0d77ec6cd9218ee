//! Ground truth matching, target encoding and prediction decoding.

mod box_coder;
mod codec;
mod matcher;
mod target;

pub use box_coder::*;
pub use codec::*;
pub use matcher::*;
pub use target::*;
