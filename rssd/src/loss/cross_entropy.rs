use crate::common::*;
use nd_act::{bce_with_logits, shifted_log_sum_exp};

/// Unweighted classification loss over class logits.
#[derive(Debug, Clone, Copy, CopyGetters)]
pub struct CrossEntropyLoss {
    #[getset(get_copy = "pub")]
    use_sigmoid: bool,
}

impl CrossEntropyLoss {
    pub fn new(use_sigmoid: bool) -> Self {
        Self { use_sigmoid }
    }

    /// Loss of one row of logits against a class in `[0, num_classes)`.
    ///
    /// The softmax variant is the negative log-likelihood of `class`. The
    /// sigmoid variant sums binary cross-entropy against the one-hot target.
    pub fn forward<S>(&self, logits: &ArrayBase<S, Ix1>, class: usize) -> f32
    where
        S: Data<Elem = f32>,
    {
        if self.use_sigmoid {
            logits
                .iter()
                .enumerate()
                .map(|(column, &logit)| {
                    let target = if column == class { 1.0 } else { 0.0 };
                    bce_with_logits(logit, target)
                })
                .sum()
        } else {
            let (max, lse) = shifted_log_sum_exp(logits);
            (lse - (logits[class] - max)).max(0.0)
        }
    }
}
