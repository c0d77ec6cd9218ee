use super::smooth_l1::smooth_l1;
use crate::{coder::Variances, common::*};

/// Bounded IoU regression loss.
///
/// Predicted and target offsets are both decoded against a unit anchor
/// centered at the origin, so the loss is computed in the encoded domain
/// without the real anchor geometry.
#[derive(Debug, Clone, Copy, CopyGetters)]
pub struct BoundedIouLoss {
    #[getset(get_copy = "pub")]
    beta: f32,
    #[getset(get_copy = "pub")]
    eps: f32,
    variances: Variances,
}

impl BoundedIouLoss {
    pub fn new(variances: Variances) -> Self {
        Self {
            beta: 0.2,
            eps: 1e-3,
            variances,
        }
    }

    /// Loss of one anchor summed over the four coordinates.
    pub fn forward<S1, S2>(&self, pred: &ArrayBase<S1, Ix1>, target: &ArrayBase<S2, Ix1>) -> f32
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
    {
        let Self { beta, eps, .. } = *self;
        let [pred_cx, pred_cy, pred_w, pred_h] = self.unit_box(pred);
        let [target_cx, target_cy, target_w, target_h] = self.unit_box(target);

        let dx = (target_cx - pred_cx).abs();
        let dy = (target_cy - pred_cy).abs();

        let loss_dx = 1.0 - ((target_w - 2.0 * dx) / (target_w + 2.0 * dx + eps)).max(0.0);
        let loss_dy = 1.0 - ((target_h - 2.0 * dy) / (target_h + 2.0 * dy + eps)).max(0.0);
        let loss_dw = 1.0 - (target_w / (pred_w + eps)).min(pred_w / (target_w + eps));
        let loss_dh = 1.0 - (target_h / (pred_h + eps)).min(pred_h / (target_h + eps));

        [loss_dx, loss_dy, loss_dw, loss_dh]
            .into_iter()
            .map(|loss| smooth_l1(loss, beta))
            .sum()
    }

    fn unit_box<S>(&self, offsets: &ArrayBase<S, Ix1>) -> [f32; 4]
    where
        S: Data<Elem = f32>,
    {
        let Variances { xy, wh } = self.variances;
        [
            offsets[0] * xy,
            offsets[1] * xy,
            (offsets[2] * wh).exp(),
            (offsets[3] * wh).exp(),
        ]
    }
}
