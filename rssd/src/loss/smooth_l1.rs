use crate::common::*;

/// Smooth L1 of a difference, quadratic below `beta` and linear above.
pub fn smooth_l1(diff: f32, beta: f32) -> f32 {
    let diff = diff.abs();
    if diff < beta {
        0.5 * diff * diff / beta
    } else {
        diff - 0.5 * beta
    }
}

/// Summed smooth L1 (`beta = 1`) between predicted and target offsets.
pub fn smooth_l1_loss<S1, S2>(pred: &ArrayBase<S1, Ix1>, target: &ArrayBase<S2, Ix1>) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    izip!(pred, target)
        .map(|(&pred, &target)| smooth_l1(pred - target, 1.0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_and_linear_regions() {
        assert_eq!(smooth_l1(0.5, 1.0), 0.125);
        assert_eq!(smooth_l1(-3.0, 1.0), 2.5);
        assert_eq!(smooth_l1(0.0, 0.2), 0.0);

        let pred = array![0.5f32, -3.0, 1.0, 0.0];
        let target = array![0.0f32, 0.0, 1.0, 0.0];
        assert_eq!(smooth_l1_loss(&pred, &target), 2.625);
    }
}
