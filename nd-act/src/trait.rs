use crate::{impls, Activation};
use ndarray::{prelude::*, Data, RemoveAxis};
use num_traits::Float;

pub trait ArrayActivationExt<T, D>
where
    D: Dimension,
{
    fn activation(&self, act: Activation) -> Array<T, D>;

    fn sigmoid(&self) -> Array<T, D>;

    /// Softmax along `axis`, computed through the log-sum-exp of each lane.
    fn softmax_axis(&self, axis: Axis) -> Array<T, D>;

    fn log_softmax_axis(&self, axis: Axis) -> Array<T, D>;
}

impl<S, T, D> ArrayActivationExt<T, D> for ArrayBase<S, D>
where
    S: Data<Elem = T>,
    T: Float,
    D: Dimension + RemoveAxis,
{
    fn activation(&self, act: Activation) -> Array<T, D> {
        self.mapv(|x| act.apply(x))
    }

    fn sigmoid(&self) -> Array<T, D> {
        self.mapv(impls::sigmoid)
    }

    fn softmax_axis(&self, axis: Axis) -> Array<T, D> {
        let mut output = self.log_softmax_axis(axis);
        output.mapv_inplace(T::exp);
        output
    }

    fn log_softmax_axis(&self, axis: Axis) -> Array<T, D> {
        let mut output = self.to_owned();
        output.lanes_mut(axis).into_iter().for_each(|mut lane| {
            let (max, lse) = impls::shifted_log_sum_exp(&lane);
            lane.mapv_inplace(|x| (x - max) - lse);
        });
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn row_softmax_sums_to_one() {
        let logits = array![[0.0f32, 1.0, 2.0], [-50.0, 50.0, 0.0]];
        let probs = logits.softmax_axis(Axis(1));
        for row in probs.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(probs[[1, 1]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn row_softmax_sums_to_one_for_large_logits() {
        let logits = array![[1000.0f32, 1001.0, 999.0], [3e4, 3e4 + 1.0, 3e4 - 2.0]];
        let probs = logits.softmax_axis(Axis(1));
        for row in probs.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }
}
