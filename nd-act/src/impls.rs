use crate::Activation;
use ndarray::{prelude::*, Data};
use num_traits::{Float, NumCast};

impl Activation {
    pub fn apply<T>(&self, x: T) -> T
    where
        T: Float,
    {
        use Activation::*;

        match *self {
            Logistic => sigmoid(x),
            HardLogistic => hard_sigmoid(x),
            Tanh => x.tanh(),
            HardTanh => hard_tanh(x),
        }
    }
}

/// Logistic function, evaluated on the side that cannot overflow.
pub fn sigmoid<T>(x: T) -> T
where
    T: Float,
{
    let one = T::one();
    if x >= T::zero() {
        one / (one + (-x).exp())
    } else {
        let e = x.exp();
        e / (one + e)
    }
}

/// Binary cross entropy between a logit and a target in `[0, 1]`.
pub fn bce_with_logits<T>(logit: T, target: T) -> T
where
    T: Float,
{
    logit.max(T::zero()) - logit * target + (-logit.abs()).exp().ln_1p()
}

/// Piecewise-linear sigmoid, `clamp(x / 2 + 1 / 2, 0, 1)`.
pub fn hard_sigmoid<T>(x: T) -> T
where
    T: Float,
{
    let half = <T as NumCast>::from(0.5).unwrap_or_else(T::zero);
    (x * half + half).max(T::zero()).min(T::one())
}

pub fn hard_tanh<T>(x: T) -> T
where
    T: Float,
{
    x.max(-T::one()).min(T::one())
}

/// The maximum `m` of a vector and `ln(sum(exp(x - m)))`.
///
/// Callers subtract `m` from each logit before combining with the second
/// term, which keeps large logits from cancelling. A vector without a finite
/// maximum yields `(m, 0)`.
pub fn shifted_log_sum_exp<S, T>(xs: &ArrayBase<S, Ix1>) -> (T, T)
where
    S: Data<Elem = T>,
    T: Float,
{
    let max = xs.fold(T::neg_infinity(), |max, &x| max.max(x));
    if !max.is_finite() {
        return (max, T::zero());
    }
    let sum = xs.fold(T::zero(), |sum, &x| sum + (x - max).exp());
    (max, sum.ln())
}

pub fn log_softmax<S, T>(xs: &ArrayBase<S, Ix1>) -> Array1<T>
where
    S: Data<Elem = T>,
    T: Float,
{
    let (max, lse) = shifted_log_sum_exp(xs);
    xs.mapv(|x| (x - max) - lse)
}

pub fn softmax<S, T>(xs: &ArrayBase<S, Ix1>) -> Array1<T>
where
    S: Data<Elem = T>,
    T: Float,
{
    log_softmax(xs).mapv(T::exp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn sigmoid_is_finite_for_extreme_logits() {
        assert_eq!(sigmoid(1000.0f32), 1.0);
        assert_eq!(sigmoid(-1000.0f32), 0.0);
        assert_abs_diff_eq!(sigmoid(0.0f64), 0.5);
    }

    #[test]
    fn bce_with_logits_matches_naive_formula() {
        for &(x, t) in &[(0.3f64, 1.0), (-2.0, 0.0), (4.0, 0.25), (-0.7, 1.0)] {
            let p = 1.0 / (1.0 + (-x).exp());
            let naive = -(t * p.ln() + (1.0 - t) * (1.0 - p).ln());
            assert_abs_diff_eq!(bce_with_logits(x, t), naive, epsilon = 1e-9);
        }
    }

    #[test]
    fn bce_with_logits_does_not_overflow() {
        let loss = bce_with_logits(-500.0f32, 1.0);
        assert!(loss.is_finite());
        assert_abs_diff_eq!(loss, 500.0, epsilon = 1e-3);
        assert_eq!(bce_with_logits(500.0f32, 1.0), 0.0);
    }

    #[test]
    fn log_softmax_is_normalized() {
        let xs = array![1000.0f32, 1001.0, 999.0];
        let probs = softmax(&xs);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert_abs_diff_eq!(probs.sum(), 1.0, epsilon = 1e-6);
        assert!(probs[1] > probs[0] && probs[0] > probs[2]);
    }

    #[test]
    fn log_softmax_keeps_precision_for_large_logits() {
        let logp = log_softmax(&array![3e4f32, 3e4 + 1.0]);
        let expect = -(1.0f64 + (-1.0f64).exp()).ln() as f32;
        assert_abs_diff_eq!(logp[1], expect, epsilon = 1e-6);
        assert_abs_diff_eq!(logp[0], expect - 1.0, epsilon = 1e-6);
    }

    #[test]
    fn hard_gates_are_clamped() {
        assert_eq!(hard_sigmoid(10.0f32), 1.0);
        assert_eq!(hard_sigmoid(-10.0f32), 0.0);
        assert_eq!(hard_sigmoid(1.0f32), 1.0);
        assert_eq!(hard_sigmoid(-0.5f32), 0.25);
        assert_eq!(hard_tanh(-3.0f32), -1.0);
        assert_abs_diff_eq!(Activation::HardLogistic.apply(0.0f32), 0.5);
    }
}
