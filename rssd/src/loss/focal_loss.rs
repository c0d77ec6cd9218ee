use crate::common::*;
use nd_act::{bce_with_logits, log_softmax, sigmoid};

/// Named focal loss coefficient sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocalPreset {
    /// `gamma = 2`, `alpha = 0.25`.
    Detection,
    /// `gamma = 3`, `alpha = 0.25`.
    Legacy,
}

impl Default for FocalPreset {
    fn default() -> Self {
        Self::Detection
    }
}

impl FocalPreset {
    pub fn gamma(&self) -> f64 {
        match self {
            Self::Detection => 2.0,
            Self::Legacy => 3.0,
        }
    }

    pub fn alpha(&self) -> f64 {
        0.25
    }
}

/// Focal loss initializer.
#[derive(Debug, Clone)]
pub struct FocalLossInit {
    /// The gamma coefficient.
    pub gamma: f64,
    /// The alpha coefficient, used by the sigmoid variant.
    pub alpha: f64,
    pub use_sigmoid: bool,
    /// Per-class weights, used by the softmax variant. Defaults to ones.
    pub class_weights: Option<Vec<f64>>,
    pub num_classes: usize,
}

impl FocalLossInit {
    pub fn from_preset(preset: FocalPreset, num_classes: usize, use_sigmoid: bool) -> Self {
        Self {
            gamma: preset.gamma(),
            alpha: preset.alpha(),
            use_sigmoid,
            class_weights: None,
            num_classes,
        }
    }

    /// Build a focal loss calculator.
    pub fn build(self) -> Result<FocalLoss> {
        let Self {
            gamma,
            alpha,
            use_sigmoid,
            class_weights,
            num_classes,
        } = self;

        ensure!(
            gamma.is_finite() && gamma >= 0.0,
            DetectError::InvalidConfig(format!("focal gamma must be non-negative, but get {}", gamma))
        );
        ensure!(
            (0.0..=1.0).contains(&alpha),
            DetectError::InvalidConfig(format!("focal alpha must lie in [0, 1], but get {}", alpha))
        );

        let class_weights = match class_weights {
            Some(weights) => {
                ensure!(
                    weights.len() == num_classes,
                    DetectError::shape("class weights", [num_classes], [weights.len()])
                );
                ensure!(
                    weights.iter().all(|&weight| weight.is_finite() && weight >= 0.0),
                    DetectError::InvalidConfig("class weights must be non-negative".into())
                );
                weights.into_iter().map(|weight| weight as f32).collect()
            }
            None => Array1::ones(num_classes),
        };

        Ok(FocalLoss {
            gamma: gamma as f32,
            alpha: alpha as f32,
            use_sigmoid,
            class_weights,
        })
    }
}

/// Focal loss calculator.
#[derive(Debug, Clone, CopyGetters)]
pub struct FocalLoss {
    #[getset(get_copy = "pub")]
    gamma: f32,
    #[getset(get_copy = "pub")]
    alpha: f32,
    #[getset(get_copy = "pub")]
    use_sigmoid: bool,
    class_weights: Array1<f32>,
}

impl FocalLoss {
    /// Unreduced loss of one row of logits against a class in `[0, num_classes)`.
    pub fn forward<S>(&self, logits: &ArrayBase<S, Ix1>, class: usize) -> f32
    where
        S: Data<Elem = f32>,
    {
        if self.use_sigmoid {
            self.sigmoid_focal(logits, class)
        } else {
            self.softmax_focal(logits, class)
        }
    }

    /// Sum over class columns of the one-hot binary focal term.
    fn sigmoid_focal<S>(&self, logits: &ArrayBase<S, Ix1>, class: usize) -> f32
    where
        S: Data<Elem = f32>,
    {
        let Self { gamma, alpha, .. } = *self;

        logits
            .iter()
            .enumerate()
            .map(|(column, &logit)| {
                let target = if column == class { 1.0 } else { 0.0 };
                let prob = sigmoid(logit);
                // probability mass on the wrong side
                let miss = (1.0 - prob) * target + prob * (1.0 - target);
                let weight = (alpha * target + (1.0 - alpha) * (1.0 - target)) * miss.powf(gamma);
                bce_with_logits(logit, target) * weight
            })
            .sum()
    }

    fn softmax_focal<S>(&self, logits: &ArrayBase<S, Ix1>, class: usize) -> f32
    where
        S: Data<Elem = f32>,
    {
        let log_prob = log_softmax(logits)[class].min(0.0);
        let prob = log_prob.exp();
        -(1.0 - prob).powf(self.gamma) * log_prob * self.class_weights[class]
    }
}
