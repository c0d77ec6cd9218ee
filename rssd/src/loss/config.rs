use super::{ClassificationLossKind, FocalPreset, LocalizationLossKind, SsdLossInit};
use crate::{coder::Variances, common::*};

/// The classification loss regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossMode {
    Focal,
    CrossEntropy,
    /// Cross-entropy over positives and the hardest negatives.
    HardNegativeMined,
}

impl Default for LossMode {
    fn default() -> Self {
        Self::Focal
    }
}

/// The loss function configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The choice of classification loss.
    #[serde(default)]
    pub mode: LossMode,
    /// Negatives kept per positive under hard negative mining.
    #[serde(default = "default_neg_pos_ratio")]
    pub neg_pos_ratio: usize,
    /// Score classes with independent sigmoids instead of a softmax.
    #[serde(default = "default_use_sigmoid")]
    pub use_sigmoid: bool,
    /// Use the bounded IoU loss instead of smooth L1 for regression.
    #[serde(default)]
    pub use_iou: bool,
    #[serde(default)]
    pub focal_preset: FocalPreset,
    /// Overrides the preset gamma.
    pub focal_gamma: Option<R64>,
    /// Overrides the preset alpha.
    pub focal_alpha: Option<R64>,
    /// Per-class weights of the softmax focal loss.
    pub class_weights: Option<Vec<R64>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: LossMode::default(),
            neg_pos_ratio: default_neg_pos_ratio(),
            use_sigmoid: default_use_sigmoid(),
            use_iou: false,
            focal_preset: FocalPreset::default(),
            focal_gamma: None,
            focal_alpha: None,
            class_weights: None,
        }
    }
}

impl Config {
    pub fn ssd_loss_init(&self, num_classes: usize, variances: Variances) -> SsdLossInit {
        let Self {
            mode,
            neg_pos_ratio,
            use_sigmoid,
            use_iou,
            focal_preset,
            focal_gamma,
            focal_alpha,
            ref class_weights,
        } = *self;

        let (classification, hard_negative_mining) = match mode {
            LossMode::Focal => (ClassificationLossKind::Focal, false),
            LossMode::CrossEntropy => (ClassificationLossKind::CrossEntropy, false),
            LossMode::HardNegativeMined => (ClassificationLossKind::CrossEntropy, true),
        };
        let localization = if use_iou {
            LocalizationLossKind::BoundedIou
        } else {
            LocalizationLossKind::SmoothL1
        };

        SsdLossInit {
            num_classes,
            classification,
            hard_negative_mining,
            neg_pos_ratio,
            use_sigmoid,
            localization,
            focal_preset,
            focal_gamma: focal_gamma.map(R64::raw),
            focal_alpha: focal_alpha.map(R64::raw),
            class_weights: class_weights
                .as_ref()
                .map(|weights| weights.iter().map(|weight| weight.raw()).collect()),
            variances,
        }
    }
}

fn default_neg_pos_ratio() -> usize {
    3
}

fn default_use_sigmoid() -> bool {
    true
}
