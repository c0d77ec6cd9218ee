use super::{
    bounded_iou::BoundedIouLoss,
    cross_entropy::CrossEntropyLoss,
    focal_loss::{FocalLoss, FocalLossInit, FocalPreset},
    hard_negative::hard_negative_mask,
    smooth_l1::smooth_l1_loss,
};
use crate::{coder::Variances, common::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationLossKind {
    Focal,
    CrossEntropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalizationLossKind {
    SmoothL1,
    BoundedIou,
}

#[derive(Debug, Clone)]
pub struct SsdLossInit {
    /// Classifier width, including the background column.
    pub num_classes: usize,
    pub classification: ClassificationLossKind,
    /// Restrict the classification loss to positives and the hardest negatives.
    pub hard_negative_mining: bool,
    pub neg_pos_ratio: usize,
    pub use_sigmoid: bool,
    pub localization: LocalizationLossKind,
    pub focal_preset: FocalPreset,
    /// Overrides the preset gamma.
    pub focal_gamma: Option<f64>,
    /// Overrides the preset alpha.
    pub focal_alpha: Option<f64>,
    pub class_weights: Option<Vec<f64>>,
    pub variances: Variances,
}

impl SsdLossInit {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            classification: ClassificationLossKind::Focal,
            hard_negative_mining: false,
            neg_pos_ratio: 3,
            use_sigmoid: true,
            localization: LocalizationLossKind::SmoothL1,
            focal_preset: FocalPreset::default(),
            focal_gamma: None,
            focal_alpha: None,
            class_weights: None,
            variances: Variances::default(),
        }
    }

    pub fn build(self) -> Result<SsdLoss> {
        let Self {
            num_classes,
            classification,
            hard_negative_mining,
            neg_pos_ratio,
            use_sigmoid,
            localization,
            focal_preset,
            focal_gamma,
            focal_alpha,
            class_weights,
            variances,
        } = self;

        ensure!(
            num_classes >= 2,
            DetectError::InvalidConfig(format!(
                "num_classes must include background and at least one object class, but get {}",
                num_classes
            ))
        );
        ensure!(
            !hard_negative_mining || neg_pos_ratio > 0,
            DetectError::InvalidConfig("neg_pos_ratio must be positive".into())
        );
        variances.check()?;

        let classification = match classification {
            ClassificationLossKind::Focal => {
                let mut init = FocalLossInit::from_preset(focal_preset, num_classes, use_sigmoid);
                if let Some(gamma) = focal_gamma {
                    init.gamma = gamma;
                }
                if let Some(alpha) = focal_alpha {
                    init.alpha = alpha;
                }
                init.class_weights = class_weights;
                ClassLoss::Focal(init.build()?)
            }
            ClassificationLossKind::CrossEntropy => {
                ClassLoss::CrossEntropy(CrossEntropyLoss::new(use_sigmoid))
            }
        };

        let localization = match localization {
            LocalizationLossKind::SmoothL1 => LocLoss::SmoothL1,
            LocalizationLossKind::BoundedIou => LocLoss::BoundedIou(BoundedIouLoss::new(variances)),
        };

        Ok(SsdLoss {
            num_classes,
            classification,
            localization,
            hard_negative_mining,
            neg_pos_ratio,
        })
    }
}

#[derive(Debug, Clone)]
enum ClassLoss {
    Focal(FocalLoss),
    CrossEntropy(CrossEntropyLoss),
}

impl ClassLoss {
    fn forward<S>(&self, logits: &ArrayBase<S, Ix1>, class: usize) -> f32
    where
        S: Data<Elem = f32>,
    {
        match self {
            Self::Focal(loss) => loss.forward(logits, class),
            Self::CrossEntropy(loss) => loss.forward(logits, class),
        }
    }
}

#[derive(Debug, Clone)]
enum LocLoss {
    SmoothL1,
    BoundedIou(BoundedIouLoss),
}

impl LocLoss {
    fn forward<S1, S2>(&self, pred: &ArrayBase<S1, Ix1>, target: &ArrayBase<S2, Ix1>) -> f32
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
    {
        match self {
            Self::SmoothL1 => smooth_l1_loss(pred, target),
            Self::BoundedIou(loss) => loss.forward(pred, target),
        }
    }
}

/// The localization and classification losses of a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsdLossOutput {
    /// Summed over positive anchors, divided by `num_positive`.
    pub loc_loss: f32,
    /// Summed over counted anchors, divided by `num_positive`.
    pub cls_loss: f32,
    pub num_positive: usize,
}

impl SsdLossOutput {
    pub fn total(&self) -> f32 {
        self.loc_loss + self.cls_loss
    }
}

/// Detection loss over encoded anchor targets.
#[derive(Debug, Clone, CopyGetters)]
pub struct SsdLoss {
    #[getset(get_copy = "pub")]
    num_classes: usize,
    classification: ClassLoss,
    localization: LocLoss,
    #[getset(get_copy = "pub")]
    hard_negative_mining: bool,
    #[getset(get_copy = "pub")]
    neg_pos_ratio: usize,
}

impl SsdLoss {
    /// Compute losses from `[N, A, 4]` offsets, `[N, A, C]` logits and `[N, A]` classes.
    ///
    /// Ignored anchors (`-1`) contribute nothing. A batch without positive
    /// anchors yields zero losses.
    pub fn forward<S1, S2, S3, S4>(
        &self,
        loc_preds: &ArrayBase<S1, Ix3>,
        loc_targets: &ArrayBase<S2, Ix3>,
        cls_preds: &ArrayBase<S3, Ix3>,
        cls_targets: &ArrayBase<S4, Ix2>,
    ) -> Result<SsdLossOutput>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
        S3: Data<Elem = f32>,
        S4: Data<Elem = i64>,
    {
        let (batch_size, num_anchors, _) = loc_preds.dim();
        ensure!(
            loc_preds.dim() == (batch_size, num_anchors, 4),
            DetectError::shape("loc_preds", [batch_size, num_anchors, 4], loc_preds.shape())
        );
        ensure!(
            loc_targets.dim() == loc_preds.dim(),
            DetectError::shape("loc_targets", loc_preds.shape(), loc_targets.shape())
        );
        ensure!(
            cls_preds.dim() == (batch_size, num_anchors, self.num_classes),
            DetectError::shape(
                "cls_preds",
                [batch_size, num_anchors, self.num_classes],
                cls_preds.shape()
            )
        );
        ensure!(
            cls_targets.dim() == (batch_size, num_anchors),
            DetectError::shape("cls_targets", [batch_size, num_anchors], cls_targets.shape())
        );
        if let Some(&class) = cls_targets
            .iter()
            .find(|&&class| class < -1 || class >= self.num_classes as i64)
        {
            bail!(DetectError::InvalidLabel {
                class,
                num_classes: self.num_classes,
            });
        }

        let num_positive = cls_targets.iter().filter(|&&class| class > 0).count();
        if num_positive == 0 {
            warn!(
                "no positive anchors among {} frames, losses are set to zero",
                batch_size
            );
            return Ok(SsdLossOutput {
                loc_loss: 0.0,
                cls_loss: 0.0,
                num_positive,
            });
        }

        let loc_sum: f64 = iproduct!(0..batch_size, 0..num_anchors)
            .filter(|&(frame, anchor)| cls_targets[[frame, anchor]] > 0)
            .map(|(frame, anchor)| {
                let pred = loc_preds.slice(s![frame, anchor, ..]);
                let target = loc_targets.slice(s![frame, anchor, ..]);
                self.localization.forward(&pred, &target) as f64
            })
            .sum();

        // ignored anchors are scored as background, then zeroed
        let mut cls_loss = Array2::from_shape_fn((batch_size, num_anchors), |(frame, anchor)| {
            let class = cls_targets[[frame, anchor]].max(0) as usize;
            self.classification
                .forward(&cls_preds.slice(s![frame, anchor, ..]), class)
        });
        Zip::from(&mut cls_loss)
            .and(cls_targets)
            .for_each(|loss, &class| {
                if class < 0 {
                    *loss = 0.0;
                }
            });

        let cls_sum: f64 = if self.hard_negative_mining {
            let negatives = hard_negative_mask(&cls_loss, cls_targets, self.neg_pos_ratio)?;
            izip!(cls_loss.iter(), cls_targets.iter(), negatives.iter())
                .filter(|&(_, &class, &negative)| class > 0 || negative)
                .map(|(&loss, _, _)| loss as f64)
                .sum()
        } else {
            cls_loss.iter().map(|&loss| loss as f64).sum()
        };

        let num_positive_f = num_positive as f64;
        debug!(
            "{} positive anchors, loc sum {:.4}, cls sum {:.4}",
            num_positive, loc_sum, cls_sum
        );

        Ok(SsdLossOutput {
            loc_loss: (loc_sum / num_positive_f) as f32,
            cls_loss: (cls_sum / num_positive_f) as f32,
            num_positive,
        })
    }
}
