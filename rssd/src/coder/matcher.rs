use super::target::LabeledBoxes;
use crate::{boxes::box_iou, common::*};

/// The outcome of matching ground truth to one anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorMatch {
    Background,
    Ignored,
    Positive {
        /// Index into the frame's non-degenerate ground truth.
        gt_index: usize,
        /// Encoded class, `label + label_offset`.
        class: i64,
    },
}

impl AnchorMatch {
    /// The class target: `-1` ignored, `0` background, positive for objects.
    pub fn class(&self) -> i64 {
        match *self {
            Self::Background => 0,
            Self::Ignored => -1,
            Self::Positive { class, .. } => class,
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Positive { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AnchorMatcherInit {
    pub fg_iou_threshold: f64,
    pub bg_iou_threshold: f64,
    pub label_offset: i64,
    /// Classifier width, including the background column.
    pub num_classes: usize,
}

impl AnchorMatcherInit {
    pub fn build(self) -> Result<AnchorMatcher> {
        let Self {
            fg_iou_threshold,
            bg_iou_threshold,
            label_offset,
            num_classes,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&fg_iou_threshold) && (0.0..=1.0).contains(&bg_iou_threshold),
            DetectError::InvalidConfig(format!(
                "IoU thresholds must lie in [0, 1], but get fg={} bg={}",
                fg_iou_threshold, bg_iou_threshold
            ))
        );
        ensure!(
            fg_iou_threshold >= bg_iou_threshold,
            DetectError::InvalidThreshold {
                fg: fg_iou_threshold,
                bg: bg_iou_threshold,
            }
        );
        ensure!(
            label_offset >= 0,
            DetectError::InvalidConfig(format!(
                "label_offset must be non-negative, but get {}",
                label_offset
            ))
        );
        ensure!(
            num_classes >= 2,
            DetectError::InvalidConfig(format!(
                "num_classes must include background and at least one object class, but get {}",
                num_classes
            ))
        );

        Ok(AnchorMatcher {
            fg_iou_threshold: fg_iou_threshold as f32,
            bg_iou_threshold: bg_iou_threshold as f32,
            label_offset,
            num_classes,
        })
    }
}

/// Assigns every anchor to background, ignored or a ground truth box.
#[derive(Debug, Clone, CopyGetters)]
pub struct AnchorMatcher {
    #[getset(get_copy = "pub")]
    fg_iou_threshold: f32,
    #[getset(get_copy = "pub")]
    bg_iou_threshold: f32,
    #[getset(get_copy = "pub")]
    label_offset: i64,
    #[getset(get_copy = "pub")]
    num_classes: usize,
}

impl AnchorMatcher {
    /// Match one frame.
    ///
    /// Each anchor takes its best-overlapping box (the first on ties). Anchors
    /// with IoU at least `fg_iou_threshold` are positive, below
    /// `bg_iou_threshold` background, and ignored in between. The best anchor
    /// of every box is forced positive regardless of thresholds. Zero-area
    /// boxes are dropped first, so `gt_index` refers to the filtered boxes
    /// returned alongside.
    pub fn assign<S>(
        &self,
        gt: &LabeledBoxes,
        anchors_xyxy: &ArrayBase<S, Ix2>,
    ) -> Result<(LabeledBoxes, Vec<AnchorMatch>)>
    where
        S: Data<Elem = f32>,
    {
        let num_anchors = anchors_xyxy.nrows();
        let gt = gt.non_degenerate();

        if gt.is_empty() {
            return Ok((gt, vec![AnchorMatch::Background; num_anchors]));
        }

        let classes: Vec<i64> = gt
            .labels()
            .iter()
            .map(|&label| -> Result<i64> {
                let class = label + self.label_offset;
                ensure!(
                    class >= 1 && (class as usize) < self.num_classes,
                    DetectError::InvalidLabel {
                        class,
                        num_classes: self.num_classes,
                    }
                );
                Ok(class)
            })
            .collect::<Result<_>>()?;

        // [num_gt, num_anchors]
        let ious = box_iou(gt.boxes(), anchors_xyxy)?;

        let mut best_gt: Vec<(usize, f32)> = ious
            .columns()
            .into_iter()
            .map(|column| first_argmax(column.iter().copied()).unwrap_or((0, 0.0)))
            .collect();
        let mut forced = vec![false; num_anchors];

        // later boxes win when they share the best anchor
        ious.outer_iter().enumerate().for_each(|(gt_index, row)| {
            if let Some((anchor_index, _)) = first_argmax(row.iter().copied()) {
                best_gt[anchor_index].0 = gt_index;
                forced[anchor_index] = true;
            }
        });

        let matches = izip!(best_gt, forced)
            .map(|((gt_index, iou), forced)| {
                if forced || iou >= self.fg_iou_threshold {
                    AnchorMatch::Positive {
                        gt_index,
                        class: classes[gt_index],
                    }
                } else if iou < self.bg_iou_threshold {
                    AnchorMatch::Background
                } else {
                    AnchorMatch::Ignored
                }
            })
            .collect();

        Ok((gt, matches))
    }
}

/// Index and value of the first maximum.
fn first_argmax(values: impl IntoIterator<Item = f32>) -> Option<(usize, f32)> {
    values
        .into_iter()
        .enumerate()
        .fold(None, |best, (index, value)| match best {
            Some((_, best_value)) if best_value >= value => best,
            _ => Some((index, value)),
        })
}
