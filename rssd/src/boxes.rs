//! Batched box geometry: format conversion, pairwise IoU and non-maximum suppression.
//!
//! Box sets are `[n, 4]` arrays. The center-size convention is `(cx, cy, w, h)`
//! and the corner convention is `(x1, y1, x2, y2)`.

use crate::common::*;

/// The direction of a box format conversion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
pub enum BoxOrderChange {
    #[serde(rename = "xywh2xyxy")]
    #[strum(serialize = "xywh2xyxy")]
    CenterToCorner,
    #[serde(rename = "xyxy2xywh")]
    #[strum(serialize = "xyxy2xywh")]
    CornerToCenter,
}

/// Convert boxes along the last axis, which must have length 4.
///
/// Boxes with negative extent or NaN coordinates are rejected.
pub fn change_box_order<S, D>(boxes: &ArrayBase<S, D>, mode: BoxOrderChange) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let last = boxes
        .ndim()
        .checked_sub(1)
        .ok_or_else(|| DetectError::shape("boxes", "[.., 4]", boxes.shape()))?;
    ensure!(
        boxes.shape()[last] == 4,
        DetectError::shape("boxes", "[.., 4]", boxes.shape())
    );

    let mut output = boxes.to_owned();
    for mut lane in output.lanes_mut(Axis(last)) {
        let coords = [lane[0], lane[1], lane[2], lane[3]];
        let converted = match mode {
            BoxOrderChange::CenterToCorner => CxCyWH::try_from_cxcywh(coords)
                .with_context(|| format!("invalid center-size box {:?}", coords))?
                .xyxy(),
            BoxOrderChange::CornerToCenter => XYXY::try_from_xyxy(coords)
                .with_context(|| format!("invalid corner box {:?}", coords))?
                .cxcywh(),
        };
        lane.assign(&aview1(&converted));
    }

    Ok(output)
}

/// Pairwise IoU of two corner-form box sets, shaped `[lhs.nrows(), rhs.nrows()]`.
pub fn box_iou<S1, S2>(lhs: &ArrayBase<S1, Ix2>, rhs: &ArrayBase<S2, Ix2>) -> Result<Array2<f32>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    ensure!(
        lhs.ncols() == 4,
        DetectError::shape("lhs boxes", "[n, 4]", lhs.shape())
    );
    ensure!(
        rhs.ncols() == 4,
        DetectError::shape("rhs boxes", "[n, 4]", rhs.shape())
    );

    let lhs = corner_rects(lhs);
    let rhs = corner_rects(rhs);
    Ok(Array2::from_shape_fn((lhs.len(), rhs.len()), |(li, ri)| {
        pair_iou(&lhs[li], &rhs[ri])
    }))
}

/// Greedy non-maximum suppression.
///
/// Returns kept indices in descending score order. A box is suppressed when its
/// IoU with an already kept box reaches `iou_threshold`. Equal scores keep
/// their input order.
pub fn box_nms<S1, S2>(
    boxes: &ArrayBase<S1, Ix2>,
    scores: &ArrayBase<S2, Ix1>,
    iou_threshold: f32,
) -> Result<Vec<usize>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    check_candidates(boxes, scores)?;

    let rects = corner_rects(boxes);
    let scores: Vec<f32> = scores.to_vec();
    let order = descending_order((0..rects.len()).collect(), &scores);

    let mut suppressed = vec![false; rects.len()];
    let mut keep = vec![];

    for (pos, &li) in order.iter().enumerate() {
        if suppressed[li] {
            continue;
        }
        keep.push(li);

        for &ri in &order[(pos + 1)..] {
            if !suppressed[ri] && pair_iou(&rects[li], &rects[ri]) >= iou_threshold {
                suppressed[ri] = true;
            }
        }
    }

    Ok(keep)
}

/// Score decay applied to boxes overlapping a kept box in soft NMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SoftNmsDecay {
    /// Multiply by `1 - iou`.
    Linear,
    /// Multiply by `exp(-iou^2 / sigma)`.
    Gaussian { sigma: R64 },
    /// Multiply by a fixed factor.
    Constant { factor: R64 },
}

impl SoftNmsDecay {
    fn weight(&self, iou: f32) -> f32 {
        match *self {
            Self::Linear => 1.0 - iou,
            Self::Gaussian { sigma } => (-(iou * iou) / sigma.raw() as f32).exp(),
            Self::Constant { factor } => factor.raw() as f32,
        }
    }
}

/// Soft NMS options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftNmsParams {
    pub decay: SoftNmsDecay,
    /// Boxes whose decayed score falls below this floor are dropped.
    pub min_score: R64,
}

impl Default for SoftNmsParams {
    fn default() -> Self {
        Self {
            decay: SoftNmsDecay::Gaussian { sigma: r64(0.5) },
            min_score: r64(0.3),
        }
    }
}

/// Kept box indices and their final scores.
#[derive(Debug, Clone, PartialEq)]
pub struct NmsOutput {
    pub indices: Vec<usize>,
    pub scores: Vec<f32>,
}

/// Soft non-maximum suppression.
///
/// Picks the highest scoring remaining box, decays the scores of the
/// remaining boxes overlapping it by at least `iou_threshold`, drops boxes
/// below the floor and re-sorts. Kept scores are the decayed ones. Every
/// kept score is at least `min_score`, so candidates starting below the
/// floor are never kept.
pub fn box_soft_nms<S1, S2>(
    boxes: &ArrayBase<S1, Ix2>,
    scores: &ArrayBase<S2, Ix1>,
    iou_threshold: f32,
    params: &SoftNmsParams,
) -> Result<NmsOutput>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    check_candidates(boxes, scores)?;

    let SoftNmsParams { decay, min_score } = *params;
    let min_score = min_score.raw() as f32;
    let rects = corner_rects(boxes);
    let mut weights: Vec<f32> = scores.to_vec();
    let candidates = (0..rects.len())
        .filter(|&index| weights[index] >= min_score)
        .collect();
    let mut remaining = descending_order(candidates, &weights);

    let mut indices = vec![];
    let mut kept_scores = vec![];

    while let Some((&top, rest)) = remaining.split_first() {
        indices.push(top);
        kept_scores.push(weights[top]);

        let mut survivors = Vec::with_capacity(rest.len());
        for &index in rest {
            let iou = pair_iou(&rects[top], &rects[index]);
            if iou >= iou_threshold {
                weights[index] *= decay.weight(iou);
            }
            if weights[index] >= min_score {
                survivors.push(index);
            }
        }

        remaining = descending_order(survivors, &weights);
    }

    Ok(NmsOutput {
        indices,
        scores: kept_scores,
    })
}

/// The suppression algorithm used at inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NmsKind {
    Hard,
    Soft(SoftNmsParams),
}

impl Default for NmsKind {
    fn default() -> Self {
        Self::Soft(SoftNmsParams::default())
    }
}

impl NmsKind {
    pub fn suppress<S1, S2>(
        &self,
        boxes: &ArrayBase<S1, Ix2>,
        scores: &ArrayBase<S2, Ix1>,
        iou_threshold: f32,
    ) -> Result<NmsOutput>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
    {
        match self {
            Self::Hard => {
                let indices = box_nms(boxes, scores, iou_threshold)?;
                let scores = indices.iter().map(|&index| scores[index]).collect();
                Ok(NmsOutput { indices, scores })
            }
            Self::Soft(params) => box_soft_nms(boxes, scores, iou_threshold, params),
        }
    }
}

fn check_candidates<S1, S2>(boxes: &ArrayBase<S1, Ix2>, scores: &ArrayBase<S2, Ix1>) -> Result<()>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    ensure!(
        boxes.ncols() == 4,
        DetectError::shape("boxes", "[n, 4]", boxes.shape())
    );
    ensure!(
        boxes.nrows() == scores.len(),
        DetectError::shape("scores", [boxes.nrows()], scores.shape())
    );
    Ok(())
}

/// Degenerate or malformed rows become `None` and overlap nothing.
fn corner_rects<S>(boxes: &ArrayBase<S, Ix2>) -> Vec<Option<XYXY<f32>>>
where
    S: Data<Elem = f32>,
{
    boxes
        .rows()
        .into_iter()
        .map(|row| {
            XYXY::try_from_xyxy([row[0], row[1], row[2], row[3]])
                .ok()
                .filter(|rect| !rect.is_degenerate())
        })
        .collect()
}

fn pair_iou(lhs: &Option<XYXY<f32>>, rhs: &Option<XYXY<f32>>) -> f32 {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs.iou_with(rhs),
        _ => 0.0,
    }
}

/// Sort by descending score, breaking ties by ascending index.
fn descending_order(mut indices: Vec<usize>, scores: &[f32]) -> Vec<usize> {
    indices.sort_by(|&lhs, &rhs| {
        scores[rhs]
            .total_cmp(&scores[lhs])
            .then_with(|| lhs.cmp(&rhs))
    });
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;
    use std::str::FromStr;

    fn random_corner_boxes(rng: &mut StdRng, n: usize) -> Array2<f32> {
        let mut boxes = Array2::zeros((n, 4));
        boxes.outer_iter_mut().for_each(|mut row| {
            let x1: f32 = rng.gen_range(0.0..80.0);
            let y1: f32 = rng.gen_range(0.0..80.0);
            let w: f32 = rng.gen_range(1.0..30.0);
            let h: f32 = rng.gen_range(1.0..30.0);
            row.assign(&aview1(&[x1, y1, x1 + w, y1 + h]));
        });
        boxes
    }

    #[test]
    fn change_box_order_round_trip() -> Result<()> {
        let boxes = array![
            [[10.0f32, 20.0, 4.0, 6.0], [0.5, 0.5, 1.0, 1.0]],
            [[-3.0, 7.0, 2.0, 10.0], [100.0, 50.0, 30.0, 20.0]]
        ];
        let corner = change_box_order(&boxes, BoxOrderChange::CenterToCorner)?;
        assert_eq!(corner.shape(), &[2, 2, 4]);
        assert_eq!(corner[[0, 0, 0]], 8.0);
        assert_eq!(corner[[0, 0, 3]], 23.0);

        let back = change_box_order(&corner, BoxOrderChange::CornerToCenter)?;
        izip!(back.iter(), boxes.iter()).for_each(|(&lhs, &rhs)| {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-5);
        });
        Ok(())
    }

    #[test]
    fn change_box_order_rejects_negative_extent() {
        let boxes = array![[5.0f32, 5.0, -2.0, 4.0]];
        assert!(change_box_order(&boxes, BoxOrderChange::CenterToCorner).is_err());
        let boxes = array![[5.0f32, 5.0, 4.0, 9.0]];
        assert!(change_box_order(&boxes, BoxOrderChange::CornerToCenter).is_err());
        let boxes = array![[f32::NAN, 0.0, 1.0, 1.0]];
        assert!(change_box_order(&boxes, BoxOrderChange::CornerToCenter).is_err());
    }

    #[test]
    fn change_box_order_rejects_bad_shape() {
        let boxes = Array2::<f32>::zeros((3, 5));
        let err = change_box_order(&boxes, BoxOrderChange::CornerToCenter).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetectError>(),
            Some(DetectError::ShapeMismatch { .. })
        ));
        assert_eq!(
            BoxOrderChange::from_str("xyxy2xywh").unwrap(),
            BoxOrderChange::CornerToCenter
        );
    }

    #[test]
    fn box_iou_properties() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let lhs = random_corner_boxes(&mut rng, 16);
        let rhs = random_corner_boxes(&mut rng, 11);

        let forward = box_iou(&lhs, &rhs)?;
        let backward = box_iou(&rhs, &lhs)?;
        assert_eq!(forward.shape(), &[16, 11]);
        assert!(forward.iter().all(|&iou| (0.0..=1.0).contains(&iou)));
        izip!(forward.iter(), backward.t().iter()).for_each(|(&lhs, &rhs)| {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-6);
        });

        let own = box_iou(&lhs, &lhs)?;
        own.diag()
            .iter()
            .for_each(|&iou| assert_abs_diff_eq!(iou, 1.0, epsilon = 1e-6));
        Ok(())
    }

    #[test]
    fn box_iou_of_disjoint_and_degenerate_boxes_is_zero() -> Result<()> {
        let lhs = array![[0.0f32, 0.0, 10.0, 10.0], [5.0, 5.0, 5.0, 9.0]];
        let rhs = array![[20.0f32, 20.0, 30.0, 30.0], [0.0, 0.0, 10.0, 10.0]];
        let ious = box_iou(&lhs, &rhs)?;
        assert_eq!(ious[[0, 0]], 0.0);
        assert_eq!(ious[[0, 1]], 1.0);
        assert_eq!(ious[[1, 1]], 0.0);
        Ok(())
    }

    #[test]
    fn nms_keeps_disjoint_subset() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let boxes = random_corner_boxes(&mut rng, 64);
        let scores = Array1::from_shape_fn(64, |_| rng.gen_range(0.0f32..1.0));
        let threshold = 0.3;

        let keep = box_nms(&boxes, &scores, threshold)?;
        assert!(!keep.is_empty());
        assert!(keep.iter().all(|&index| index < 64));
        assert!(keep.iter().all_unique());

        let ious = box_iou(&boxes, &boxes)?;
        keep.iter().tuple_combinations().for_each(|(&lhs, &rhs)| {
            assert!(ious[[lhs, rhs]] < threshold);
        });
        Ok(())
    }

    #[test]
    fn nms_breaks_ties_by_index() -> Result<()> {
        let boxes = array![
            [0.0f32, 0.0, 10.0, 10.0],
            [0.0, 0.0, 10.0, 10.0],
            [1.0, 1.0, 10.0, 10.0],
            [50.0, 50.0, 60.0, 60.0]
        ];
        let scores = array![0.9f32, 0.9, 0.95, 0.1];
        let keep = box_nms(&boxes, &scores, 0.5)?;
        assert_eq!(keep, vec![2, 3]);

        let scores = array![0.9f32, 0.9, 0.5, 0.1];
        let keep = box_nms(&boxes, &scores, 0.5)?;
        assert_eq!(keep, vec![0, 3]);
        Ok(())
    }

    #[test]
    fn soft_nms_without_decay_equals_hard_nms() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(23);
        let boxes = random_corner_boxes(&mut rng, 48);
        let scores = Array1::from_shape_fn(48, |_| rng.gen_range(0.05f32..1.0));
        let params = SoftNmsParams {
            decay: SoftNmsDecay::Constant { factor: r64(0.0) },
            min_score: r64(1e-4),
        };

        let hard = box_nms(&boxes, &scores, 0.4)?;
        let soft = box_soft_nms(&boxes, &scores, 0.4, &params)?;
        assert_eq!(hard, soft.indices);
        Ok(())
    }

    #[test]
    fn soft_nms_decays_instead_of_suppressing() -> Result<()> {
        let boxes = array![[0.0f32, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 8.0]];
        let scores = array![0.9f32, 0.8];
        let params = SoftNmsParams {
            decay: SoftNmsDecay::Gaussian { sigma: r64(0.5) },
            min_score: r64(0.1),
        };

        assert_eq!(box_nms(&boxes, &scores, 0.5)?, vec![0]);

        let soft = box_soft_nms(&boxes, &scores, 0.5, &params)?;
        assert_eq!(soft.indices, vec![0, 1]);
        let expect = 0.8 * (-(0.8f32 * 0.8) / 0.5).exp();
        assert_abs_diff_eq!(soft.scores[1], expect, epsilon = 1e-6);
        assert_abs_diff_eq!(soft.scores[0], 0.9);

        let linear = SoftNmsParams {
            decay: SoftNmsDecay::Linear,
            min_score: r64(0.5),
        };
        let soft = box_soft_nms(&boxes, &scores, 0.5, &linear)?;
        assert_eq!(soft.indices, vec![0]);
        Ok(())
    }

    #[test]
    fn soft_nms_floor_applies_to_every_candidate() -> Result<()> {
        let params = SoftNmsParams {
            decay: SoftNmsDecay::Linear,
            min_score: r64(0.3),
        };

        // disjoint boxes are never decayed, so only their initial scores matter
        let disjoint = array![[0.0f32, 0.0, 10.0, 10.0], [50.0, 50.0, 60.0, 60.0]];
        let soft = box_soft_nms(&disjoint, &array![0.2f32, 0.25], 0.5, &params)?;
        assert!(soft.indices.is_empty());
        assert!(soft.scores.is_empty());

        let boxes = array![
            [0.0f32, 0.0, 10.0, 10.0],
            [50.0, 50.0, 60.0, 60.0],
            [100.0, 100.0, 110.0, 110.0]
        ];

        let soft = box_soft_nms(&boxes, &array![0.2f32, 0.9, 0.3], 0.5, &params)?;
        assert_eq!(soft.indices, vec![1, 2]);
        assert!(soft.scores.iter().all(|&score| score >= 0.3));
        Ok(())
    }

    #[test]
    fn nms_kind_serde_layout() -> Result<()> {
        assert_eq!(
            serde_json::to_value(NmsKind::Hard)?,
            serde_json::json!({ "type": "hard" })
        );
        let soft: NmsKind = serde_json::from_value(serde_json::json!({
            "type": "soft",
            "decay": { "kind": "constant", "factor": 0.5 },
            "min_score": 0.2,
        }))?;
        assert_eq!(
            soft,
            NmsKind::Soft(SoftNmsParams {
                decay: SoftNmsDecay::Constant { factor: r64(0.5) },
                min_score: r64(0.2),
            })
        );
        assert_eq!(NmsKind::default(), NmsKind::Soft(SoftNmsParams::default()));
        Ok(())
    }
}
