use super::{
    codec::{decode_offsets, encode_offsets, Variances},
    matcher::{AnchorMatch, AnchorMatcher, AnchorMatcherInit},
    target::{Detections, EncodedTargets, LabeledBoxes},
};
use crate::{
    anchors::{AnchorCache, AnchorSet, Anchors, AnchorsInit, GridSize},
    boxes::{change_box_order, BoxOrderChange, NmsKind, NmsOutput},
    common::*,
    seq::batch_to_time,
};

#[derive(Debug, Clone)]
pub struct BoxCoderInit {
    pub anchors: AnchorsInit,
    pub fg_iou_threshold: f64,
    pub bg_iou_threshold: f64,
    /// Added to dataset labels to obtain encoded classes.
    pub label_offset: i64,
    /// Classifier width, including the background column.
    pub num_classes: usize,
    pub variances: Variances,
    pub nms: NmsKind,
    pub nms_threshold: f64,
    /// Score classes with independent sigmoids instead of a softmax.
    pub use_sigmoid: bool,
}

impl BoxCoderInit {
    pub fn new(num_classes: usize) -> Self {
        Self {
            anchors: AnchorsInit::default(),
            fg_iou_threshold: 0.5,
            bg_iou_threshold: 0.4,
            label_offset: 0,
            num_classes,
            variances: Variances::default(),
            nms: NmsKind::default(),
            nms_threshold: 0.45,
            use_sigmoid: true,
        }
    }

    pub fn build(self) -> Result<BoxCoder> {
        let Self {
            anchors,
            fg_iou_threshold,
            bg_iou_threshold,
            label_offset,
            num_classes,
            variances,
            nms,
            nms_threshold,
            use_sigmoid,
        } = self;

        variances.check()?;
        ensure!(
            (0.0..=1.0).contains(&nms_threshold),
            DetectError::InvalidConfig(format!(
                "nms_threshold must lie in [0, 1], but get {}",
                nms_threshold
            ))
        );

        let matcher = AnchorMatcherInit {
            fg_iou_threshold,
            bg_iou_threshold,
            label_offset,
            num_classes,
        }
        .build()?;

        Ok(BoxCoder {
            anchors: anchors.build()?,
            cache: AnchorCache::new(),
            matcher,
            variances,
            nms,
            nms_threshold: nms_threshold as f32,
            use_sigmoid,
        })
    }
}

/// Encodes ground truth into anchor-aligned targets and decodes raw
/// predictions into detections.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct BoxCoder {
    #[getset(get = "pub")]
    anchors: Anchors,
    #[getset(get = "pub")]
    cache: AnchorCache,
    #[getset(get = "pub")]
    matcher: AnchorMatcher,
    #[getset(get_copy = "pub")]
    variances: Variances,
    #[getset(get_copy = "pub")]
    nms: NmsKind,
    #[getset(get_copy = "pub")]
    nms_threshold: f32,
    #[getset(get_copy = "pub")]
    use_sigmoid: bool,
}

impl BoxCoder {
    pub fn num_classes(&self) -> usize {
        self.matcher.num_classes()
    }

    pub fn label_offset(&self) -> i64 {
        self.matcher.label_offset()
    }

    /// The anchor set for the given per-level grids, generated on a cache miss.
    pub fn anchor_set(&mut self, grids: &[GridSize]) -> Result<Arc<AnchorSet>> {
        let Self { anchors, cache, .. } = self;
        cache.get_or_try_insert_with(grids, || AnchorSet::new(anchors.generate(grids)?))
    }

    /// Encode one frame into `[A, 4]` offsets and `[A]` classes.
    ///
    /// Offsets of non-positive anchors are zero.
    pub fn encode_frame(
        &self,
        anchors: &AnchorSet,
        gt: &LabeledBoxes,
    ) -> Result<(Array2<f32>, Array1<i64>)> {
        let num_anchors = anchors.len();
        let (gt, matches) = self.matcher.assign(gt, anchors.xyxy())?;

        let classes: Array1<i64> = matches.iter().map(AnchorMatch::class).collect();
        let positives: Vec<(usize, usize)> = matches
            .iter()
            .enumerate()
            .filter_map(|(anchor_index, anchor_match)| match *anchor_match {
                AnchorMatch::Positive { gt_index, .. } => Some((anchor_index, gt_index)),
                _ => None,
            })
            .collect();

        let mut offsets = Array2::zeros((num_anchors, 4));
        if positives.is_empty() {
            return Ok((offsets, classes));
        }

        let (anchor_indexes, gt_indexes): (Vec<_>, Vec<_>) = positives.into_iter().unzip();
        let pos_anchors = anchors.cxcywh().select(Axis(0), &anchor_indexes);
        let pos_boxes = change_box_order(
            &gt.boxes().select(Axis(0), &gt_indexes),
            BoxOrderChange::CornerToCenter,
        )?;
        let pos_offsets = encode_offsets(&pos_anchors, &pos_boxes, self.variances)?;

        izip!(&anchor_indexes, pos_offsets.outer_iter()).for_each(|(&anchor_index, offset)| {
            offsets.row_mut(anchor_index).assign(&offset);
        });

        Ok((offsets, classes))
    }

    /// Encode a batch of frames into `[N, A, 4]` offsets and `[N, A]` classes.
    pub fn encode(&mut self, grids: &[GridSize], targets: &[LabeledBoxes]) -> Result<EncodedTargets> {
        let anchors = self.anchor_set(grids)?;
        let num_anchors = anchors.len();
        let num_frames = targets.len();

        let mut loc = Array3::zeros((num_frames, num_anchors, 4));
        let mut cls = Array2::zeros((num_frames, num_anchors));

        izip!(targets, loc.outer_iter_mut(), cls.outer_iter_mut()).try_for_each(
            |(gt, mut loc, mut cls)| -> Result<()> {
                let (offsets, classes) = self.encode_frame(&anchors, gt)?;
                loc.assign(&offsets);
                cls.assign(&classes);
                Ok(())
            },
        )?;

        Ok(EncodedTargets { loc, cls })
    }

    /// Encode targets indexed `[time][batch]` in time-major order, so that row
    /// `t * B + b` holds frame `b` at step `t`.
    pub fn encode_sequence(
        &mut self,
        grids: &[GridSize],
        targets: &[Vec<LabeledBoxes>],
    ) -> Result<EncodedTargets> {
        let batch_size = targets.first().map(|step| step.len()).unwrap_or(0);
        ensure!(
            targets.iter().all(|step| step.len() == batch_size),
            DetectError::InvalidConfig(
                "every time step must carry the same number of frames".into()
            )
        );
        let frames: Vec<LabeledBoxes> = targets.iter().flatten().cloned().collect();
        self.encode(grids, &frames)
    }

    /// Decode one frame of `[A, 4]` offsets and `[A, C]` class logits.
    ///
    /// Every non-background class column is thresholded with a strict
    /// `score > score_threshold` and suppressed independently. Output labels
    /// are column indexes minus the label offset. Returns `None` when nothing
    /// survives.
    pub fn decode_frame<S1, S2>(
        &self,
        anchors: &AnchorSet,
        loc_preds: &ArrayBase<S1, Ix2>,
        cls_preds: &ArrayBase<S2, Ix2>,
        score_threshold: f32,
    ) -> Result<Option<Detections>>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
    {
        let num_anchors = anchors.len();
        let num_classes = self.num_classes();
        ensure!(
            loc_preds.dim() == (num_anchors, 4),
            DetectError::shape("loc_preds", [num_anchors, 4], loc_preds.shape())
        );
        ensure!(
            cls_preds.dim() == (num_anchors, num_classes),
            DetectError::shape("cls_preds", [num_anchors, num_classes], cls_preds.shape())
        );

        let boxes = change_box_order(
            &decode_offsets(anchors.cxcywh(), loc_preds, self.variances)?,
            BoxOrderChange::CenterToCorner,
        )?;
        let probs = if self.use_sigmoid {
            cls_preds.sigmoid()
        } else {
            cls_preds.softmax_axis(Axis(1))
        };

        let mut out_boxes: Vec<f32> = vec![];
        let mut out_labels: Vec<i64> = vec![];
        let mut out_scores: Vec<f32> = vec![];

        for column in 1..num_classes {
            let scores = probs.column(column);
            let candidates: Vec<usize> = scores
                .indexed_iter()
                .filter(|&(_, &score)| score > score_threshold)
                .map(|(index, _)| index)
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let cand_boxes = boxes.select(Axis(0), &candidates);
            let cand_scores = scores.select(Axis(0), &candidates);
            let NmsOutput { indices, scores } =
                self.nms
                    .suppress(&cand_boxes, &cand_scores, self.nms_threshold)?;

            let label = column as i64 - self.label_offset();
            izip!(indices, scores).for_each(|(index, score)| {
                out_boxes.extend(cand_boxes.row(index).iter());
                out_labels.push(label);
                out_scores.push(score);
            });
        }

        if out_labels.is_empty() {
            return Ok(None);
        }

        Ok(Some(Detections {
            boxes: Array2::from_shape_vec((out_labels.len(), 4), out_boxes)?,
            labels: Array1::from(out_labels),
            scores: Array1::from(out_scores),
        }))
    }

    /// Decode a batch of `[N, A, 4]` offsets and `[N, A, C]` class logits.
    pub fn decode<S1, S2>(
        &mut self,
        grids: &[GridSize],
        loc_preds: &ArrayBase<S1, Ix3>,
        cls_preds: &ArrayBase<S2, Ix3>,
        score_threshold: f32,
    ) -> Result<Vec<Option<Detections>>>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
    {
        ensure!(
            loc_preds.len_of(Axis(0)) == cls_preds.len_of(Axis(0)),
            DetectError::shape(
                "cls_preds batch",
                loc_preds.len_of(Axis(0)),
                cls_preds.len_of(Axis(0))
            )
        );
        let anchors = self.anchor_set(grids)?;

        izip!(loc_preds.outer_iter(), cls_preds.outer_iter())
            .map(|(loc, cls)| self.decode_frame(&anchors, &loc, &cls, score_threshold))
            .collect()
    }

    /// Decode time-major predictions of `[T * B, A, ..]` into `[T][B]` results.
    pub fn decode_sequence<S1, S2>(
        &mut self,
        grids: &[GridSize],
        loc_preds: &ArrayBase<S1, Ix3>,
        cls_preds: &ArrayBase<S2, Ix3>,
        batch_size: usize,
        score_threshold: f32,
    ) -> Result<Vec<Vec<Option<Detections>>>>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
    {
        let loc_preds = batch_to_time(loc_preds, batch_size)?.into_dimensionality::<Ix4>()?;
        let cls_preds = batch_to_time(cls_preds, batch_size)?.into_dimensionality::<Ix4>()?;
        ensure!(
            loc_preds.len_of(Axis(0)) == cls_preds.len_of(Axis(0)),
            DetectError::shape(
                "cls_preds time steps",
                loc_preds.len_of(Axis(0)),
                cls_preds.len_of(Axis(0))
            )
        );

        izip!(loc_preds.outer_iter(), cls_preds.outer_iter())
            .map(|(loc, cls)| self.decode(grids, &loc, &cls, score_threshold))
            .collect()
    }
}
