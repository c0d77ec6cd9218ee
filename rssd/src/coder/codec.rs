use crate::common::*;

/// Scaling of the regression offsets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Variances {
    pub xy: f32,
    pub wh: f32,
}

impl Default for Variances {
    fn default() -> Self {
        Self { xy: 0.1, wh: 0.2 }
    }
}

impl Variances {
    pub(crate) fn check(&self) -> Result<()> {
        ensure!(
            self.xy > 0.0 && self.wh > 0.0,
            DetectError::InvalidConfig(format!("variances must be positive, but get {:?}", self))
        );
        Ok(())
    }
}

/// Regression offsets of `boxes` relative to `anchors`, both in `(cx, cy, w, h)` form.
///
/// `dxy = (box_xy - anchor_xy) / anchor_wh / var_xy` and
/// `dwh = ln(box_wh / anchor_wh) / var_wh`.
pub fn encode_offsets<S1, S2>(
    anchors: &ArrayBase<S1, Ix2>,
    boxes: &ArrayBase<S2, Ix2>,
    variances: Variances,
) -> Result<Array2<f32>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    check_pair(anchors, boxes, "encoded boxes")?;

    let mut offsets = Array2::zeros(anchors.raw_dim());
    izip!(offsets.outer_iter_mut(), anchors.outer_iter(), boxes.outer_iter()).for_each(
        |(mut offset, anchor, bbox)| {
            let dx = (bbox[0] - anchor[0]) / anchor[2] / variances.xy;
            let dy = (bbox[1] - anchor[1]) / anchor[3] / variances.xy;
            let dw = (bbox[2] / anchor[2]).ln() / variances.wh;
            let dh = (bbox[3] / anchor[3]).ln() / variances.wh;
            offset.assign(&aview1(&[dx, dy, dw, dh]));
        },
    );
    Ok(offsets)
}

/// Inverse of [encode_offsets], producing `(cx, cy, w, h)` boxes.
pub fn decode_offsets<S1, S2>(
    anchors: &ArrayBase<S1, Ix2>,
    offsets: &ArrayBase<S2, Ix2>,
    variances: Variances,
) -> Result<Array2<f32>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    check_pair(anchors, offsets, "box offsets")?;

    let mut boxes = Array2::zeros(anchors.raw_dim());
    izip!(boxes.outer_iter_mut(), anchors.outer_iter(), offsets.outer_iter()).for_each(
        |(mut bbox, anchor, offset)| {
            let cx = offset[0] * variances.xy * anchor[2] + anchor[0];
            let cy = offset[1] * variances.xy * anchor[3] + anchor[1];
            let w = (offset[2] * variances.wh).exp() * anchor[2];
            let h = (offset[3] * variances.wh).exp() * anchor[3];
            bbox.assign(&aview1(&[cx, cy, w, h]));
        },
    );
    Ok(boxes)
}

fn check_pair<S1, S2>(
    anchors: &ArrayBase<S1, Ix2>,
    other: &ArrayBase<S2, Ix2>,
    what: &'static str,
) -> Result<()>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    ensure!(
        anchors.ncols() == 4,
        DetectError::shape("anchors", "[n, 4]", anchors.shape())
    );
    ensure!(
        other.dim() == anchors.dim(),
        DetectError::shape(what, anchors.shape(), other.shape())
    );
    Ok(())
}
