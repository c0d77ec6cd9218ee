use crate::common::*;

/// Ground truth of one frame: corner-form boxes with their dataset labels.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct LabeledBoxes {
    /// `[n, 4]` rows of `(x1, y1, x2, y2)`.
    #[getset(get = "pub")]
    boxes: Array2<f32>,
    #[getset(get = "pub")]
    labels: Array1<i64>,
}

impl LabeledBoxes {
    pub fn new(boxes: Array2<f32>, labels: Array1<i64>) -> Result<Self> {
        ensure!(
            boxes.ncols() == 4,
            DetectError::shape("ground truth boxes", "[n, 4]", boxes.shape())
        );
        ensure!(
            boxes.nrows() == labels.len(),
            DetectError::shape("ground truth labels", [boxes.nrows()], labels.shape())
        );
        boxes.outer_iter().try_for_each(|row| -> Result<()> {
            ensure!(
                row.iter().all(|value| value.is_finite()) && row[2] >= row[0] && row[3] >= row[1],
                "malformed ground truth box {}",
                row
            );
            Ok(())
        })?;

        Ok(Self { boxes, labels })
    }

    /// A frame without objects.
    pub fn empty() -> Self {
        Self {
            boxes: Array2::zeros((0, 4)),
            labels: Array1::zeros(0),
        }
    }

    /// Parse `[n, 5]` rows of `(x1, y1, x2, y2, label)`.
    pub fn from_rows<S>(rows: &ArrayBase<S, Ix2>) -> Result<Self>
    where
        S: Data<Elem = f32>,
    {
        ensure!(
            rows.ncols() == 5,
            DetectError::shape("ground truth rows", "[n, 5]", rows.shape())
        );
        let boxes = rows.slice(s![.., 0..4]).to_owned();
        let labels = rows
            .column(4)
            .iter()
            .map(|&label| -> Result<i64> {
                ensure!(label.is_finite(), "non-finite ground truth label {}", label);
                Ok(label.round() as i64)
            })
            .collect::<Result<Array1<_>>>()?;
        Self::new(boxes, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Drop boxes with zero width or height.
    pub(crate) fn non_degenerate(&self) -> Self {
        let keep: Vec<usize> = self
            .boxes
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| row[2] > row[0] && row[3] > row[1])
            .map(|(index, _)| index)
            .collect();

        if keep.len() == self.len() {
            return self.clone();
        }
        debug!(
            "drop {} zero-area ground truth boxes",
            self.len() - keep.len()
        );
        Self {
            boxes: self.boxes.select(Axis(0), &keep),
            labels: self.labels.select(Axis(0), &keep),
        }
    }
}

impl TryFrom<Array2<f32>> for LabeledBoxes {
    type Error = Error;

    fn try_from(rows: Array2<f32>) -> Result<Self, Self::Error> {
        Self::from_rows(&rows)
    }
}

/// Training targets positionally aligned with the anchor set.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTargets {
    /// `[N, A, 4]` regression offsets, zero on non-positive anchors.
    pub loc: Array3<f32>,
    /// `[N, A]` classes: `-1` ignored, `0` background, positive for objects.
    pub cls: Array2<i64>,
}

impl EncodedTargets {
    pub fn num_positive(&self) -> usize {
        self.cls.iter().filter(|&&class| class > 0).count()
    }

    pub fn num_ignored(&self) -> usize {
        self.cls.iter().filter(|&&class| class < 0).count()
    }
}

/// Surviving detections of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detections {
    /// `[n, 4]` rows of `(x1, y1, x2, y2)`.
    pub boxes: Array2<f32>,
    /// Dataset labels.
    pub labels: Array1<i64>,
    pub scores: Array1<f32>,
}

impl Detections {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rows() -> Result<()> {
        let rows = array![[10.0f32, 10.0, 50.0, 50.0, 3.0], [0.0, 0.0, 0.0, 8.0, 1.0]];
        let gt = LabeledBoxes::try_from(rows)?;
        assert_eq!(gt.len(), 2);
        assert_eq!(gt.labels(), &array![3, 1]);

        let kept = gt.non_degenerate();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.boxes().row(0), aview1(&[10.0f32, 10.0, 50.0, 50.0]));
        Ok(())
    }

    #[test]
    fn reject_malformed_rows() {
        assert!(LabeledBoxes::from_rows(&Array2::<f32>::zeros((2, 4))).is_err());
        assert!(LabeledBoxes::from_rows(&array![[5.0f32, 0.0, 1.0, 4.0, 0.0]]).is_err());
        assert!(LabeledBoxes::from_rows(&array![[0.0f32, 0.0, 1.0, 4.0, f32::NAN]]).is_err());
        assert!(LabeledBoxes::empty().is_empty());
    }
}
