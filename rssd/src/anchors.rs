//! Multi-scale, multi-aspect default boxes laid over feature-map grids.
//!
//! The concatenated anchor set is ordered by pyramid level, then grid row,
//! grid column and finally anchor index within the cell. Within a cell the
//! anchors are ratio-major: index `k` uses `ratios[k / S]` and `scales[k % S]`
//! where `S` is the number of scales. Encoded targets are positionally aligned
//! to this ordering.

use crate::{
    boxes::{change_box_order, BoxOrderChange},
    common::*,
};

/// Spatial size of a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    pub h: usize,
    pub w: usize,
}

impl GridSize {
    pub fn new(h: usize, w: usize) -> Self {
        Self { h, w }
    }

    /// Read the spatial size from the two trailing axes of a feature map,
    /// e.g. `[batch, channels, height, width]`.
    pub fn of_feature_map<A, S, D>(feature: &ArrayBase<S, D>) -> Result<Self>
    where
        S: Data<Elem = A>,
        D: Dimension,
    {
        let shape = feature.shape();
        ensure!(
            shape.len() >= 2,
            DetectError::shape("feature map", "[.., height, width]", shape)
        );
        let h = shape[shape.len() - 2];
        let w = shape[shape.len() - 1];
        Ok(Self { h, w })
    }

    pub fn num_cells(&self) -> usize {
        self.h * self.w
    }
}

/// Default boxes of a single pyramid level.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct AnchorLayer {
    #[getset(get_copy = "pub")]
    stride: f32,
    #[getset(get_copy = "pub")]
    box_size: f32,
    /// `[w, h]` of every anchor in a cell.
    #[getset(get = "pub")]
    box_sizes: Vec<[f32; 2]>,
}

impl AnchorLayer {
    pub fn new(box_size: f64, stride: f64, ratios: &[f64], scales: &[f64]) -> Result<Self> {
        ensure!(
            box_size > 0.0 && stride > 0.0,
            DetectError::InvalidConfig(format!(
                "box size ({}) and stride ({}) must be positive",
                box_size, stride
            ))
        );
        ensure!(
            !ratios.is_empty() && !scales.is_empty(),
            DetectError::InvalidConfig("ratios and scales must not be empty".into())
        );
        ensure!(
            ratios.iter().chain(scales).all(|&value| value > 0.0),
            DetectError::InvalidConfig("ratios and scales must be positive".into())
        );

        Ok(Self {
            stride: stride as f32,
            box_size: box_size as f32,
            box_sizes: Self::box_sizes_for(box_size, ratios, scales),
        })
    }

    /// Anchor sizes with `w * h = (box_size * scale)^2` and `h / w = ratio`.
    pub fn box_sizes_for(box_size: f64, ratios: &[f64], scales: &[f64]) -> Vec<[f32; 2]> {
        iproduct!(ratios, scales)
            .map(|(&ratio, &scale)| {
                let side = box_size * scale;
                let area = side * side;
                let w = (area / ratio).sqrt();
                let h = w * ratio;
                [w as f32, h as f32]
            })
            .collect()
    }

    pub fn num_anchors(&self) -> usize {
        self.box_sizes.len()
    }

    /// Anchors of one grid in `(cx, cy, w, h)` form, shaped `[h * w * num_anchors, 4]`.
    pub fn make_anchors(&self, grid: GridSize) -> Array2<f32> {
        let GridSize { h, w } = grid;
        let stride = self.stride;
        let mut anchors = Array2::zeros((h * w * self.num_anchors(), 4));

        iproduct!(0..h, 0..w, &self.box_sizes)
            .zip(anchors.outer_iter_mut())
            .for_each(|((row, col, &[bw, bh]), mut anchor)| {
                let cx = (col as f32 + 0.5) * stride;
                let cy = (row as f32 + 0.5) * stride;
                anchor.assign(&aview1(&[cx, cy, bw, bh]));
            });

        anchors
    }
}

/// Anchor generator initializer.
#[derive(Debug, Clone)]
pub struct AnchorsInit {
    pub pyramid_levels: Vec<u32>,
    /// Per-level strides, `2^level` if unset.
    pub strides: Option<Vec<f64>>,
    pub base_size: f64,
    /// Per-level base box sizes, `base_size * 2^i` if unset.
    pub sizes: Option<Vec<f64>>,
    pub ratios: Vec<f64>,
    pub scales: Vec<f64>,
}

impl Default for AnchorsInit {
    fn default() -> Self {
        Self {
            pyramid_levels: vec![3, 4, 5, 6],
            strides: None,
            base_size: 32.0,
            sizes: None,
            ratios: vec![0.5, 1.0, 2.0],
            scales: vec![1.0, 2f64.powf(1.0 / 3.0), 2f64.powf(2.0 / 3.0)],
        }
    }
}

impl AnchorsInit {
    pub fn build(self) -> Result<Anchors> {
        let Self {
            pyramid_levels,
            strides,
            base_size,
            sizes,
            ratios,
            scales,
        } = self;

        let num_levels = pyramid_levels.len();
        ensure!(
            num_levels > 0,
            DetectError::InvalidConfig("pyramid_levels must not be empty".into())
        );

        let strides = strides.unwrap_or_else(|| {
            pyramid_levels
                .iter()
                .map(|&level| 2f64.powi(level as i32))
                .collect()
        });
        let sizes = sizes.unwrap_or_else(|| {
            (0..num_levels)
                .map(|index| base_size * 2f64.powi(index as i32))
                .collect()
        });
        ensure!(
            strides.len() == num_levels && sizes.len() == num_levels,
            DetectError::InvalidConfig(format!(
                "expect {} strides and sizes, but get {} strides and {} sizes",
                num_levels,
                strides.len(),
                sizes.len()
            ))
        );

        let layers: Vec<_> = izip!(sizes, strides)
            .map(|(size, stride)| AnchorLayer::new(size, stride, &ratios, &scales))
            .collect::<Result<_>>()?;

        Ok(Anchors {
            layers,
            num_anchors: ratios.len() * scales.len(),
        })
    }
}

/// The anchor generator over all pyramid levels.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct Anchors {
    #[getset(get = "pub")]
    layers: Vec<AnchorLayer>,
    /// The number of anchors per grid cell, equal on every level.
    #[getset(get_copy = "pub")]
    num_anchors: usize,
}

impl Anchors {
    pub fn num_levels(&self) -> usize {
        self.layers.len()
    }

    /// Total anchor count for the given per-level grids.
    pub fn total_anchors(&self, grids: &[GridSize]) -> Result<usize> {
        self.check_grids(grids)?;
        Ok(grids.iter().map(GridSize::num_cells).sum::<usize>() * self.num_anchors)
    }

    /// Generate the concatenated anchor set in `(cx, cy, w, h)` form.
    pub fn generate(&self, grids: &[GridSize]) -> Result<Array2<f32>> {
        self.check_grids(grids)?;

        let per_level: Vec<_> = izip!(&self.layers, grids)
            .map(|(layer, &grid)| layer.make_anchors(grid))
            .collect();
        let views: Vec<_> = per_level.iter().map(|anchors| anchors.view()).collect();
        let anchors = ndarray::concatenate(Axis(0), &views)?;
        Ok(anchors)
    }

    fn check_grids(&self, grids: &[GridSize]) -> Result<()> {
        ensure!(
            grids.len() == self.layers.len(),
            DetectError::shape("feature pyramid levels", self.layers.len(), grids.len())
        );
        Ok(())
    }
}

/// A generated anchor set in both box conventions.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct AnchorSet {
    /// `(cx, cy, w, h)` rows.
    #[getset(get = "pub")]
    cxcywh: Array2<f32>,
    /// `(x1, y1, x2, y2)` rows.
    #[getset(get = "pub")]
    xyxy: Array2<f32>,
}

impl AnchorSet {
    pub fn new(cxcywh: Array2<f32>) -> Result<Self> {
        let xyxy = change_box_order(&cxcywh, BoxOrderChange::CenterToCorner)?;
        Ok(Self { cxcywh, xyxy })
    }

    pub fn len(&self) -> usize {
        self.cxcywh.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-slot anchor cache keyed by the per-level grid sizes.
///
/// A lookup with a different key regenerates and replaces the entry. The cache
/// is mutated through `&mut self`, so sharing it between threads requires an
/// external lock around the whole lookup.
#[derive(Debug, Clone, Default, CopyGetters)]
pub struct AnchorCache {
    entry: Option<(Vec<GridSize>, Arc<AnchorSet>)>,
    #[getset(get_copy = "pub")]
    hits: usize,
    #[getset(get_copy = "pub")]
    misses: usize,
}

impl AnchorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, grids: &[GridSize]) -> Option<Arc<AnchorSet>> {
        self.entry
            .as_ref()
            .filter(|(key, _)| key.as_slice() == grids)
            .map(|(_, anchors)| anchors.clone())
    }

    pub fn get_or_try_insert_with<F>(&mut self, grids: &[GridSize], generate: F) -> Result<Arc<AnchorSet>>
    where
        F: FnOnce() -> Result<AnchorSet>,
    {
        if let Some(anchors) = self.get(grids) {
            self.hits += 1;
            return Ok(anchors);
        }

        debug!("regenerate anchors for grids {:?}", grids);
        let anchors = Arc::new(generate()?);
        self.entry = Some((grids.to_vec(), anchors.clone()));
        self.misses += 1;
        Ok(anchors)
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn single_level_layout() -> Result<()> {
        let anchors = AnchorsInit {
            pyramid_levels: vec![3],
            base_size: 24.0,
            ratios: vec![1.0],
            scales: vec![1.0, 1.5],
            ..Default::default()
        }
        .build()?;
        let layer = &anchors.layers()[0];
        assert_eq!(layer.stride(), 8.0);
        assert_eq!(layer.box_sizes(), &vec![[24.0, 24.0], [36.0, 36.0]]);

        let boxes = anchors.generate(&[GridSize::new(8, 8)])?;
        assert_eq!(boxes.dim(), (128, 4));

        iproduct!(0..8, 0..8, 0..2).zip(boxes.outer_iter()).for_each(
            |((j, k, a), anchor)| {
                assert_eq!(anchor[0], 4.0 + 8.0 * k as f32);
                assert_eq!(anchor[1], 4.0 + 8.0 * j as f32);
                assert_eq!(anchor[2], [24.0, 36.0][a]);
                assert_eq!(anchor[3], [24.0, 36.0][a]);
            },
        );
        Ok(())
    }

    #[test]
    fn box_sizes_preserve_area() {
        let ratios = [0.5, 1.0, 2.0];
        let scales = [1.0, 2f64.powf(0.5)];
        let sizes = AnchorLayer::box_sizes_for(32.0, &ratios, &scales);
        assert_eq!(sizes.len(), 6);

        iproduct!(&ratios, &scales)
            .zip(&sizes)
            .for_each(|((&ratio, &scale), &[w, h])| {
                let side = 32.0 * scale;
                assert_abs_diff_eq!((w * h) as f64, side * side, epsilon = 1e-2);
                assert_abs_diff_eq!((h / w) as f64, ratio, epsilon = 1e-5);
            });
    }

    #[test]
    fn default_pyramid() -> Result<()> {
        let anchors = AnchorsInit::default().build()?;
        assert_eq!(anchors.num_levels(), 4);
        assert_eq!(anchors.num_anchors(), 9);

        let strides: Vec<_> = anchors.layers().iter().map(|layer| layer.stride()).collect();
        let sizes: Vec<_> = anchors.layers().iter().map(|layer| layer.box_size()).collect();
        assert_eq!(strides, vec![8.0, 16.0, 32.0, 64.0]);
        assert_eq!(sizes, vec![32.0, 64.0, 128.0, 256.0]);

        let grids = [
            GridSize::new(32, 32),
            GridSize::new(16, 16),
            GridSize::new(8, 8),
            GridSize::new(4, 4),
        ];
        let boxes = anchors.generate(&grids)?;
        let expect = (32 * 32 + 16 * 16 + 8 * 8 + 4 * 4) * 9;
        assert_eq!(boxes.nrows(), expect);
        assert_eq!(anchors.total_anchors(&grids)?, expect);

        // the first anchor of the second level follows the last one of the first level
        let first = boxes.row(32 * 32 * 9);
        assert_eq!(first[0], 8.0);
        assert_eq!(first[1], 8.0);
        Ok(())
    }

    #[test]
    fn mismatched_levels_are_rejected() -> Result<()> {
        let result = AnchorsInit {
            strides: Some(vec![8.0, 16.0]),
            ..Default::default()
        }
        .build();
        assert!(matches!(
            result.unwrap_err().downcast_ref::<DetectError>(),
            Some(DetectError::InvalidConfig(_))
        ));

        let anchors = AnchorsInit::default().build()?;
        let err = anchors.generate(&[GridSize::new(4, 4)]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetectError>(),
            Some(DetectError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn cache_regenerates_on_key_change() -> Result<()> {
        let anchors = AnchorsInit::default().build()?;
        let mut cache = AnchorCache::new();
        let small = [GridSize::new(4, 4); 4];
        let large = [GridSize::new(8, 8); 4];
        let generate = |grids: &[GridSize]| AnchorSet::new(anchors.generate(grids)?);

        let first = cache.get_or_try_insert_with(&small, || generate(&small))?;
        let second = cache.get_or_try_insert_with(&small, || generate(&small))?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        let other = cache.get_or_try_insert_with(&large, || generate(&large))?;
        assert_eq!(other.len(), 4 * 64 * 9);
        assert_eq!((cache.hits(), cache.misses()), (1, 2));
        assert!(cache.get(&small).is_none());

        let cold = generate(&large)?;
        assert_eq!(*other, cold);
        Ok(())
    }

    #[test]
    fn grid_size_from_feature_map() -> Result<()> {
        let feature = Array4::<f32>::zeros((2, 16, 5, 7));
        assert_eq!(GridSize::of_feature_map(&feature)?, GridSize::new(5, 7));
        assert!(GridSize::of_feature_map(&Array1::<f32>::zeros(3)).is_err());
        Ok(())
    }
}
