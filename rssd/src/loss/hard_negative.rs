use crate::common::*;

/// Select the hardest background anchors of every batch row.
///
/// A row with `P` positives keeps its `neg_pos_ratio * P` background anchors
/// of largest loss, ties broken by anchor index. Ignored anchors are never
/// selected. The returned mask is true only on selected negatives.
pub fn hard_negative_mask<S1, S2>(
    cls_loss: &ArrayBase<S1, Ix2>,
    cls_targets: &ArrayBase<S2, Ix2>,
    neg_pos_ratio: usize,
) -> Result<Array2<bool>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = i64>,
{
    ensure!(
        cls_loss.dim() == cls_targets.dim(),
        DetectError::shape("classification loss", cls_targets.shape(), cls_loss.shape())
    );

    let mut mask = Array2::from_elem(cls_loss.raw_dim(), false);

    izip!(
        mask.outer_iter_mut(),
        cls_loss.outer_iter(),
        cls_targets.outer_iter()
    )
    .for_each(|(mut mask, loss, targets)| {
        let num_positive = targets.iter().filter(|&&class| class > 0).count();
        let mut negatives: Vec<usize> = targets
            .indexed_iter()
            .filter(|&(_, &class)| class == 0)
            .map(|(index, _)| index)
            .collect();
        negatives.sort_by(|&lhs, &rhs| loss[rhs].total_cmp(&loss[lhs]).then_with(|| lhs.cmp(&rhs)));
        negatives
            .into_iter()
            .take(num_positive * neg_pos_ratio)
            .for_each(|index| mask[index] = true);
    });

    Ok(mask)
}
