//! Reshaping between time-major sequences `[T, B, ..]` and flat batches `[T * B, ..]`.

use crate::common::*;

/// Merge the two leading axes. Returns the flattened array and the batch size `B`.
pub fn time_to_batch<A, S, D>(x: &ArrayBase<S, D>) -> Result<(ArrayD<A>, usize)>
where
    A: Clone,
    S: Data<Elem = A>,
    D: Dimension,
{
    let shape = x.shape();
    ensure!(
        shape.len() >= 2,
        DetectError::shape("sequence", "[time, batch, ..]", shape)
    );

    let (steps, batch_size) = (shape[0], shape[1]);
    let flat_shape: Vec<usize> = iter::once(steps * batch_size)
        .chain(shape[2..].iter().copied())
        .collect();
    let flat = x
        .as_standard_layout()
        .into_owned()
        .into_dyn()
        .into_shape(IxDyn(&flat_shape))?;

    Ok((flat, batch_size))
}

/// Split the leading axis into `[T, batch_size]`.
pub fn batch_to_time<A, S, D>(x: &ArrayBase<S, D>, batch_size: usize) -> Result<ArrayD<A>>
where
    A: Clone,
    S: Data<Elem = A>,
    D: Dimension,
{
    let shape = x.shape();
    ensure!(
        !shape.is_empty(),
        DetectError::shape("batch", "[time * batch, ..]", shape)
    );
    ensure!(
        batch_size > 0 && shape[0] % batch_size == 0,
        DetectError::shape(
            "batch",
            format!("leading axis divisible by {}", batch_size),
            shape
        )
    );

    let time_shape: Vec<usize> = [shape[0] / batch_size, batch_size]
        .into_iter()
        .chain(shape[1..].iter().copied())
        .collect();
    let time = x
        .as_standard_layout()
        .into_owned()
        .into_dyn()
        .into_shape(IxDyn(&time_shape))?;

    Ok(time)
}

/// Apply a per-frame function over every frame of a sequence.
///
/// The function receives `[T * B, ..]` and its output is reshaped back to `[T, B, ..]`.
pub fn sequence_wise<A, B, S, D, F>(x: &ArrayBase<S, D>, f: F) -> Result<ArrayD<B>>
where
    A: Clone,
    B: Clone,
    S: Data<Elem = A>,
    D: Dimension,
    F: FnOnce(ArrayD<A>) -> Result<ArrayD<B>>,
{
    let (flat, batch_size) = time_to_batch(x)?;
    let output = f(flat)?;
    batch_to_time(&output, batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_is_time_major() -> Result<()> {
        let x = Array::from_shape_fn((3, 2, 4), |(t, b, c)| (t * 100 + b * 10 + c) as f32);
        let (flat, batch_size) = time_to_batch(&x)?;
        assert_eq!(batch_size, 2);
        assert_eq!(flat.shape(), &[6, 4]);
        // row t * B + b holds frame b at step t
        assert_eq!(flat[[5, 3]], 213.0);
        assert_eq!(flat[[2, 0]], 100.0);

        let back = batch_to_time(&flat, batch_size)?;
        assert_eq!(back, x.into_dyn());
        Ok(())
    }

    #[test]
    fn non_contiguous_input() -> Result<()> {
        let x = Array::from_shape_fn((2, 3, 5), |(a, b, c)| (a * 100 + b * 10 + c) as f32);
        let transposed = x.view().permuted_axes([1, 0, 2]);
        let (flat, batch_size) = time_to_batch(&transposed)?;
        assert_eq!(batch_size, 2);
        assert_eq!(flat[[1, 4]], 104.0);
        assert_eq!(flat[[2, 0]], 10.0);
        Ok(())
    }

    #[test]
    fn reject_bad_shapes() {
        assert!(time_to_batch(&Array1::<f32>::zeros(4)).is_err());
        assert!(batch_to_time(&Array2::<f32>::zeros((5, 2)), 2).is_err());
        assert!(batch_to_time(&Array2::<f32>::zeros((4, 2)), 0).is_err());
    }

    #[test]
    fn per_frame_function() -> Result<()> {
        let x = Array::from_shape_fn((2, 3, 4), |(t, b, c)| (t + b + c) as f32);
        let summed = sequence_wise(&x, |flat| {
            Ok(flat.sum_axis(Axis(1)).into_dyn())
        })?;
        assert_eq!(summed.shape(), &[2, 3]);
        assert_eq!(summed[[1, 2]], (3 + 4 + 5 + 6) as f32);
        Ok(())
    }
}
