//! Convolutional recurrent cells with caller-owned state.

mod cell;
mod conv;

pub use cell::*;
pub use conv::*;

use crate::common::*;
use rand::prelude::*;

/// Runs a recurrent cell over time-major `[T, B, C, H, W]` sequences.
#[derive(Debug, Clone)]
pub struct ConvRnn {
    cell: Cell,
}

impl ConvRnn {
    /// Build a cell with weights drawn from a seeded generator.
    pub fn new(config: &CellConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            cell: Cell::new(config, &mut rng)?,
        })
    }

    pub fn from_cell(cell: Cell) -> Self {
        Self { cell }
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    /// Step through every frame, starting from `state` or zeros.
    ///
    /// Returns the stacked hidden outputs `[T, B, hidden, H, W]` and the final
    /// state, which the caller passes to the next call to continue the sequence.
    pub fn forward_sequence<S>(
        &self,
        input: &ArrayBase<S, Ix5>,
        state: Option<CellState>,
    ) -> Result<(Array5<f32>, CellState)>
    where
        S: Data<Elem = f32>,
    {
        let steps = input.len_of(Axis(0));
        ensure!(
            steps > 0,
            DetectError::shape("sequence", "[time > 0, batch, channels, height, width]", input.shape())
        );

        let mut state = state;
        let mut outputs = Vec::with_capacity(steps);

        for frame in input.outer_iter() {
            let (output, next) = self.cell.step(frame, state.as_ref())?;
            outputs.push(output);
            state = Some(next);
        }

        let views: Vec<_> = outputs.iter().map(|output| output.view()).collect();
        let output = ndarray::stack(Axis(0), &views)?;
        let state = state.ok_or_else(|| format_err!("no state after {} steps", steps))?;

        Ok((output, state))
    }
}
