use super::conv::{Conv2d, Conv2dInit};
use crate::common::*;
use rand::prelude::*;

/// The recurrent cell family.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CellKind {
    ConvLstm,
    ConvGru,
}

/// Recurrent cell configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfig {
    pub kind: CellKind,
    pub in_channels: usize,
    pub hidden_channels: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    /// Use piecewise-linear gates.
    #[serde(default)]
    pub hard: bool,
}

fn default_kernel_size() -> usize {
    3
}

/// Recurrent state, owned and threaded by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum CellState {
    Lstm { h: Array4<f32>, c: Array4<f32> },
    Gru { h: Array4<f32> },
}

impl CellState {
    /// The hidden state `[batch, hidden, height, width]`.
    pub fn hidden(&self) -> &Array4<f32> {
        match self {
            Self::Lstm { h, .. } => h,
            Self::Gru { h } => h,
        }
    }

    pub fn kind(&self) -> CellKind {
        match self {
            Self::Lstm { .. } => CellKind::ConvLstm,
            Self::Gru { .. } => CellKind::ConvGru,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.hidden().len_of(Axis(0))
    }

    /// A copy cut from the history that produced it, the truncation point of
    /// back-propagation through time.
    pub fn detach(&self) -> Self {
        self.clone()
    }

    /// Zero the state of batch elements whose mask entry is true, e.g. at
    /// sequence boundaries.
    pub fn reset_where(&mut self, mask: &[bool]) -> Result<()> {
        let batch_size = self.batch_size();
        ensure!(
            mask.len() == batch_size,
            DetectError::shape("reset mask", [batch_size], [mask.len()])
        );

        let clear = |array: &mut Array4<f32>| {
            izip!(array.outer_iter_mut(), mask)
                .filter(|(_, reset)| **reset)
                .for_each(|(mut state, _)| state.fill(0.0));
        };
        match self {
            Self::Lstm { h, c } => {
                clear(h);
                clear(c);
            }
            Self::Gru { h } => clear(h),
        }
        Ok(())
    }
}

/// A convolutional recurrent cell stepping one frame at a time.
pub trait RecurrentCell {
    fn kind(&self) -> CellKind;

    fn hidden_channels(&self) -> usize;

    fn zero_state(&self, batch_size: usize, height: usize, width: usize) -> CellState;

    /// Advance by one frame `[batch, in_channels, height, width]`.
    ///
    /// A missing state starts from zeros. Returns the output, which is the new
    /// hidden state, together with the next state.
    fn step(&self, input: ArrayView4<f32>, prev: Option<&CellState>) -> Result<(Array4<f32>, CellState)>;
}

#[derive(Debug, Clone, Copy)]
struct Gates {
    sigmoid: Activation,
    tanh: Activation,
}

impl Gates {
    fn new(hard: bool) -> Self {
        if hard {
            Self {
                sigmoid: Activation::HardLogistic,
                tanh: Activation::HardTanh,
            }
        } else {
            Self {
                sigmoid: Activation::Logistic,
                tanh: Activation::Tanh,
            }
        }
    }
}

fn zero_hidden(batch_size: usize, hidden: usize, height: usize, width: usize) -> Array4<f32> {
    Array4::zeros((batch_size, hidden, height, width))
}

fn hidden_shape(input: &ArrayView4<f32>, hidden: usize) -> [usize; 4] {
    let (batch_size, _, height, width) = input.dim();
    [batch_size, hidden, height, width]
}

fn check_hidden(hidden: &Array4<f32>, shape: [usize; 4]) -> Result<()> {
    ensure!(
        hidden.shape() == shape,
        DetectError::shape("recurrent state", shape, hidden.shape())
    );
    Ok(())
}

fn foreign_state(expect: CellKind, found: &CellState) -> Error {
    DetectError::InvalidConfig(format!(
        "expect a {} state, but get a {} state",
        expect.as_ref(),
        found.kind().as_ref()
    ))
    .into()
}

fn concat_channels(input: &ArrayView4<f32>, hidden: &Array4<f32>) -> Result<Array4<f32>> {
    Ok(ndarray::concatenate(Axis(1), &[input.view(), hidden.view()])?)
}

fn channel_chunk(array: &Array4<f32>, index: usize, size: usize) -> ArrayView4<'_, f32> {
    array.slice(s![.., (index * size)..((index + 1) * size), .., ..])
}

/// Convolutional LSTM cell.
#[derive(Debug, Clone)]
pub struct ConvLstmCell {
    conv: Conv2d,
    hidden: usize,
    gates: Gates,
}

impl ConvLstmCell {
    pub fn new<R>(config: &CellConfig, rng: &mut R) -> Result<Self>
    where
        R: Rng + ?Sized,
    {
        let CellConfig {
            in_channels,
            hidden_channels,
            kernel_size,
            hard,
            ..
        } = *config;
        let conv = Conv2dInit::new(in_channels + hidden_channels, 4 * hidden_channels, kernel_size)
            .build(rng)?;

        Ok(Self {
            conv,
            hidden: hidden_channels,
            gates: Gates::new(hard),
        })
    }
}

impl RecurrentCell for ConvLstmCell {
    fn kind(&self) -> CellKind {
        CellKind::ConvLstm
    }

    fn hidden_channels(&self) -> usize {
        self.hidden
    }

    fn zero_state(&self, batch_size: usize, height: usize, width: usize) -> CellState {
        CellState::Lstm {
            h: zero_hidden(batch_size, self.hidden, height, width),
            c: zero_hidden(batch_size, self.hidden, height, width),
        }
    }

    fn step(&self, input: ArrayView4<f32>, prev: Option<&CellState>) -> Result<(Array4<f32>, CellState)> {
        let shape = hidden_shape(&input, self.hidden);
        let zeros;
        let (prev_h, prev_c) = match prev {
            Some(CellState::Lstm { h, c }) => (h, c),
            Some(other) => return Err(foreign_state(self.kind(), other)),
            None => {
                zeros = zero_hidden(shape[0], shape[1], shape[2], shape[3]);
                (&zeros, &zeros)
            }
        };
        check_hidden(prev_h, shape)?;
        check_hidden(prev_c, shape)?;

        let Gates { sigmoid, tanh } = self.gates;
        let gates = self.conv.forward(&concat_channels(&input, prev_h)?)?;
        let i = channel_chunk(&gates, 0, self.hidden).activation(sigmoid);
        let f = channel_chunk(&gates, 1, self.hidden).activation(sigmoid);
        let o = channel_chunk(&gates, 2, self.hidden).activation(sigmoid);
        let g = channel_chunk(&gates, 3, self.hidden).activation(tanh);

        let c = f * prev_c + i * g;
        let h = o * c.activation(tanh);

        Ok((h.clone(), CellState::Lstm { h, c }))
    }
}

/// Convolutional GRU cell.
#[derive(Debug, Clone)]
pub struct ConvGruCell {
    gates_conv: Conv2d,
    candidate_conv: Conv2d,
    hidden: usize,
    gates: Gates,
}

impl ConvGruCell {
    pub fn new<R>(config: &CellConfig, rng: &mut R) -> Result<Self>
    where
        R: Rng + ?Sized,
    {
        let CellConfig {
            in_channels,
            hidden_channels,
            kernel_size,
            hard,
            ..
        } = *config;
        let gates_conv =
            Conv2dInit::new(in_channels + hidden_channels, 2 * hidden_channels, kernel_size)
                .build(rng)?;
        let candidate_conv =
            Conv2dInit::new(in_channels + hidden_channels, hidden_channels, kernel_size)
                .build(rng)?;

        Ok(Self {
            gates_conv,
            candidate_conv,
            hidden: hidden_channels,
            gates: Gates::new(hard),
        })
    }
}

impl RecurrentCell for ConvGruCell {
    fn kind(&self) -> CellKind {
        CellKind::ConvGru
    }

    fn hidden_channels(&self) -> usize {
        self.hidden
    }

    fn zero_state(&self, batch_size: usize, height: usize, width: usize) -> CellState {
        CellState::Gru {
            h: zero_hidden(batch_size, self.hidden, height, width),
        }
    }

    fn step(&self, input: ArrayView4<f32>, prev: Option<&CellState>) -> Result<(Array4<f32>, CellState)> {
        let shape = hidden_shape(&input, self.hidden);
        let prev_h = match prev {
            Some(CellState::Gru { h }) => h.clone(),
            Some(other) => return Err(foreign_state(self.kind(), other)),
            None => zero_hidden(shape[0], shape[1], shape[2], shape[3]),
        };
        check_hidden(&prev_h, shape)?;

        let Gates { sigmoid, tanh } = self.gates;
        let gates = self.gates_conv.forward(&concat_channels(&input, &prev_h)?)?;
        let update = channel_chunk(&gates, 0, self.hidden).activation(sigmoid);
        let reset = channel_chunk(&gates, 1, self.hidden).activation(sigmoid);

        let candidate = self
            .candidate_conv
            .forward(&concat_channels(&input, &(&reset * &prev_h))?)?
            .activation(tanh);
        let h = (1.0 - &update) * &prev_h + &update * &candidate;

        Ok((h.clone(), CellState::Gru { h }))
    }
}

/// A cell selected once from configuration.
#[derive(Debug, Clone)]
pub enum Cell {
    ConvLstm(ConvLstmCell),
    ConvGru(ConvGruCell),
}

impl Cell {
    pub fn new<R>(config: &CellConfig, rng: &mut R) -> Result<Self>
    where
        R: Rng + ?Sized,
    {
        ensure!(
            config.hidden_channels > 0,
            DetectError::InvalidConfig("hidden_channels must be positive".into())
        );
        Ok(match config.kind {
            CellKind::ConvLstm => Self::ConvLstm(ConvLstmCell::new(config, rng)?),
            CellKind::ConvGru => Self::ConvGru(ConvGruCell::new(config, rng)?),
        })
    }
}

impl RecurrentCell for Cell {
    fn kind(&self) -> CellKind {
        match self {
            Self::ConvLstm(cell) => cell.kind(),
            Self::ConvGru(cell) => cell.kind(),
        }
    }

    fn hidden_channels(&self) -> usize {
        match self {
            Self::ConvLstm(cell) => cell.hidden_channels(),
            Self::ConvGru(cell) => cell.hidden_channels(),
        }
    }

    fn zero_state(&self, batch_size: usize, height: usize, width: usize) -> CellState {
        match self {
            Self::ConvLstm(cell) => cell.zero_state(batch_size, height, width),
            Self::ConvGru(cell) => cell.zero_state(batch_size, height, width),
        }
    }

    fn step(&self, input: ArrayView4<f32>, prev: Option<&CellState>) -> Result<(Array4<f32>, CellState)> {
        match self {
            Self::ConvLstm(cell) => cell.step(input, prev),
            Self::ConvGru(cell) => cell.step(input, prev),
        }
    }
}
