//! Activation functions over `ndarray` arrays.

pub use impls::*;
mod impls;

pub use r#trait::*;
mod r#trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Logistic,
    HardLogistic,
    Tanh,
    HardTanh,
}
