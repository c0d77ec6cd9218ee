pub use crate::error::DetectError;
pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, CxCyWH, XYXY};
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use itertools::{iproduct, izip, Itertools as _};
pub use log::{debug, warn};
pub use nd_act::{Activation, ArrayActivationExt as _};
pub use ndarray::{aview1, prelude::*, Data, Zip};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{iter, path::Path, sync::Arc};
pub use strum::{AsRefStr, EnumString};
