use crate::common::*;
use rand::prelude::*;

pub use conv_init::*;
pub use conv_2d::*;

mod conv_init {
    use super::*;

    /// Same-padded, stride-1 2D convolution initializer.
    #[derive(Debug, Clone)]
    pub struct Conv2dInit {
        pub in_channels: usize,
        pub out_channels: usize,
        /// Odd kernel size.
        pub ksize: usize,
        pub bias: bool,
    }

    impl Conv2dInit {
        pub fn new(in_channels: usize, out_channels: usize, ksize: usize) -> Self {
            Self {
                in_channels,
                out_channels,
                ksize,
                bias: true,
            }
        }

        /// Build with weights drawn uniformly from `±1 / sqrt(fan_in)`.
        pub fn build<R>(self, rng: &mut R) -> Result<Conv2d>
        where
            R: Rng + ?Sized,
        {
            let Self {
                in_channels,
                out_channels,
                ksize,
                bias,
            } = self;
            ensure!(
                in_channels > 0 && out_channels > 0,
                DetectError::InvalidConfig("convolution channels must be positive".into())
            );

            let fan_in = (in_channels * ksize * ksize) as f32;
            let bound = fan_in.sqrt().recip();
            let weight = Array4::from_shape_fn((out_channels, in_channels, ksize, ksize), |_| {
                rng.gen_range(-bound..=bound)
            });
            let bias = if bias {
                Array1::from_shape_fn(out_channels, |_| rng.gen_range(-bound..=bound))
            } else {
                Array1::zeros(out_channels)
            };

            Conv2d::from_parts(weight, bias)
        }
    }
}

mod conv_2d {
    use super::*;

    /// Same-padded, stride-1 2D convolution over `[batch, channels, height, width]`.
    #[derive(Derivative, Clone)]
    #[derivative(Debug)]
    pub struct Conv2d {
        #[derivative(Debug = "ignore")]
        weight: Array4<f32>,
        #[derivative(Debug = "ignore")]
        bias: Array1<f32>,
        in_channels: usize,
        out_channels: usize,
        ksize: usize,
    }

    impl Conv2d {
        /// Wrap `[out, in, k, k]` weights and `[out]` bias.
        pub fn from_parts(weight: Array4<f32>, bias: Array1<f32>) -> Result<Self> {
            let (out_channels, in_channels, kh, kw) = weight.dim();
            ensure!(
                kh == kw && kh % 2 == 1,
                DetectError::shape("convolution kernel", "odd square kernel", [kh, kw])
            );
            ensure!(
                bias.len() == out_channels,
                DetectError::shape("convolution bias", [out_channels], bias.shape())
            );

            Ok(Self {
                weight,
                bias,
                in_channels,
                out_channels,
                ksize: kh,
            })
        }

        pub fn in_channels(&self) -> usize {
            self.in_channels
        }

        pub fn out_channels(&self) -> usize {
            self.out_channels
        }

        pub fn forward<S>(&self, input: &ArrayBase<S, Ix4>) -> Result<Array4<f32>>
        where
            S: Data<Elem = f32>,
        {
            let (batch_size, channels, height, width) = input.dim();
            ensure!(
                channels == self.in_channels,
                DetectError::shape(
                    "convolution input",
                    format!("[_, {}, _, _]", self.in_channels),
                    input.shape()
                )
            );

            let pad = (self.ksize / 2) as isize;
            let ksize = self.ksize as isize;
            let (height_i, width_i) = (height as isize, width as isize);

            let output = Array4::from_shape_fn(
                (batch_size, self.out_channels, height, width),
                |(batch, out_c, row, col)| {
                    let mut sum = self.bias[out_c];
                    for (in_c, ky, kx) in iproduct!(0..self.in_channels, 0..ksize, 0..ksize) {
                        let y = row as isize + ky - pad;
                        let x = col as isize + kx - pad;
                        if y < 0 || y >= height_i || x < 0 || x >= width_i {
                            continue;
                        }
                        sum += self.weight[[out_c, in_c, ky as usize, kx as usize]]
                            * input[[batch, in_c, y as usize, x as usize]];
                    }
                    sum
                },
            );

            Ok(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn identity_kernel() -> Result<()> {
        let mut weight = Array4::zeros((2, 2, 3, 3));
        weight[[0, 0, 1, 1]] = 1.0;
        weight[[1, 1, 1, 1]] = 2.0;
        let conv = Conv2d::from_parts(weight, array![0.0f32, 1.0])?;

        let input = Array4::from_shape_fn((1, 2, 4, 5), |(_, c, h, w)| (c * 100 + h * 10 + w) as f32);
        let output = conv.forward(&input)?;
        assert_eq!(output.index_axis(Axis(1), 0), input.index_axis(Axis(1), 0));
        assert_abs_diff_eq!(output[[0, 1, 2, 3]], 2.0 * 123.0 + 1.0);
        Ok(())
    }

    #[test]
    fn borders_are_zero_padded() -> Result<()> {
        let conv = Conv2d::from_parts(Array4::ones((1, 1, 3, 3)), array![0.0f32])?;
        let output = conv.forward(&Array4::<f32>::ones((1, 1, 3, 3)))?;
        assert_eq!(output[[0, 0, 0, 0]], 4.0);
        assert_eq!(output[[0, 0, 0, 1]], 6.0);
        assert_eq!(output[[0, 0, 1, 1]], 9.0);
        Ok(())
    }

    #[test]
    fn random_init_is_bounded() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2dInit::new(3, 8, 3).build(&mut rng)?;
        assert_eq!((conv.in_channels(), conv.out_channels()), (3, 8));
        let output = conv.forward(&Array4::<f32>::zeros((2, 3, 5, 5)))?;
        assert_eq!(output.dim(), (2, 8, 5, 5));
        assert!(Conv2dInit::new(3, 8, 2).build(&mut rng).is_err());
        Ok(())
    }
}
