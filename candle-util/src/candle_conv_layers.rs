use candle_core::{bail, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, Module, VarBuilder};

/// `Conv2dConfig` with the given padding and stride
pub fn conv_config(padding: usize, stride: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    }
}

/// Convolution with constant-initialized weight and bias.
///
/// Variables:
/// * `weight` - (out, in, k, k)
/// * `bias` - (out,)
pub fn conv2d_const(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv2dConfig,
    weight_init: f64,
    bias_init: f64,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let ws = vb.get_with_hints(
        (out_channels, in_channels, kernel_size, kernel_size),
        "weight",
        Init::Const(weight_init),
    )?;
    let bs = vb.get_with_hints(out_channels, "bias", Init::Const(bias_init))?;
    Ok(Conv2d::new(ws, Some(bs), config))
}

/// Convolution with Gaussian-initialized weight and bias
pub fn conv2d_randn(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv2dConfig,
    stdev: f64,
    bias_mean: f64,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let ws = vb.get_with_hints(
        (out_channels, in_channels, kernel_size, kernel_size),
        "weight",
        Init::Randn { mean: 0., stdev },
    )?;
    let bs = vb.get_with_hints(
        out_channels,
        "bias",
        Init::Randn {
            mean: bias_mean,
            stdev,
        },
    )?;
    Ok(Conv2d::new(ws, Some(bs), config))
}

////////////////////////////////////
// Upsample-then-convolve (unpool) //
////////////////////////////////////

/// Nearest-neighbour upsampling by `scale_factor` followed by a
/// same-padded convolution. `scale_factor = 1` reduces to the
/// convolution alone.
#[derive(Clone, Debug)]
pub struct Unpool {
    conv: Conv2d,
    scale_factor: usize,
}

impl Unpool {
    pub fn new(conv: Conv2d, scale_factor: usize) -> Self {
        Self { conv, scale_factor }
    }

    pub fn scale_factor(&self) -> usize {
        self.scale_factor
    }
}

impl Module for Unpool {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.scale_factor > 1 {
            let (_, _, h, w) = x.dims4()?;
            x.upsample_nearest2d(h * self.scale_factor, w * self.scale_factor)?
        } else {
            x.clone()
        };
        self.conv.forward(&x)
    }
}

/// Unpool layer with variables `conv.weight` and `conv.bias`
///
/// * `in_channels` - input channels
/// * `out_channels` - output channels
/// * `kernel_size` - convolution kernel; padding is `kernel_size / 2`
/// * `stride` - upsampling factor
/// * `vb` - variable builder
pub fn unpool(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Unpool> {
    let conv = candle_nn::conv2d(
        in_channels,
        out_channels,
        kernel_size,
        conv_config(kernel_size / 2, 1),
        vb.pp("conv"),
    )?;
    Ok(Unpool::new(conv, stride))
}

/// Plain convolution expressed as an `Unpool` without upsampling, so
/// that it can live in the same layer stack
pub fn unpool_conv(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    padding: usize,
    vb: VarBuilder,
) -> Result<Unpool> {
    let conv = candle_nn::conv2d(
        in_channels,
        out_channels,
        kernel_size,
        conv_config(padding, 1),
        vb.pp("conv"),
    )?;
    Ok(Unpool::new(conv, 1))
}

/////////////////
// Center crop //
/////////////////

/// Symmetrically crop the last two (spatial) dimensions to
/// `(target_h, target_w)`.
///
/// An excess of Δ rows removes ⌊Δ/2⌋ rows at the top and ⌈Δ/2⌉ rows
/// at the bottom; columns likewise trim the odd one on the right.
pub fn center_crop(x: &Tensor, target_h: usize, target_w: usize) -> Result<Tensor> {
    let rank = x.rank();
    if rank < 2 {
        bail!("center_crop needs at least two dimensions, got {:?}", x.dims());
    }
    let (h, w) = (x.dim(rank - 2)?, x.dim(rank - 1)?);
    if target_h > h || target_w > w {
        bail!(
            "cannot crop {}x{} to the larger target {}x{}",
            h,
            w,
            target_h,
            target_w
        );
    }
    let top = (h - target_h) / 2;
    let left = (w - target_w) / 2;
    x.narrow(rank - 2, top, target_h)?
        .narrow(rank - 1, left, target_w)
}
