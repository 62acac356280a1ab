//! Convolutional encoder/decoder over histology images.
//!
//! The encoder halves the resolution four times and maps the feature
//! map (optionally concatenated with extra evidence channels) to the
//! per-pixel Gaussian of a latent code `z`. The decoder doubles the
//! resolution four times and exposes a pixel Gaussian over the image,
//! mixture-loading logits and its own hidden state.

use candle_util::candle_aux_layers::*;
use candle_util::candle_conv_layers::*;
use candle_util::candle_distributions::{softplus, Normal};
use candle_util::candle_inference::ExecContext;
use candle_util::candle_param_store::set_var_row;
use candle_util::candle_variational::Variational;

use candle_util::candle_core::{bail, Result, Tensor};
use candle_util::candle_nn::{self, Conv2d, ModuleT, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

/// smallest spread of any pixel or latent Gaussian
const MIN_SCALE: f64 = 1e-5;

/// spread of the initial mixture-loading weights and biases
const MIXTURE_INIT_STDEV: f64 = 1e-5;

/// number of image channels (RGB)
pub const IMAGE_CHANNELS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistonetConfig {
    /// channels of the mixture-loading head
    pub num_factors: usize,
    /// channels of the latent code `z`
    pub latent_size: usize,
    /// base width; layers use multiples `nf, 2nf, 4nf, 8nf, 16nf`
    pub nf: usize,
    /// extra channels concatenated to the encoder features before
    /// the latent heads
    pub evidence_channels: usize,
    /// initial bias of the mixture-loading logits
    #[serde(default)]
    pub mixture_bias: f32,
}

impl Default for HistonetConfig {
    fn default() -> Self {
        Self {
            num_factors: 50,
            latent_size: 96,
            nf: 16,
            evidence_channels: 0,
            mixture_bias: 0.,
        }
    }
}

/// Cropped outputs of a full encode-decode pass
pub struct HistonetOutput {
    pub z: Tensor,
    pub image: Normal,
    pub loadings: Tensor,
    pub state: Tensor,
}

pub struct Histonet {
    config: HistonetConfig,
    encoder: StackLayers<Conv2d>,
    z_mu: StackLayers<Conv2d>,
    z_sd: StackLayers<Conv2d>,
    decoder: StackLayers<Unpool>,
    img_mu: StackLayers<Conv2d>,
    img_sd: StackLayers<Conv2d>,
    mixture_loadings: StackLayers<Conv2d>,
    latents: Variational,
}

/// conv 3x3 → leaky relu → batch norm → `last`
fn conv_head(channels: usize, last: Conv2d, vb: VarBuilder) -> Result<StackLayers<Conv2d>> {
    let mut head = StackLayers::new();
    head.push_with_act_norm(
        candle_nn::conv2d(channels, channels, 3, conv_config(1, 1), vb.pp("conv.0"))?,
        leaky_relu(),
        candle_nn::batch_norm(channels, default_batch_norm_config(), vb.pp("bn.0"))?,
    );
    head.push(last);
    Ok(head)
}

impl Histonet {
    /// Will create the image network with these variables:
    ///
    /// * `enc.conv.{j}`, `enc.bn.{j}` for the four strided blocks
    /// * `z.mean.*`, `z.sd.*` latent heads
    /// * `dec.unpool.{j}`, `dec.bn.{j}` for the decoder blocks
    /// * `img.mean.*`, `img.sd.*`, `mixture.*` output heads
    ///
    /// # Arguments
    /// * `config` - network widths
    /// * `vb` - variable builder
    pub fn new(config: HistonetConfig, vb: VarBuilder) -> Result<Self> {
        let nf = config.nf;
        let bn = default_batch_norm_config();

        // (1) image -> x16 downsampled features
        let mut encoder = StackLayers::new();
        let widths = [IMAGE_CHANNELS, 2 * nf, 4 * nf, 8 * nf, 16 * nf];
        for (j, w) in widths.windows(2).enumerate() {
            encoder.push_with_act_norm(
                candle_nn::conv2d(w[0], w[1], 4, conv_config(1, 2), vb.pp(format!("enc.conv.{}", j)))?,
                leaky_relu(),
                candle_nn::batch_norm(w[1], bn, vb.pp(format!("enc.bn.{}", j)))?,
            );
        }

        // (2) features (+ evidence) -> z
        let z_in = 16 * nf + config.evidence_channels;
        let z_mu = Self::latent_head(z_in, 16 * nf, config.latent_size, vb.pp("z.mean"))?;
        let z_sd = Self::latent_head(z_in, 16 * nf, config.latent_size, vb.pp("z.sd"))?;

        // (3) z -> x1 decoder state
        let mut decoder = StackLayers::new();
        decoder.push_with_act_norm(
            unpool_conv(config.latent_size, 16 * nf, 5, 4, vb.pp("dec.unpool.0"))?,
            leaky_relu(),
            candle_nn::batch_norm(16 * nf, bn, vb.pp("dec.bn.0"))?,
        );
        let widths = [16 * nf, 8 * nf, 4 * nf, 2 * nf, nf];
        for (j, w) in widths.windows(2).enumerate() {
            decoder.push_with_act_norm(
                unpool(w[0], w[1], 5, 2, vb.pp(format!("dec.unpool.{}", j + 1)))?,
                leaky_relu(),
                candle_nn::batch_norm(w[1], bn, vb.pp(format!("dec.bn.{}", j + 1)))?,
            );
        }

        // (4) output heads
        let img_mu = conv_head(
            nf,
            candle_nn::conv2d(nf, IMAGE_CHANNELS, 3, conv_config(1, 1), vb.pp("img.mean.conv.1"))?,
            vb.pp("img.mean"),
        )?;
        let img_sd = conv_head(
            nf,
            candle_nn::conv2d(nf, IMAGE_CHANNELS, 3, conv_config(1, 1), vb.pp("img.sd.conv.1"))?,
            vb.pp("img.sd"),
        )?;
        let mixture_loadings = conv_head(
            nf,
            conv2d_randn(
                nf,
                config.num_factors,
                3,
                conv_config(1, 1),
                MIXTURE_INIT_STDEV,
                config.mixture_bias as f64,
                vb.pp("mixture.conv.1"),
            )?,
            vb.pp("mixture"),
        )?;

        let mut latents = Variational::new();
        latents.register_latent(
            "z",
            None,
            Normal::standard((), vb.dtype(), vb.device())?,
            false,
        )?;

        Ok(Self {
            config,
            encoder,
            z_mu,
            z_sd,
            decoder,
            img_mu,
            img_sd,
            mixture_loadings,
            latents,
        })
    }

    fn latent_head(
        in_channels: usize,
        hidden: usize,
        out_channels: usize,
        vb: VarBuilder,
    ) -> Result<StackLayers<Conv2d>> {
        let mut head = StackLayers::new();
        head.push_with_act_norm(
            candle_nn::conv2d(in_channels, hidden, 3, conv_config(1, 1), vb.pp("conv.0"))?,
            leaky_relu(),
            candle_nn::batch_norm(hidden, default_batch_norm_config(), vb.pp("bn.0"))?,
        );
        head.push(candle_nn::conv2d(
            hidden,
            out_channels,
            3,
            conv_config(1, 1),
            vb.pp("conv.1"),
        )?);
        Ok(head)
    }

    pub fn config(&self) -> &HistonetConfig {
        &self.config
    }

    pub fn latents(&self) -> &Variational {
        &self.latents
    }

    /// Downsampled feature map (n x 16nf x h/16 x w/16)
    pub fn features(&self, x_nchw: &Tensor, train: bool) -> Result<Tensor> {
        self.encoder.forward_t(x_nchw, train)
    }

    /// Map features (and evidence) to the latent code.
    ///
    /// Sets the posterior of `z` and draws exactly one sample from it
    /// (the posterior mean when `train` is false).
    ///
    /// # Returns `(z, z_mu, z_sd)`
    pub fn encode_features(
        &mut self,
        h_nchw: &Tensor,
        evidence_nchw: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let input = match (evidence_nchw, self.config.evidence_channels) {
            (Some(ev), _) => Tensor::cat(&[h_nchw, ev], 1)?,
            (None, 0) => h_nchw.clone(),
            (None, c) => {
                let (n, _, hh, ww) = h_nchw.dims4()?;
                let zeros = Tensor::zeros((n, c, hh, ww), h_nchw.dtype(), h_nchw.device())?;
                Tensor::cat(&[h_nchw, &zeros], 1)?
            }
        };

        let z_mu = self.z_mu.forward_t(&input, train)?;
        let z_sd = (softplus(&self.z_sd.forward_t(&input, train)?)? + MIN_SCALE)?;

        self.latents
            .set_posterior("z", Normal::new(z_mu.clone(), z_sd.clone())?)?;
        let z = if train {
            self.latents.sample("z")?
        } else {
            self.latents.set_value("z", z_mu.clone())?;
            z_mu.clone()
        };
        Ok((z, z_mu, z_sd))
    }

    /// # Returns `(z, z_mu, z_sd)`
    pub fn encode(
        &mut self,
        x_nchw: &Tensor,
        evidence_nchw: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let h = self.features(x_nchw, train)?;
        self.encode_features(&h, evidence_nchw, train)
    }

    /// # Returns `(pixel Gaussian, mixture loadings, decoder state)`,
    /// uncropped
    pub fn decode(&self, z: &Tensor, train: bool) -> Result<(Normal, Tensor, Tensor)> {
        let state = self.decoder.forward_t(z, train)?;
        let img_mu = self.img_mu.forward_t(&state, train)?.tanh()?;
        let img_sd = (softplus(&self.img_sd.forward_t(&state, train)?)? + MIN_SCALE)?;
        let loadings = self.mixture_loadings.forward_t(&state, train)?;
        Ok((Normal::new(img_mu, img_sd)?, loadings, state))
    }

    /// Decode and center-crop every pixel-level output to `(h, w)`
    pub fn decode_cropped(
        &self,
        z: &Tensor,
        h: usize,
        w: usize,
        train: bool,
    ) -> Result<(Normal, Tensor, Tensor)> {
        let (image, loadings, state) = self.decode(z, train)?;
        Ok((
            image.map(|t| center_crop(t, h, w))?,
            center_crop(&loadings, h, w)?,
            center_crop(&state, h, w)?,
        ))
    }

    /// encode → decode → crop to the input's spatial size
    pub fn forward(
        &mut self,
        x_nchw: &Tensor,
        evidence_nchw: Option<&Tensor>,
        train: bool,
    ) -> Result<HistonetOutput> {
        let (_, _, h, w) = x_nchw.dims4()?;
        let (z, _, _) = self.encode(x_nchw, evidence_nchw, train)?;
        let (image, loadings, state) = self.decode_cropped(&z, h, w, train)?;
        Ok(HistonetOutput {
            z,
            image,
            loadings,
            state,
        })
    }

    /// Draw fresh initial values for output channel `k` of the
    /// mixture-loading head (the other channels keep their values).
    ///
    /// # Arguments
    /// * `varmap` - store holding this network's variables
    /// * `prefix` - variable prefix the network was built under
    /// * `k` - channel to reset
    /// * `ctx` - device and dtype of the variables
    pub fn reset_mixture_channel(
        &self,
        varmap: &VarMap,
        prefix: &str,
        k: usize,
        ctx: &ExecContext,
    ) -> Result<()> {
        if k >= self.config.num_factors {
            bail!(
                "mixture head has {} channels, cannot reset channel {}",
                self.config.num_factors,
                k
            );
        }
        let nf = self.config.nf;
        let stdev = MIXTURE_INIT_STDEV as f32;

        let weight = Tensor::randn(0f32, stdev, (1, nf, 3, 3), &ctx.device)?.to_dtype(ctx.dtype)?;
        let bias = Tensor::randn(self.config.mixture_bias, stdev, 1, &ctx.device)?
            .to_dtype(ctx.dtype)?;

        set_var_row(varmap, &format!("{}.mixture.conv.1.weight", prefix), k, &weight)?;
        set_var_row(varmap, &format!("{}.mixture.conv.1.bias", prefix), k, &bias)
    }

    /// KL-like cost of `z`; local, so weighted by `batch_fraction`
    pub fn complexity_cost(&self, batch_fraction: f64) -> Result<Tensor> {
        self.latents.complexity_cost(batch_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_util::candle_core::{DType, Device};
    use candle_util::candle_nn::VarMap;

    #[test]
    fn test_reset_mixture_channel() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let net = Histonet::new(small_config(), vb.pp("histonet"))?;

        let name = "histonet.mixture.conv.1.bias";
        set_var_row(&varmap, name, 1, &Tensor::new(&[8f32], &dev)?)?;
        set_var_row(&varmap, name, 2, &Tensor::new(&[-3f32], &dev)?)?;

        net.reset_mixture_channel(&varmap, "histonet", 1, &ExecContext::cpu())?;
        let bias: Vec<f32> = {
            let data = varmap.data().lock().unwrap();
            data.get(name).unwrap().as_tensor().to_vec1()?
        };
        assert!(bias[1].abs() < 1e-3);
        assert_eq!(bias[2], -3.0);

        assert!(net
            .reset_mixture_channel(&varmap, "histonet", 3, &ExecContext::cpu())
            .is_err());
        Ok(())
    }

    fn small_config() -> HistonetConfig {
        HistonetConfig {
            num_factors: 3,
            latent_size: 4,
            nf: 2,
            evidence_channels: 0,
            mixture_bias: 0.,
        }
    }

    #[test]
    fn test_forward_shapes_are_cropped() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut net = Histonet::new(small_config(), vb.pp("histonet"))?;

        let x = Tensor::randn(0f32, 1f32, (2, 3, 35, 33), &dev)?;
        let out = net.forward(&x, None, true)?;

        assert_eq!(out.z.dims(), &[2, 4, 2, 2]);
        assert_eq!(out.image.loc().dims(), &[2, 3, 35, 33]);
        assert_eq!(out.image.scale().dims(), &[2, 3, 35, 33]);
        assert_eq!(out.loadings.dims(), &[2, 3, 35, 33]);
        assert_eq!(out.state.dims(), &[2, 2, 35, 33]);

        let min_sd = out.image.scale().flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min_sd > 0.0);

        let cost = net.complexity_cost(2.0)?.to_scalar::<f32>()?;
        assert!(cost.is_finite());
        Ok(())
    }

    #[test]
    fn test_evidence_channels_are_concatenated() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = HistonetConfig {
            evidence_channels: 5,
            ..small_config()
        };
        let mut net = Histonet::new(config, vb)?;

        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &dev)?;
        let h = net.features(&x, true)?;
        assert_eq!(h.dims(), &[1, 32, 2, 2]);

        let ev = Tensor::ones((1, 5, 2, 2), DType::F32, &dev)?;
        let (z, z_mu, z_sd) = net.encode_features(&h, Some(&ev), false)?;
        assert_eq!(z.dims(), &[1, 4, 2, 2]);
        // no sampling outside training
        let diff = (z - z_mu)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        assert_eq!(z_sd.dims(), &[1, 4, 2, 2]);

        // missing evidence is zero-filled
        let (z, _, _) = net.encode_features(&h, None, true)?;
        assert_eq!(z.dims(), &[1, 4, 2, 2]);
        Ok(())
    }
}
