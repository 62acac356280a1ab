//! The spatial transcriptomics experiment (ST): joint model of the
//! histology image and the per-spot counts of each slide.
//!
//! For every slide the image network encodes the image (plus an
//! embedding of the observed expression) into `z`, decodes a pixel
//! Gaussian and a hidden state, and per-factor decoders turn that state
//! into mixture logits. Softmax proportions, multiplied by a per-pixel
//! scale, are summed over the pixels of each spot and fed to the count
//! model.

use crate::count_model::{Covariate, CountModel};
use crate::factors::{Factor, FactorRegistry};
use crate::histonet::{Histonet, HistonetConfig};
use crate::slide_data::{SlideBatch, SlideData};

use candle_util::candle_aux_layers::*;
use candle_util::candle_conv_layers::*;
use candle_util::candle_distributions::{
    inv_softplus, softplus, Distribution, NegativeBinomial, Normal,
};
use candle_util::candle_inference::ExecContext;
use candle_util::candle_label_pooling::*;
use candle_util::candle_loss_functions::total_log_likelihood;
use candle_util::candle_param_store::evict_prefix;

use anyhow::{anyhow, bail};
use candle_util::candle_core::{Tensor, D};
use candle_util::candle_nn::{self, Conv2d, Linear, ModuleT, VarBuilder, VarMap};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// width of the expression embedding concatenated to the image features
pub const EXPRESSION_EMBEDDING: usize = 100;

/// parameter prefix of the experiment's own networks
pub const EXPERIMENT_PREFIX: &str = "st";

/// parameter prefix of the image network
pub const HISTONET_PREFIX: &str = "histonet";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StConfig {
    pub histonet: HistonetConfig,
    /// initial per-pixel scale of the factor proportions
    pub default_scale: f32,
}

impl Default for StConfig {
    fn default() -> Self {
        Self {
            histonet: HistonetConfig {
                evidence_channels: EXPRESSION_EMBEDDING,
                ..HistonetConfig::default()
            },
            default_scale: 1.0,
        }
    }
}

/// Objective of one minibatch and its parts (for logging)
pub struct StLoss {
    /// negative ELBO, to be minimized
    pub loss: Tensor,
    pub image_llik: f32,
    pub expression_llik: f32,
    /// cost of the slide latents `z`, already times the batch fraction
    pub local_complexity: f32,
    /// cost of the count model latents, once per step
    pub global_complexity: f32,
}

impl StLoss {
    pub fn complexity(&self) -> f32 {
        self.local_complexity + self.global_complexity
    }
}

/// Pixel-level outputs of the networks on one slide
struct ImagePass {
    /// (1, 3, H, W) observed image
    x_nchw: Tensor,
    /// pixel Gaussian of the reconstruction
    image: Normal,
    /// (1, K, H, W) mixture proportions of the active factors
    props: Tensor,
    /// (1, K, H, W) proportions times the per-pixel scale
    activations: Tensor,
}

/// Per-slide maps for inspection
pub struct SlideMaps {
    /// (3, H, W) reconstructed image (pixel means)
    pub reconstruction: Tensor,
    /// (K, H, W) factor proportions
    pub proportions: Tensor,
    /// (K, H, W) proportions times the per-pixel scale
    pub activations: Tensor,
}

pub struct StExperiment {
    config: StConfig,
    histonet: Histonet,
    count_model: CountModel,
    registry: FactorRegistry,
    decoders: HashMap<usize, StackLayers<Conv2d>>,
    scale_decoder: StackLayers<Conv2d>,
    expression_encoder: StackLayers<Linear>,
    varmap: VarMap,
    ctx: ExecContext,
}

impl StExperiment {
    /// Build the experiment and register every parameter in `varmap`.
    ///
    /// # Arguments
    /// * `config` - network widths and default scale
    /// * `genes` - gene vocabulary (count columns)
    /// * `covariates` - batch-effect schema
    /// * `gene_baseline` - mean count per gene
    /// * `registry` - active factors (and their id bookkeeping)
    /// * `varmap` - parameter store shared by all networks
    /// * `ctx` - device and dtype
    pub fn new(
        config: StConfig,
        genes: &[Box<str>],
        covariates: &[Covariate],
        gene_baseline: Option<&[f32]>,
        registry: FactorRegistry,
        varmap: &VarMap,
        ctx: &ExecContext,
    ) -> anyhow::Result<Self> {
        let mut config = config;
        config.histonet.evidence_channels = EXPRESSION_EMBEDDING;

        let vb = VarBuilder::from_varmap(varmap, ctx.dtype, &ctx.device);
        let histonet = Histonet::new(config.histonet.clone(), vb.pp(HISTONET_PREFIX))?;

        let mut count_model = CountModel::new(genes, 0, gene_baseline, covariates, varmap, ctx)?;
        for (id, factor) in registry.snapshot() {
            count_model.add_factor(id, factor.profile.as_deref())?;
        }

        let nf = config.histonet.nf;
        let vb_st = vb.pp(EXPERIMENT_PREFIX);

        let mut scale_decoder = StackLayers::new();
        scale_decoder.push_with_act_norm(
            candle_nn::conv2d(nf, nf, 3, conv_config(1, 1), vb_st.pp("scale.conv.0"))?,
            leaky_relu(),
            candle_nn::batch_norm(nf, default_batch_norm_config(), vb_st.pp("scale.bn.0"))?,
        );
        scale_decoder.push(conv2d_const(
            nf,
            1,
            1,
            conv_config(0, 1),
            0.,
            inv_softplus(config.default_scale as f64),
            vb_st.pp("scale.conv.1"),
        )?);

        let mut expression_encoder = StackLayers::new();
        expression_encoder.push_with_act_norm(
            candle_nn::linear(1 + genes.len(), EXPRESSION_EMBEDDING, vb_st.pp("expr.linear.0"))?,
            leaky_relu(),
            candle_nn::batch_norm(
                EXPRESSION_EMBEDDING,
                default_batch_norm_config(),
                vb_st.pp("expr.bn.0"),
            )?,
        );
        expression_encoder.push(candle_nn::linear(
            EXPRESSION_EMBEDDING,
            EXPRESSION_EMBEDDING,
            vb_st.pp("expr.linear.1"),
        )?);

        Ok(Self {
            config,
            histonet,
            count_model,
            registry,
            decoders: HashMap::new(),
            scale_decoder,
            expression_encoder,
            varmap: varmap.clone(),
            ctx: ctx.clone(),
        })
    }

    pub fn config(&self) -> &StConfig {
        &self.config
    }

    pub fn histonet(&self) -> &Histonet {
        &self.histonet
    }

    pub fn count_model(&self) -> &CountModel {
        &self.count_model
    }

    pub fn registry(&self) -> &FactorRegistry {
        &self.registry
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn ctx(&self) -> &ExecContext {
        &self.ctx
    }

    /// read-only copy of the active factors
    pub fn factors(&self) -> BTreeMap<usize, Factor> {
        self.registry.snapshot()
    }

    /// Activate a factor (default: zero bias, no profile) and return
    /// its id; its decoder is built on first use
    pub fn add_factor(&mut self, factor: Option<Factor>) -> anyhow::Result<usize> {
        let factor = factor.unwrap_or_default();
        let profile = factor.profile.clone();
        let id = self.registry.add(factor);
        self.count_model.add_factor(id, profile.as_deref())?;
        Ok(id)
    }

    /// Deactivate factor `id` and discard its decoder and terms; a
    /// later factor reusing the id starts from fresh parameters,
    /// including its channel of the image network's mixture head
    pub fn remove_factor(&mut self, id: usize) -> anyhow::Result<()> {
        self.registry.remove(id)?;
        self.decoders.remove(&id);
        let evicted = evict_prefix(&self.varmap, &format!("{}.factor{}.", EXPERIMENT_PREFIX, id))?;
        debug!("evicted {} decoder parameters of factor {}", evicted, id);

        if id < self.config.histonet.num_factors {
            self.histonet
                .reset_mixture_channel(&self.varmap, HISTONET_PREFIX, id, &self.ctx)?;
        }
        self.count_model.remove_factor(id)
    }

    /// Build the decoder of every active factor that has none yet.
    ///
    /// Variables `st.factor{id}.*`: conv 3x3 → leaky relu → batch norm
    /// → conv 1x1 with zero weight and the factor's bias.
    pub fn ensure_decoders(&mut self) -> anyhow::Result<()> {
        let nf = self.config.histonet.nf;
        for (id, factor) in self.registry.snapshot() {
            if self.decoders.contains_key(&id) {
                continue;
            }
            debug!("creating decoder for factor {}", id);
            let vb = VarBuilder::from_varmap(&self.varmap, self.ctx.dtype, &self.ctx.device)
                .pp(format!("{}.factor{}", EXPERIMENT_PREFIX, id));

            let mut decoder = StackLayers::new();
            decoder.push_with_act_norm(
                candle_nn::conv2d(nf, nf, 3, conv_config(1, 1), vb.pp("conv.0"))?,
                leaky_relu(),
                candle_nn::batch_norm(nf, default_batch_norm_config(), vb.pp("bn.0"))?,
            );
            decoder.push(conv2d_const(
                nf,
                1,
                1,
                conv_config(0, 1),
                0.,
                factor.bias as f64,
                vb.pp("conv.1"),
            )?);
            self.decoders.insert(id, decoder);
        }
        Ok(())
    }

    /// Embed `[missing sentinel; 0 | log1p(counts)]` per label and
    /// scatter the embedding onto the `h x w` feature grid
    ///
    /// Counts enter on the log1p scale, not as raw counts.
    ///
    /// # Arguments
    /// * `counts_lg` - observed counts of labels `1..=L` (all missing if `None`)
    /// * `nlabels` - `L + 1`
    /// * `label_hw` - label map already resized to the feature grid
    ///
    /// # Returns `(1, EXPRESSION_EMBEDDING, h, w)`
    fn expression_evidence(
        &self,
        counts_lg: Option<&Tensor>,
        nlabels: usize,
        label_hw: &Tensor,
        train: bool,
    ) -> anyhow::Result<Tensor> {
        let (dev, dtype) = (&self.ctx.device, self.ctx.dtype);
        let ngenes = self.count_model.num_genes();
        let (hh, ww) = label_hw.dims2()?;

        let missing = Tensor::cat(
            &[
                Tensor::ones((1, 1), dtype, dev)?,
                Tensor::zeros((1, ngenes), dtype, dev)?,
            ],
            1,
        )?;

        let rows = match counts_lg {
            Some(c) => {
                let log1p = (c.to_dtype(dtype)? + 1.0)?.log()?;
                let nl = log1p.dim(0)?;
                Tensor::cat(&[Tensor::zeros((nl, 1), dtype, dev)?, log1p], 1)?
            }
            None => missing
                .broadcast_as((nlabels.saturating_sub(1), 1 + ngenes))?
                .contiguous()?,
        };
        let input_lx = Tensor::cat(&[&missing, &rows], 0)?;

        let embed_lk = self.expression_encoder.forward_t(&input_lx, train)?;
        let embed_pk = broadcast_by_label(&label_hw.flatten_all()?, &embed_lk)?;
        Ok(embed_pk
            .t()?
            .reshape((1, EXPRESSION_EMBEDDING, hh, ww))?)
    }

    /// (1, K, H, W) logits of the active factors, ascending ids
    fn factor_logits(
        &self,
        state: &Tensor,
        loadings: &Tensor,
        train: bool,
    ) -> anyhow::Result<Tensor> {
        let nseeds = loadings.dim(1)?;
        let logits = self
            .registry
            .ids()
            .into_iter()
            .map(|id| {
                let decoder = self
                    .decoders
                    .get(&id)
                    .ok_or(anyhow!("factor {} has no decoder", id))?;
                let logit = decoder.forward_t(state, train)?;
                if id < nseeds {
                    Ok((logit + loadings.narrow(1, id, 1)?)?)
                } else {
                    Ok(logit)
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&logits, 1)?)
    }

    /// Run the image network and the factor/scale decoders on one slide.
    ///
    /// `counts_lg = None` encodes every spot as missing expression.
    fn image_pass(
        &mut self,
        slide: &SlideData,
        counts_lg: Option<&Tensor>,
        train: bool,
    ) -> anyhow::Result<ImagePass> {
        if self.registry.is_empty() {
            bail!("no active factors");
        }
        self.ensure_decoders()?;

        let (hh, ww) = slide.label.dims2()?;
        let x_nchw = slide.image.to_dtype(self.ctx.dtype)?.unsqueeze(0)?;
        let nlabels = slide.num_spots()? + 1;

        // guide: image features + expression evidence → z
        let h_nchw = self.histonet.features(&x_nchw, train)?;
        let (_, _, fh, fw) = h_nchw.dims4()?;
        let label_small = resize_labels_nearest(&slide.label, fh, fw)?;
        let evidence = self.expression_evidence(counts_lg, nlabels, &label_small, train)?;
        let (z, _, _) = self.histonet.encode_features(&h_nchw, Some(&evidence), train)?;

        // model: z → image, proportions, scale
        let (image, loadings, state) = self.histonet.decode_cropped(&z, hh, ww, train)?;
        let logits = self.factor_logits(&state, &loadings, train)?;
        let props = candle_nn::ops::softmax(&logits, 1)?;
        let scale = softplus(&self.scale_decoder.forward_t(&state, train)?)?;
        let activations = props.broadcast_mul(&scale)?;

        Ok(ImagePass {
            x_nchw,
            image,
            props,
            activations,
        })
    }

    /// Sum the activations of every spot that covers at least one pixel
    ///
    /// # Returns `(rows, x_nk)`: count-matrix rows of the spots and
    /// their pooled activations
    fn pooled_spots(
        &self,
        slide: &SlideData,
        activations: &Tensor,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let (_, kk, hh, ww) = activations.dims4()?;
        let nlabels = slide.num_spots()? + 1;
        let act_pk = activations.squeeze(0)?.reshape((kk, hh * ww))?.t()?;
        let pooled_lk = pool_by_label(&slide.label.flatten_all()?, &act_pk, nlabels)?;

        let rows: Vec<u32> = slide.spot_ids()?.into_iter().map(|l| l - 1).collect();
        if rows.is_empty() {
            bail!("slide {} has no labelled pixels", slide.name);
        }
        let nrows = rows.len();
        let rows = Tensor::from_vec(rows, nrows, &self.ctx.device)?;
        let x_nk = pooled_lk.index_select(&rows, 0)?;
        Ok((rows, x_nk))
    }

    /// (n x E) covariate design of `n` spots of a slide
    fn spot_effects(&self, slide: &SlideData, nspots: usize) -> anyhow::Result<Option<Tensor>> {
        if self.count_model.num_effects() == 0 {
            return Ok(None);
        }
        match &slide.effects {
            Some(e) => Ok(Some(
                e.to_dtype(self.ctx.dtype)?
                    .broadcast_as((nspots, e.dim(D::Minus1)?))?
                    .contiguous()?,
            )),
            None => bail!("slide {} has no covariate design", slide.name),
        }
    }

    /// Negative ELBO of a minibatch.
    ///
    /// ```text
    /// loss = -bf * (Σ image llik + Σ expression llik)
    ///        + bf * Σ cost(z) + cost(count model)
    /// ```
    ///
    /// where `bf` is the batch fraction. Only spots that cover pixels
    /// of a slide's label map enter the expression likelihood.
    pub fn elbo_loss(&mut self, batch: &SlideBatch) -> anyhow::Result<StLoss> {
        if batch.is_empty() {
            bail!("empty minibatch");
        }
        let bf = batch.batch_fraction();

        let mut image_llik: Option<Tensor> = None;
        let mut local_cost: Option<Tensor> = None;
        let mut pooled = vec![];
        let mut effects = vec![];
        let mut counts = vec![];

        for slide in batch.slides.iter() {
            let counts_lg = slide
                .counts
                .as_ref()
                .ok_or(anyhow!("slide {} has no counts", slide.name))?;
            let pass = self.image_pass(slide, Some(counts_lg), true)?;
            let z_cost = self.histonet.complexity_cost(bf)?;
            let llik = total_log_likelihood(&pass.image, &pass.x_nchw)?;

            image_llik = Some(match image_llik {
                Some(acc) => (acc + llik)?,
                None => llik,
            });
            local_cost = Some(match local_cost {
                Some(acc) => (acc + z_cost)?,
                None => z_cost,
            });

            let (rows, x_nk) = self.pooled_spots(slide, &pass.activations)?;
            if let Some(e) = self.spot_effects(slide, x_nk.dim(0)?)? {
                effects.push(e);
            }
            pooled.push(x_nk);
            counts.push(counts_lg.to_dtype(self.ctx.dtype)?.index_select(&rows, 0)?);
        }

        let x_nk = Tensor::cat(&pooled, 0)?;
        let counts_ng = Tensor::cat(&counts, 0)?;
        let effects_ne = if effects.is_empty() {
            None
        } else {
            Some(Tensor::cat(&effects, 0)?)
        };

        let expression = self.count_model.forward(&x_nk, effects_ne.as_ref())?;
        let expression_llik = total_log_likelihood(&expression, &counts_ng)?;

        let image_llik = image_llik.ok_or(anyhow!("no image likelihood"))?;
        let local_cost = local_cost.ok_or(anyhow!("no local complexity"))?;
        let global_cost = self.count_model.complexity_cost(bf)?;

        let llik = (&image_llik + &expression_llik)?;
        let loss = (((llik * (-bf))? + &local_cost)? + &global_cost)?;

        Ok(StLoss {
            loss,
            image_llik: image_llik.to_scalar::<f32>()?,
            expression_llik: expression_llik.to_scalar::<f32>()?,
            local_complexity: local_cost.to_scalar::<f32>()?,
            global_complexity: global_cost.to_scalar::<f32>()?,
        })
    }

    /// Negative expression log-likelihood per held-out spot.
    ///
    /// The label maps of `slides` mark the held-out spots. Their
    /// counts are predicted from the image alone (no expression
    /// evidence), with every latent at its posterior mean.
    pub fn validation_loss(&mut self, slides: &[SlideData]) -> anyhow::Result<f32> {
        self.count_model.use_posterior_means()?;

        let mut llik = 0f32;
        let mut nspots = 0;
        for slide in slides {
            let counts_lg = slide
                .counts
                .as_ref()
                .ok_or(anyhow!("slide {} has no counts", slide.name))?;
            let pass = self.image_pass(slide, None, false)?;
            let (rows, x_nk) = self.pooled_spots(slide, &pass.activations)?;
            let effects_ne = self.spot_effects(slide, x_nk.dim(0)?)?;

            let expression = self.count_model.predict(&x_nk, effects_ne.as_ref())?;
            let observed = counts_lg.to_dtype(self.ctx.dtype)?.index_select(&rows, 0)?;
            llik += total_log_likelihood(&expression, &observed)?.to_scalar::<f32>()?;
            nspots += x_nk.dim(0)?;
        }
        if nspots == 0 {
            bail!("no held-out spots");
        }
        Ok(-llik / nspots as f32)
    }

    /// Count distribution of every spot of a slide, predicted from its
    /// image alone with every latent at its posterior mean
    ///
    /// # Returns `NegativeBinomial` over `(L x G)` counts
    pub fn predict_counts(&mut self, slide: &SlideData) -> anyhow::Result<NegativeBinomial> {
        let pass = self.image_pass(slide, None, false)?;
        let (_, kk, hh, ww) = pass.activations.dims4()?;
        let act_pk = pass.activations.squeeze(0)?.reshape((kk, hh * ww))?.t()?;
        let nspots = slide.num_spots()?;
        let x_nk = pool_by_label(&slide.label.flatten_all()?, &act_pk, nspots + 1)?;
        let effects_ne = self.spot_effects(slide, nspots)?;

        self.count_model.use_posterior_means()?;
        self.count_model.predict(&x_nk, effects_ne.as_ref())
    }

    /// Expected counts (negative-binomial mean) of every spot of a
    /// slide
    ///
    /// # Returns `(L x G)` tensor
    pub fn impute(&mut self, slide: &SlideData) -> anyhow::Result<Tensor> {
        Ok(self.predict_counts(slide)?.mean()?)
    }

    /// Reconstruction, proportions and activations of a slide
    pub fn slide_maps(&mut self, slide: &SlideData) -> anyhow::Result<SlideMaps> {
        let pass = self.image_pass(slide, None, false)?;
        Ok(SlideMaps {
            reconstruction: pass.image.mean()?.squeeze(0)?,
            proportions: pass.props.squeeze(0)?,
            activations: pass.activations.squeeze(0)?,
        })
    }

    /// Per-pixel factor proportions of a slide (K x H x W)
    pub fn factor_proportions(&mut self, slide: &SlideData) -> anyhow::Result<Tensor> {
        Ok(self.slide_maps(slide)?.proportions)
    }

    /// Expected expression of the selected genes at every pixel.
    ///
    /// The mean is linear in the pooled activations, so summing a map
    /// over the pixels of a spot gives that spot's imputed mean.
    ///
    /// # Arguments
    /// * `slide` - the slide (its counts are not used)
    /// * `genes` - column indexes into [`CountModel::genes`]
    ///
    /// # Returns `(genes.len() x H x W)` tensor
    pub fn gene_maps(&mut self, slide: &SlideData, genes: &[usize]) -> anyhow::Result<Tensor> {
        let ngenes = self.count_model.num_genes();
        if let Some(&g) = genes.iter().find(|&&g| g >= ngenes) {
            bail!("gene index {} is out of range ({} genes)", g, ngenes);
        }

        let pass = self.image_pass(slide, None, false)?;
        let (_, kk, hh, ww) = pass.activations.dims4()?;
        let act_pk = pass
            .activations
            .squeeze(0)?
            .reshape((kk, hh * ww))?
            .t()?
            .contiguous()?;

        // mean counts of one unit of each factor's activation
        let eye: Vec<f32> = (0..kk * kk)
            .map(|i| if i % (kk + 1) == 0 { 1. } else { 0. })
            .collect();
        let eye_kk = Tensor::from_vec(eye, (kk, kk), &self.ctx.device)?.to_dtype(self.ctx.dtype)?;
        let effects_ke = self.spot_effects(slide, kk)?;
        self.count_model.use_posterior_means()?;
        let mean_kg = self.count_model.predict(&eye_kk, effects_ke.as_ref())?.mean()?;

        let idx: Vec<u32> = genes.iter().map(|&g| g as u32).collect();
        let idx = Tensor::from_vec(idx, genes.len(), &self.ctx.device)?;
        let mean_kx = mean_kg.index_select(&idx, 1)?;

        Ok(act_pk
            .matmul(&mean_kx)?
            .t()?
            .reshape((genes.len(), hh, ww))?)
    }

    /// Gene by factor rates at the posterior means, with the factor id
    /// of every column
    pub fn gene_profiles(&mut self) -> anyhow::Result<(Vec<usize>, Tensor)> {
        self.count_model.use_posterior_means()?;
        Ok((self.count_model.factor_ids(), self.count_model.rate_gt()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_util::candle_core::Device;
    use candle_util::candle_param_store::set_var;

    fn toy_config() -> StConfig {
        StConfig {
            histonet: HistonetConfig {
                num_factors: 2,
                latent_size: 4,
                nf: 2,
                evidence_channels: 0,
                mixture_bias: 0.,
            },
            default_scale: 1.0,
        }
    }

    fn genes() -> Vec<Box<str>> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    /// 32x32 slide with four 16x16 spots
    fn toy_slide() -> anyhow::Result<SlideData> {
        let dev = Device::Cpu;
        let image = Tensor::randn(0f32, 0.5, (3, 32, 32), &dev)?.clamp(-1f32, 1f32)?;
        let label: Vec<u32> = (0..32 * 32)
            .map(|p| {
                let (i, j) = (p / 32, p % 32);
                (1 + (i / 16) * 2 + j / 16) as u32
            })
            .collect();
        let label = Tensor::from_vec(label, (32, 32), &dev)?;
        let counts = Tensor::new(
            &[[1f32, 0., 5.], [2., 1., 0.], [0., 0., 3.], [4., 2., 1.]],
            &dev,
        )?;
        SlideData::new("toy", image, label, Some(counts), None)
    }

    fn toy_experiment(varmap: &VarMap) -> anyhow::Result<StExperiment> {
        let mut registry = FactorRegistry::new();
        registry.add(Factor::default());
        registry.add(Factor::new(0.5, Some(vec![0.1, 0.2, 0.3])));
        StExperiment::new(
            toy_config(),
            &genes(),
            &[],
            Some(&[1.0, 0.5, 2.0]),
            registry,
            varmap,
            &ExecContext::cpu(),
        )
    }

    fn var_names(varmap: &VarMap) -> Vec<String> {
        let data = varmap.data().lock().unwrap();
        data.keys().cloned().collect()
    }

    #[test]
    fn test_loss_is_finite() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut exp = toy_experiment(&varmap)?;
        let batch = SlideBatch::new(vec![toy_slide()?], 3);

        let out = exp.elbo_loss(&batch)?;
        let loss = out.loss.to_scalar::<f32>()?;
        assert!(loss.is_finite());
        assert!(out.image_llik.is_finite());
        assert!(out.expression_llik.is_finite() && out.expression_llik < 0.0);
        assert!(out.complexity().is_finite());

        // decoders were created lazily for both factors
        let names = var_names(&varmap);
        assert!(names.iter().any(|n| n.starts_with("st.factor0.")));
        assert!(names.iter().any(|n| n.starts_with("st.factor1.")));
        Ok(())
    }

    #[test]
    fn test_removed_factor_starts_fresh() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut exp = toy_experiment(&varmap)?;
        exp.ensure_decoders()?;

        exp.remove_factor(1)?;
        assert!(!var_names(&varmap).iter().any(|n| n.starts_with("st.factor1.")));
        assert!(!var_names(&varmap).iter().any(|n| n.starts_with("std.rgt1.")));
        assert!(exp.remove_factor(1).is_err());

        let id = exp.add_factor(Some(Factor::new(-2.0, None)))?;
        assert_eq!(id, 1);
        exp.ensure_decoders()?;

        let data = varmap.data().lock().unwrap();
        let bias = data
            .get("st.factor1.conv.1.bias")
            .ok_or(anyhow!("missing bias"))?
            .as_tensor()
            .to_vec1::<f32>()?;
        assert_eq!(bias, vec![-2.0]);
        let weight = data
            .get("st.factor1.conv.1.weight")
            .ok_or(anyhow!("missing weight"))?
            .as_tensor()
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(weight, 0.0);
        let profile = data
            .get("std.rgt1.q_mu")
            .ok_or(anyhow!("missing profile"))?
            .as_tensor()
            .to_vec1::<f32>()?;
        assert_eq!(profile, vec![0., 0., 0.]);
        drop(data);

        assert_eq!(exp.factors().keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        Ok(())
    }

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn test_recycled_factor_forgets_mixture_channel() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut registry = FactorRegistry::new();
        registry.add(Factor::default());
        registry.add(Factor::default());
        let mut exp = StExperiment::new(
            toy_config(),
            &genes(),
            &[],
            None,
            registry,
            &varmap,
            &ExecContext::cpu(),
        )?;
        let slide = toy_slide()?;

        // factor 1 has learned to take over every pixel
        set_var(
            &varmap,
            "histonet.mixture.conv.1.bias",
            &Tensor::new(&[0f32, 8.], &Device::Cpu)?,
        )?;
        let share = |props: Tensor| -> anyhow::Result<f32> {
            Ok(props.get(1)?.mean_all()?.to_scalar::<f32>()?)
        };
        assert!(share(exp.factor_proportions(&slide)?)? > 0.99);

        exp.remove_factor(1)?;
        assert_eq!(exp.add_factor(None)?, 1);
        let recycled = share(exp.factor_proportions(&slide)?)?;
        assert!((recycled - 0.5).abs() < 1e-2, "recycled share {}", recycled);
        Ok(())
    }

    #[test]
    fn test_loss_composition() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut exp = toy_experiment(&varmap)?;
        let slide = toy_slide()?;

        // one slide out of four
        let bf = 4f32;
        let out = exp.elbo_loss(&SlideBatch::new(vec![slide.clone()], 4))?;
        let expected = -bf * (out.image_llik + out.expression_llik)
            + out.local_complexity
            + out.global_complexity;
        assert!(close(out.loss.to_scalar::<f32>()?, expected, 1e-4));

        // z is local: its cost is scaled by the batch fraction
        let z_cost = exp.histonet().complexity_cost(1.0)?.to_scalar::<f32>()?;
        assert!(close(out.local_complexity, bf * z_cost, 1e-4));

        // count model latents are global: weight 1 whatever the batch
        let global_one = exp.count_model().complexity_cost(1.0)?.to_scalar::<f32>()?;
        let global_bf = exp.count_model().complexity_cost(bf as f64)?.to_scalar::<f32>()?;
        assert_eq!(global_one, global_bf);
        assert!(close(out.global_complexity, global_one, 1e-5));

        // two slides in one step still pay the global cost once
        let out = exp.elbo_loss(&SlideBatch::new(vec![slide.clone(), slide], 2))?;
        let global = exp.count_model().complexity_cost(1.0)?.to_scalar::<f32>()?;
        assert!(close(out.global_complexity, global, 1e-5));
        let expected = -(out.image_llik + out.expression_llik) + out.complexity();
        assert!(close(out.loss.to_scalar::<f32>()?, expected, 1e-4));
        Ok(())
    }

    #[test]
    fn test_gene_maps_pool_to_imputed_means() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut exp = toy_experiment(&varmap)?;
        let slide = toy_slide()?;
        let dev = Device::Cpu;

        let mean_lg = exp.impute(&slide)?;
        let maps = exp.gene_maps(&slide, &[2, 0])?;
        assert_eq!(maps.dims(), &[2, 32, 32]);

        let map_pg = maps.reshape((2, 32 * 32))?.t()?.contiguous()?;
        let pooled_lg: Vec<Vec<f32>> =
            pool_by_label(&slide.label.flatten_all()?, &map_pg, 5)?.to_vec2()?;
        let expected_lg: Vec<Vec<f32>> = mean_lg
            .index_select(&Tensor::new(&[2u32, 0], &dev)?, 1)?
            .to_vec2()?;
        for (p, e) in pooled_lg.iter().flatten().zip(expected_lg.iter().flatten()) {
            assert!(close(*p, *e, 1e-3), "{} vs {}", p, e);
        }

        assert!(exp.gene_maps(&slide, &[3]).is_err());
        Ok(())
    }

    #[test]
    fn test_validation_loss_scores_held_out_spots() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut exp = toy_experiment(&varmap)?;
        let slide = toy_slide()?;

        // only the bottom-right spot (label 4, count row 3) is held out
        let label: Vec<u32> = (0..32 * 32)
            .map(|p| if p / 32 >= 16 && p % 32 >= 16 { 4 } else { 0 })
            .collect();
        let held_out = slide.with_label(Tensor::from_vec(label, (32, 32), &Device::Cpu)?)?;

        let loss = exp.validation_loss(&[held_out])?;
        assert!(loss.is_finite());

        let counts = slide.counts.clone().ok_or(anyhow!("counts"))?;
        let expected = -exp
            .predict_counts(&slide)?
            .log_prob(&counts)?
            .narrow(0, 3, 1)?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert!(close(loss, expected, 1e-3), "{} vs {}", loss, expected);

        assert!(exp.validation_loss(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_impute_and_profiles() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut exp = toy_experiment(&varmap)?;
        let slide = toy_slide()?;

        let mean_lg = exp.impute(&slide)?;
        assert_eq!(mean_lg.dims(), &[4, 3]);
        let min = mean_lg.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min > 0.0);

        let (ids, rate_gk) = exp.gene_profiles()?;
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(rate_gk.dims(), &[3, 2]);

        let props = exp.factor_proportions(&slide)?;
        assert_eq!(props.dims(), &[2, 32, 32]);
        let total = props.sum(0)?.mean_all()?.to_scalar::<f32>()?;
        assert!((total - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_no_factors_fails() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut exp = StExperiment::new(
            toy_config(),
            &genes(),
            &[],
            None,
            FactorRegistry::new(),
            &varmap,
            &ExecContext::cpu(),
        )?;
        let batch = SlideBatch::new(vec![toy_slide()?], 1);
        assert!(exp.elbo_loss(&batch).is_err());
        Ok(())
    }
}
