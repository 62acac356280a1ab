//! Negative-binomial regression of spot-level gene counts (the STD
//! count model).
//!
//! The log-rate of gene g under factor t is
//!
//! ```text
//! log ρ(g,t) = r + rg(g) + rt(t) + rgt(g,t)
//! ```
//!
//! and the negative-binomial logit is `l + lg(g)`. Every term is a
//! global latent with a mean-field Gaussian posterior. The global and
//! per-gene terms learn their prior; per-factor terms keep `N(0,1)`.
//! Covariates (batch effects) add
//!
//! ```text
//! log ρ(n,g) += Σ_e effect(n,e) * (reff(e) + rgeff(e,g))
//! ℓ(n,g)     += Σ_e effect(n,e) * (leff(e) + lgeff(e,g))
//! ```

use candle_util::candle_distributions::{NegativeBinomial, Normal};
use candle_util::candle_inference::ExecContext;
use candle_util::candle_param_store::{evict_prefix, set_var};
use candle_util::candle_variational::Variational;

use anyhow::bail;
use candle_util::candle_core::{Shape, Tensor};
use candle_util::candle_nn::{Init, VarBuilder, VarMap};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// parameter prefix of the count model in the shared store
pub const COUNT_MODEL_PREFIX: &str = "std";

/// initial unconstrained posterior spread, softplus(-5) ≈ 0.0067
const INIT_RAW_SCALE: f64 = -5.0;

/// A categorical batch/condition variable
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Covariate {
    pub name: Box<str>,
    pub categories: Vec<Box<str>>,
}

impl Covariate {
    pub fn new(name: &str, categories: &[&str]) -> Self {
        Self {
            name: name.into(),
            categories: categories.iter().map(|&c| c.into()).collect(),
        }
    }
}

/// total number of one-hot effect columns
pub fn num_effects(covariates: &[Covariate]) -> usize {
    covariates.iter().map(|c| c.categories.len()).sum()
}

enum PriorParams {
    Learned { p_mu: Tensor, p_sd: Tensor },
    Fixed,
}

struct LatentParams {
    q_mu: Tensor,
    q_sd: Tensor,
    prior: PriorParams,
}

impl LatentParams {
    fn posterior(&self) -> candle_util::candle_core::Result<Normal> {
        Normal::softplus(&self.q_mu, &self.q_sd)
    }

    fn prior(&self, ctx: &ExecContext) -> candle_util::candle_core::Result<Normal> {
        match &self.prior {
            PriorParams::Learned { p_mu, p_sd } => Normal::softplus(p_mu, p_sd),
            PriorParams::Fixed => Normal::standard((), ctx.dtype, &ctx.device),
        }
    }
}

pub struct CountModel {
    genes: Vec<Box<str>>,
    covariates: Vec<Covariate>,
    factor_ids: BTreeSet<usize>,
    params: HashMap<Box<str>, LatentParams>,
    latents: Variational,
    varmap: VarMap,
    ctx: ExecContext,
}

impl CountModel {
    /// Create the count model.
    ///
    /// Variables `std.{latent}.q_mu`, `std.{latent}.q_sd` (and
    /// `p_mu`, `p_sd` for learned priors) are created in `varmap`.
    ///
    /// # Arguments
    /// * `genes` - gene vocabulary, fixes the column order of counts
    /// * `num_factors` - factors `0..num_factors` to register
    /// * `gene_baseline` - mean count per gene to initialize `r` and `rg`
    /// * `covariates` - batch-effect schema
    /// * `varmap` - shared parameter store
    /// * `ctx` - device and dtype
    pub fn new(
        genes: &[Box<str>],
        num_factors: usize,
        gene_baseline: Option<&[f32]>,
        covariates: &[Covariate],
        varmap: &VarMap,
        ctx: &ExecContext,
    ) -> anyhow::Result<Self> {
        let ngenes = genes.len();

        let mut model = Self {
            genes: genes.to_vec(),
            covariates: covariates.to_vec(),
            factor_ids: BTreeSet::new(),
            params: HashMap::new(),
            latents: Variational::new(),
            varmap: varmap.clone(),
            ctx: ctx.clone(),
        };

        model.make_latent("r", 1, true)?;
        model.make_latent("rg", ngenes, true)?;
        model.make_latent("l", 1, true)?;
        model.make_latent("lg", ngenes, true)?;

        let n_effects = num_effects(covariates);
        if n_effects > 0 {
            model.make_latent("reff", n_effects, true)?;
            model.make_latent("leff", n_effects, true)?;
            model.make_latent("rgeff", (n_effects, ngenes), false)?;
            model.make_latent("lgeff", (n_effects, ngenes), false)?;
        }

        if let Some(baseline) = gene_baseline {
            if baseline.len() != ngenes {
                bail!(
                    "size of `gene_baseline` does not match `genes` ({} vs. {})",
                    baseline.len(),
                    ngenes
                );
            }
            model.init_gene_baseline(baseline)?;
        }

        for id in 0..num_factors {
            model.add_factor(id, None)?;
        }

        Ok(model)
    }

    fn make_latent<S: Into<Shape>>(
        &mut self,
        name: &str,
        shape: S,
        learn_prior: bool,
    ) -> anyhow::Result<()> {
        let shape: Shape = shape.into();
        let varmap = self.varmap.clone();
        let vb = VarBuilder::from_varmap(&varmap, self.ctx.dtype, &self.ctx.device)
            .pp(COUNT_MODEL_PREFIX)
            .pp(name);
        let q_mu = vb.get_with_hints(shape.clone(), "q_mu", Init::Const(0.))?;
        let q_sd = vb.get_with_hints(shape.clone(), "q_sd", Init::Const(INIT_RAW_SCALE))?;
        let prior = if learn_prior {
            PriorParams::Learned {
                p_mu: vb.get_with_hints(shape.clone(), "p_mu", Init::Const(0.))?,
                p_sd: vb.get_with_hints(shape, "p_sd", Init::Const(0.))?,
            }
        } else {
            PriorParams::Fixed
        };
        let params = LatentParams { q_mu, q_sd, prior };
        self.latents.register_latent(
            name,
            Some(params.posterior()?),
            params.prior(&self.ctx)?,
            true,
        )?;
        self.params.insert(name.into(), params);
        Ok(())
    }

    fn drop_latent(&mut self, name: &str) -> anyhow::Result<()> {
        self.latents.deregister_latent(name)?;
        self.params.remove(name);
        let evicted = evict_prefix(&self.varmap, &format!("{}.{}.", COUNT_MODEL_PREFIX, name))?;
        debug!("evicted {} parameters of {}", evicted, name);
        Ok(())
    }

    fn param_name(name: &str, field: &str) -> String {
        format!("{}.{}.{}", COUNT_MODEL_PREFIX, name, field)
    }

    /// r ← mean(log b), rg ← log b - mean(log b), for both the
    /// posterior and the prior means
    fn init_gene_baseline(&mut self, baseline: &[f32]) -> anyhow::Result<()> {
        let log_b: Vec<f64> = baseline.iter().map(|&b| (b as f64).ln()).collect();
        let mean = log_b.iter().sum::<f64>() / log_b.len().max(1) as f64;
        let centered: Vec<f32> = log_b.iter().map(|&x| (x - mean) as f32).collect();

        let dev = &self.ctx.device;
        let mean_t = Tensor::new(&[mean as f32], dev)?.to_dtype(self.ctx.dtype)?;
        let centered_t = Tensor::from_vec(centered, log_b.len(), dev)?.to_dtype(self.ctx.dtype)?;

        for field in ["q_mu", "p_mu"] {
            set_var(&self.varmap, &Self::param_name("r", field), &mean_t)?;
            set_var(&self.varmap, &Self::param_name("rg", field), &centered_t)?;
        }
        Ok(())
    }

    /// Register the per-factor terms `rt{id}` and `rgt{id}`; the
    /// posterior mean of `rgt{id}` starts at `profile` (zeros if absent)
    pub fn add_factor(&mut self, id: usize, profile: Option<&[f32]>) -> anyhow::Result<()> {
        let ngenes = self.genes.len();
        if let Some(p) = profile {
            if p.len() != ngenes {
                bail!(
                    "factor {} profile has {} entries but there are {} genes",
                    id,
                    p.len(),
                    ngenes
                );
            }
        }

        let rt = format!("rt{}", id);
        let rgt = format!("rgt{}", id);
        self.make_latent(&rt, 1, false)?;
        self.make_latent(&rgt, ngenes, false)?;

        if let Some(p) = profile {
            let profile_g =
                Tensor::from_vec(p.to_vec(), ngenes, &self.ctx.device)?.to_dtype(self.ctx.dtype)?;
            set_var(&self.varmap, &Self::param_name(&rgt, "q_mu"), &profile_g)?;
        }

        self.factor_ids.insert(id);
        Ok(())
    }

    /// Deregister the per-factor terms and discard their parameters
    pub fn remove_factor(&mut self, id: usize) -> anyhow::Result<()> {
        if !self.factor_ids.remove(&id) {
            bail!("count model has no terms for factor {}", id);
        }
        self.drop_latent(&format!("rt{}", id))?;
        self.drop_latent(&format!("rgt{}", id))?;
        Ok(())
    }

    pub fn genes(&self) -> &[Box<str>] {
        &self.genes
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn covariates(&self) -> &[Covariate] {
        &self.covariates
    }

    pub fn num_effects(&self) -> usize {
        num_effects(&self.covariates)
    }

    /// active factor ids, the column order of [`CountModel::rate_gt`]
    pub fn factor_ids(&self) -> Vec<usize> {
        self.factor_ids.iter().copied().collect()
    }

    pub fn latents(&self) -> &Variational {
        &self.latents
    }

    /// Draw a fresh reparameterized value for every latent from
    /// posteriors rebuilt from the current parameters
    pub fn resample(&mut self) -> anyhow::Result<()> {
        let ids: Vec<Box<str>> = self.latents.ids().map(Box::from).collect();
        for id in ids.iter() {
            let params = match self.params.get(id) {
                Some(p) => p,
                None => bail!("no parameters for latent {}", id),
            };
            let posterior = params.posterior()?;
            let prior = params.prior(&self.ctx)?;
            self.latents.set_posterior(id, posterior)?;
            self.latents.set_prior(id, prior)?;
            self.latents.sample(id)?;
        }
        Ok(())
    }

    /// Pin every latent at its posterior mean (for prediction)
    pub fn use_posterior_means(&mut self) -> anyhow::Result<()> {
        let ids: Vec<Box<str>> = self.latents.ids().map(Box::from).collect();
        for id in ids.iter() {
            let params = match self.params.get(id) {
                Some(p) => p,
                None => bail!("no parameters for latent {}", id),
            };
            let posterior = params.posterior()?;
            self.latents.set_value(id, posterior.loc().clone())?;
            self.latents.set_posterior(id, posterior)?;
        }
        Ok(())
    }

    fn value(&self, id: &str) -> anyhow::Result<Tensor> {
        Ok(self.latents.value(id)?.clone())
    }

    /// Gene by factor rate matrix, exp(r + rg + rt + rgt) (G x K)
    pub fn rate_gt(&self) -> anyhow::Result<Tensor> {
        if self.factor_ids.is_empty() {
            bail!("no active factors");
        }
        let rt = self
            .factor_ids
            .iter()
            .map(|id| self.value(&format!("rt{}", id)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let rgt = self
            .factor_ids
            .iter()
            .map(|id| self.value(&format!("rgt{}", id)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let rt_1k = Tensor::cat(&rt, 0)?.unsqueeze(0)?;
        let rgt_gk = Tensor::stack(&rgt, 1)?;
        let r = self.value("r")?;
        let rg_g1 = self.value("rg")?.unsqueeze(1)?;

        Ok(rg_g1
            .broadcast_add(&r)?
            .broadcast_add(&rt_1k)?
            .broadcast_add(&rgt_gk)?
            .exp()?)
    }

    /// Baseline negative-binomial logit per gene, l + lg (G,)
    pub fn logit(&self) -> anyhow::Result<Tensor> {
        Ok(self.value("lg")?.broadcast_add(&self.value("l")?)?)
    }

    /// Additive log-rate and logit contributions of covariates
    ///
    /// # Returns `(log_rate_ng, logit_ng)`
    fn effect_terms(&self, effects_ne: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
        let (_, ne) = effects_ne.dims2()?;
        if ne != self.num_effects() {
            bail!(
                "effect design has {} columns but the effect terms (reff, rgeff, leff, lgeff) have {}",
                ne,
                self.num_effects()
            );
        }
        let effects_ne = effects_ne.to_dtype(self.ctx.dtype)?;
        let rate_eg = self
            .value("rgeff")?
            .broadcast_add(&self.value("reff")?.unsqueeze(1)?)?;
        let logit_eg = self
            .value("lgeff")?
            .broadcast_add(&self.value("leff")?.unsqueeze(1)?)?;
        Ok((effects_ne.matmul(&rate_eg)?, effects_ne.matmul(&logit_eg)?))
    }

    /// Resample all latents and return the count distribution
    ///
    /// # Arguments
    /// * `x_nk` - factor design matrix (n x K), columns in `factor_ids` order
    /// * `effects_ne` - one-hot covariate design (n x E)
    ///
    /// # Returns
    /// `NegativeBinomial` with `(n x G)` rate and logit
    pub fn forward(
        &mut self,
        x_nk: &Tensor,
        effects_ne: Option<&Tensor>,
    ) -> anyhow::Result<NegativeBinomial> {
        self.resample()?;
        self.predict(x_nk, effects_ne)
    }

    /// Count distribution at the current latent values, without
    /// resampling
    pub fn predict(
        &self,
        x_nk: &Tensor,
        effects_ne: Option<&Tensor>,
    ) -> anyhow::Result<NegativeBinomial> {
        let rate_gk = self.rate_gt()?;
        let (nn, kk) = x_nk.dims2()?;
        if kk != rate_gk.dim(1)? {
            bail!(
                "design matrix has {} columns but there are {} active factors",
                kk,
                rate_gk.dim(1)?
            );
        }
        let mut rate_ng = x_nk.matmul(&rate_gk.t()?.contiguous()?)?;
        let mut logit_ng = self
            .logit()?
            .unsqueeze(0)?
            .broadcast_as((nn, self.num_genes()))?
            .contiguous()?;

        if let Some(eff) = effects_ne {
            if self.num_effects() > 0 {
                let (log_rate_ng, logit_eff_ng) = self.effect_terms(eff)?;
                rate_ng = rate_ng.mul(&log_rate_ng.exp()?)?;
                logit_ng = logit_ng.add(&logit_eff_ng)?;
            } else if eff.dims2()?.1 > 0 {
                bail!(
                    "effect design has {} columns but no covariates were registered",
                    eff.dims2()?.1
                );
            }
        }

        Ok(NegativeBinomial::new(rate_ng, logit_ng)?)
    }

    /// KL-like cost of all terms; every term is global
    pub fn complexity_cost(&self, batch_fraction: f64) -> anyhow::Result<Tensor> {
        Ok(self.latents.complexity_cost(batch_fraction)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_util::candle_core::{DType, Device};
    use candle_util::candle_distributions::Distribution;

    fn genes(n: usize) -> Vec<Box<str>> {
        (0..n).map(|g| format!("g{}", g).into_boxed_str()).collect()
    }

    #[test]
    fn test_gene_baseline_recovers_rates() -> anyhow::Result<()> {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        let baseline = [1.0f32, 4.0, 0.5, 10.0];
        let model = CountModel::new(&genes(4), 3, Some(&baseline), &[], &varmap, &ctx)?;

        let rate: Vec<Vec<f32>> = model.rate_gt()?.to_vec2()?;
        assert_eq!(rate.len(), 4);
        for (g, row) in rate.iter().enumerate() {
            assert_eq!(row.len(), 3);
            for &v in row.iter() {
                assert!((v - baseline[g]).abs() < 1e-4 * baseline[g].max(1.0));
            }
        }
        Ok(())
    }

    #[test]
    fn test_gene_baseline_length_mismatch() {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        let err = CountModel::new(&genes(3), 2, Some(&[1.0, 2.0]), &[], &varmap, &ctx);
        assert!(err.is_err());
        let msg = err.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(msg.contains("gene_baseline"));
    }

    #[test]
    fn test_forward_without_covariates() -> anyhow::Result<()> {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        let mut model = CountModel::new(&genes(5), 2, None, &[], &varmap, &ctx)?;

        let x_nk = Tensor::new(&[[1f32, 0.], [0.5, 2.], [0., 3.]], &Device::Cpu)?;
        let effects = Tensor::zeros((3, 0), DType::F32, &Device::Cpu)?;
        let nb = model.forward(&x_nk, Some(&effects))?;

        let expected = x_nk.matmul(&model.rate_gt()?.t()?.contiguous()?)?;
        let diff = (nb.total_count() - &expected)?
            .abs()?
            .max_keepdim(1)?
            .max_keepdim(0)?
            .flatten_all()?
            .to_vec1::<f32>()?[0];
        assert_eq!(diff, 0.0);
        assert_eq!(nb.logits().dims(), &[3, 5]);

        let logit = model.logit()?.unsqueeze(0)?.broadcast_as((3, 5))?;
        let ldiff = (nb.logits() - logit)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(ldiff, 0.0);

        assert!(model
            .forward(&x_nk, Some(&Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_covariate_effects_shift_rates() -> anyhow::Result<()> {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        let covariates = vec![
            Covariate::new("batch", &["a", "b"]),
            Covariate::new("sex", &["f", "m", "u"]),
        ];
        let mut model = CountModel::new(&genes(3), 2, None, &covariates, &varmap, &ctx)?;
        assert_eq!(model.num_effects(), 5);
        assert_eq!(model.latents().len(), 4 + 4 + 2 * 2);

        let x_nk = Tensor::new(&[[1f32, 1.]], &Device::Cpu)?;
        let effects = Tensor::new(&[[1f32, 0., 0., 1., 0.]], &Device::Cpu)?;
        let nb = model.forward(&x_nk, Some(&effects))?;
        assert_eq!(nb.total_count().dims(), &[1, 3]);

        let counts = Tensor::new(&[[0f32, 3., 1.]], &Device::Cpu)?;
        let llik = nb.log_prob(&counts)?.sum_all()?.to_scalar::<f32>()?;
        assert!(llik.is_finite());

        let bad = Tensor::new(&[[1f32, 0.]], &Device::Cpu)?;
        let err = model.forward(&x_nk, Some(&bad)).err().map(|e| e.to_string());
        assert!(err.unwrap_or_default().contains("effect"));
        Ok(())
    }

    #[test]
    fn test_factor_terms_are_fresh_after_readd() -> anyhow::Result<()> {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        let mut model = CountModel::new(&genes(2), 0, None, &[], &varmap, &ctx)?;
        assert!(model.rate_gt().is_err());

        model.add_factor(0, Some(&[1.0, 2.0]))?;
        model.add_factor(1, None)?;
        assert!(model.add_factor(1, None).is_err());
        assert_eq!(model.factor_ids(), vec![0, 1]);

        model.remove_factor(0)?;
        assert_eq!(model.factor_ids(), vec![1]);
        assert!(model.remove_factor(0).is_err());

        model.add_factor(0, None)?;
        let rate: Vec<Vec<f32>> = model.rate_gt()?.to_vec2()?;
        // the old profile of factor 0 must not come back
        assert_eq!(rate, vec![vec![1., 1.], vec![1., 1.]]);

        let cost = model.complexity_cost(3.0)?.to_scalar::<f32>()?;
        assert!(cost.is_finite());
        Ok(())
    }
}
