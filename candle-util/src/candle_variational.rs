//! Registry of latent variables for variational models.
//!
//! Each latent carries its current sample, its approximate posterior
//! q, its prior p and whether it is shared by the whole dataset
//! (global) or specific to the samples of a minibatch (local).
//! Latents are kept in registration order.

use crate::candle_distributions::{Distribution, Normal};
use candle_core::{bail, DType, Device, Result, Tensor};
use log::debug;

#[derive(Clone, Debug)]
pub struct Latent {
    id: Box<str>,
    value: Option<Tensor>,
    posterior: Option<Normal>,
    prior: Normal,
    is_global: bool,
}

impl Latent {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn posterior(&self) -> Option<&Normal> {
        self.posterior.as_ref()
    }

    pub fn prior(&self) -> &Normal {
        &self.prior
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    /// Σ (log q(v) - log p(v)) at the current value
    pub fn log_ratio(&self) -> Result<Tensor> {
        let (value, posterior) = match (&self.value, &self.posterior) {
            (Some(v), Some(q)) => (v, q),
            _ => bail!("latent {} has not been sampled", self.id),
        };
        let log_q = posterior.log_prob(value)?.sum_all()?;
        let log_p = self.prior.log_prob(value)?.sum_all()?;
        log_q - log_p
    }
}

#[derive(Clone, Debug, Default)]
pub struct Variational {
    latents: Vec<Latent>,
}

impl Variational {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a latent variable under a unique `id`.
    ///
    /// When a posterior is given, the latent starts at the posterior
    /// mean; amortized latents register without one and receive it
    /// from [`Variational::set_posterior`].
    ///
    /// # Arguments
    /// * `id` - unique name of the latent
    /// * `posterior` - initial approximate posterior q
    /// * `prior` - prior p
    /// * `is_global` - shared across the whole dataset
    pub fn register_latent(
        &mut self,
        id: &str,
        posterior: Option<Normal>,
        prior: Normal,
        is_global: bool,
    ) -> Result<()> {
        if self.contains(id) {
            bail!("variable {} has already been registered", id);
        }
        debug!("registering latent variable {}", id);
        let value = posterior.as_ref().map(|q| q.loc().clone());
        self.latents.push(Latent {
            id: id.into(),
            value,
            posterior,
            prior,
            is_global,
        });
        Ok(())
    }

    /// Remove a latent and release its `id`
    pub fn deregister_latent(&mut self, id: &str) -> Result<Latent> {
        match self.latents.iter().position(|x| x.id.as_ref() == id) {
            Some(pos) => {
                debug!("deregistering latent variable {}", id);
                Ok(self.latents.remove(pos))
            }
            None => bail!("variable {} is not registered", id),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.latents.iter().any(|x| x.id.as_ref() == id)
    }

    pub fn get_latent(&self, id: &str) -> Result<&Latent> {
        match self.latents.iter().find(|x| x.id.as_ref() == id) {
            Some(x) => Ok(x),
            None => bail!("variable {} is not registered", id),
        }
    }

    fn get_latent_mut(&mut self, id: &str) -> Result<&mut Latent> {
        match self.latents.iter_mut().find(|x| x.id.as_ref() == id) {
            Some(x) => Ok(x),
            None => bail!("variable {} is not registered", id),
        }
    }

    /// Current value of a latent
    pub fn value(&self, id: &str) -> Result<&Tensor> {
        let latent = self.get_latent(id)?;
        match latent.value.as_ref() {
            Some(v) => Ok(v),
            None => bail!("latent {} has not been sampled", id),
        }
    }

    pub fn set_posterior(&mut self, id: &str, posterior: Normal) -> Result<()> {
        self.get_latent_mut(id)?.posterior = Some(posterior);
        Ok(())
    }

    pub fn set_prior(&mut self, id: &str, prior: Normal) -> Result<()> {
        self.get_latent_mut(id)?.prior = prior;
        Ok(())
    }

    /// Pin the value of `id`, e.g., to its posterior mean for prediction
    pub fn set_value(&mut self, id: &str, value: Tensor) -> Result<()> {
        self.get_latent_mut(id)?.value = Some(value);
        Ok(())
    }

    /// Draw a reparameterized sample from the posterior of `id` and
    /// keep it as the latent's value
    pub fn sample(&mut self, id: &str) -> Result<Tensor> {
        let latent = self.get_latent_mut(id)?;
        let value = match latent.posterior.as_ref() {
            Some(q) => q.rsample()?,
            None => bail!("latent {} has no posterior to sample from", id),
        };
        latent.value = Some(value.clone());
        Ok(value)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.latents.iter().map(|x| x.id.as_ref())
    }

    pub fn latents(&self) -> &[Latent] {
        &self.latents
    }

    pub fn len(&self) -> usize {
        self.latents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latents.is_empty()
    }

    /// Complexity (KL-like) cost of all registered latents
    ///
    /// Σ_latent Σ (log q(v) - log p(v)) * w, where w is
    /// `batch_fraction` for local latents and 1 for global ones.
    ///
    /// * `batch_fraction` - the (dataset size / minibatch size) ratio
    ///   that also scales the minibatch likelihood
    ///
    /// An empty registry costs nothing (an f32 zero on the CPU).
    pub fn complexity_cost(&self, batch_fraction: f64) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for latent in self.latents.iter() {
            let weight = if latent.is_global { 1.0 } else { batch_fraction };
            let term = (latent.log_ratio()? * weight)?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
        match total {
            Some(t) => Ok(t),
            None => Tensor::zeros((), DType::F32, &Device::Cpu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn fixed_normal(loc: f32, scale: f32) -> Result<Normal> {
        let dev = Device::Cpu;
        Normal::new(Tensor::new(&[loc], &dev)?, Tensor::new(&[scale], &dev)?)
    }

    #[test]
    fn test_duplicate_registration_fails() -> Result<()> {
        let mut var = Variational::new();
        var.register_latent("a", Some(fixed_normal(0., 1.)?), fixed_normal(0., 1.)?, true)?;
        let err = var
            .register_latent("a", Some(fixed_normal(0., 1.)?), fixed_normal(0., 1.)?, false)
            .unwrap_err();
        assert!(err.to_string().contains("already been registered"));

        var.deregister_latent("a")?;
        var.register_latent("a", None, fixed_normal(0., 1.)?, false)?;
        assert_eq!(var.len(), 1);
        assert!(var.value("a").is_err());
        Ok(())
    }

    #[test]
    fn test_insertion_order() -> Result<()> {
        let mut var = Variational::new();
        for id in ["z", "r", "a"] {
            var.register_latent(id, None, fixed_normal(0., 1.)?, false)?;
        }
        assert_eq!(var.ids().collect::<Vec<_>>(), vec!["z", "r", "a"]);
        Ok(())
    }

    #[test]
    fn test_complexity_cost_local_global_weights() -> Result<()> {
        let mut var = Variational::new();
        // global latent: value = 1 under q = N(1, 1), p = N(0, 1)
        // log q - log p = 0 - (-0.5) = 0.5
        var.register_latent("g", Some(fixed_normal(1., 1.)?), fixed_normal(0., 1.)?, true)?;
        // local latent: value = 0 under q = N(0, 0.5), p = N(0, 1)
        // log q - log p = -ln(0.5) = ln 2
        var.register_latent("l", Some(fixed_normal(0., 0.5)?), fixed_normal(0., 1.)?, false)?;

        let batch_fraction = 4.0;
        let cost = var.complexity_cost(batch_fraction)?.to_scalar::<f32>()?;
        let expected = 0.5 + batch_fraction as f32 * 2f32.ln();
        assert!((cost - expected).abs() < 1e-5, "{} vs {}", cost, expected);

        let cost_one = var.complexity_cost(1.0)?.to_scalar::<f32>()?;
        assert!((cost_one - (0.5 + 2f32.ln())).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_empty_registry_costs_zero() -> Result<()> {
        let var = Variational::new();
        assert!(var.is_empty());
        assert_eq!(var.complexity_cost(3.0)?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_sample_updates_value() -> Result<()> {
        let dev = Device::Cpu;
        let mut var = Variational::new();
        var.register_latent("z", None, Normal::standard((2, 3), DType::F32, &dev)?, false)?;
        assert!(var.complexity_cost(1.0).is_err());

        var.set_posterior("z", Normal::standard((2, 3), DType::F32, &dev)?)?;
        let z = var.sample("z")?;
        assert_eq!(z.dims(), &[2, 3]);
        // q == p, so the cost vanishes at any value
        let cost = var.complexity_cost(10.0)?.to_scalar::<f32>()?;
        assert!(cost.abs() < 1e-5);
        Ok(())
    }
}
