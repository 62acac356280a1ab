//! Parametric distributions used by the variational models.
//!
//! Every distribution is an immutable value object: changing a
//! parameter means building a new one. Samples drawn by
//! [`Normal::rsample`] stay on the autodiff graph so that gradients
//! reach the location and scale (reparameterization trick).

use crate::candle_loss_functions::lgamma_approx;
use candle_core::{bail, DType, Device, Result, Tensor};
use rand_distr::{Distribution as RandDistribution, Gamma, Poisson};

/// ln(2π)
const LN_2PI: f64 = 1.8378770664093453;

pub trait Distribution {
    /// Draw one sample with the shape of the parameters
    fn sample(&self) -> Result<Tensor>;

    /// Element-wise log density (or mass) of `value`
    fn log_prob(&self, value: &Tensor) -> Result<Tensor>;

    /// Element-wise expectation
    fn mean(&self) -> Result<Tensor>;
}

/// softplus(x) = log(1 + exp(x)), evaluated as relu(x) + log1p(exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()? + tail
}

/// inverse of softplus for a positive scalar: log(exp(y) - 1)
pub fn inv_softplus(y: f64) -> f64 {
    if y > 20.0 {
        y
    } else {
        y.exp_m1().ln()
    }
}

/// log σ(x) = -softplus(-x)
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    softplus(&x.neg()?)?.neg()
}

////////////////////////////
// Gaussian distributions //
////////////////////////////

#[derive(Clone, Debug)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
}

impl Normal {
    /// `N(loc, scale)` where `scale` is already positive and
    /// broadcastable to `loc`
    pub fn new(loc: Tensor, scale: Tensor) -> Result<Self> {
        let scale = scale.broadcast_as(loc.shape())?;
        Ok(Self { loc, scale })
    }

    /// `N(loc, softplus(raw_scale))`, the unconstrained parameterization
    /// used for trainable posteriors and priors
    pub fn softplus(loc: &Tensor, raw_scale: &Tensor) -> Result<Self> {
        Self::new(loc.clone(), softplus(raw_scale)?)
    }

    /// `N(0, 1)` with the given shape
    pub fn standard<S: Into<candle_core::Shape>>(
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = shape.into();
        Self::new(
            Tensor::zeros(&shape, dtype, device)?,
            Tensor::ones(&shape, dtype, device)?,
        )
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Apply the same transformation to both parameters, e.g., cropping
    pub fn map<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        Ok(Self {
            loc: f(&self.loc)?,
            scale: f(&self.scale)?,
        })
    }

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    ///
    pub fn rsample(&self) -> Result<Tensor> {
        let eps = Tensor::randn_like(&self.loc, 0., 1.)?;
        self.loc.add(&self.scale.mul(&eps)?)
    }
}

impl Distribution for Normal {
    fn sample(&self) -> Result<Tensor> {
        self.rsample()
    }

    /// log N(x; μ, σ) = -0.5 * [(x-μ)²/σ² + 2 ln σ + ln 2π]
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let z = value.broadcast_sub(&self.loc)?.broadcast_div(&self.scale)?;
        let log_scale = self.scale.log()?;
        let quad = (z.sqr()? * 0.5)?;
        quad.broadcast_add(&log_scale)?.affine(-1.0, -0.5 * LN_2PI)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.loc.clone())
    }
}

///////////////////////////
// Deterministic (Delta) //
///////////////////////////

/// A point mass; used to expose deterministic intermediate maps
/// (e.g., per-pixel factor proportions) as model outputs
#[derive(Clone, Debug)]
pub struct Delta {
    value: Tensor,
}

impl Delta {
    pub fn new(value: Tensor) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }
}

impl Distribution for Delta {
    fn sample(&self) -> Result<Tensor> {
        Ok(self.value.clone())
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let hit = value.broadcast_eq(&self.value)?;
        let zeros = hit.zeros_like()?.to_dtype(self.value.dtype())?;
        let neg_inf = (zeros.ones_like()? * f64::NEG_INFINITY)?;
        hit.where_cond(&zeros, &neg_inf)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.value.clone())
    }
}

///////////////////////
// Negative Binomial //
///////////////////////

/// Negative binomial over counts with `total_count` r and success
/// `logits` ℓ (the torch parameterization):
///
/// ```text
/// log P(k) = lgamma(k + r) - lgamma(r) - lgamma(k + 1)
///          + r * log σ(-ℓ) + k * log σ(ℓ)
/// E[k] = r * exp(ℓ)
/// ```
#[derive(Clone, Debug)]
pub struct NegativeBinomial {
    total_count: Tensor,
    logits: Tensor,
}

impl NegativeBinomial {
    pub fn new(total_count: Tensor, logits: Tensor) -> Result<Self> {
        let logits = logits.broadcast_as(total_count.shape())?.contiguous()?;
        Ok(Self {
            total_count,
            logits,
        })
    }

    pub fn total_count(&self) -> &Tensor {
        &self.total_count
    }

    pub fn logits(&self) -> &Tensor {
        &self.logits
    }
}

impl Distribution for NegativeBinomial {
    /// Gamma-Poisson draw; not differentiable
    fn sample(&self) -> Result<Tensor> {
        let device = self.total_count.device().clone();
        let dtype = self.total_count.dtype();
        let dims = self.total_count.dims().to_vec();

        let r = self
            .total_count
            .flatten_all()?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;
        let odds = self
            .logits
            .flatten_all()?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F64)?
            .exp()?
            .to_vec1::<f64>()?;

        let mut rng = rand::rng();
        let mut draws = Vec::with_capacity(r.len());
        for (&r, &odds) in r.iter().zip(odds.iter()) {
            if r <= 0.0 || odds <= 0.0 {
                draws.push(0.0);
                continue;
            }
            let gamma = match Gamma::new(r, odds) {
                Ok(g) => g,
                Err(e) => bail!("invalid negative binomial parameters: {}", e),
            };
            let lambda = gamma.sample(&mut rng);
            if lambda <= 0.0 {
                draws.push(0.0);
                continue;
            }
            let poisson = match Poisson::new(lambda) {
                Ok(p) => p,
                Err(e) => bail!("invalid poisson rate {}: {}", lambda, e),
            };
            draws.push(poisson.sample(&mut rng));
        }

        Tensor::from_vec(draws, dims, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(&device)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let r = &self.total_count;
        let k = value.to_dtype(r.dtype())?;

        let lgamma_k_r = lgamma_approx(&k.add(r)?)?;
        let lgamma_r = lgamma_approx(r)?;
        let lgamma_k_1 = lgamma_approx(&(&k + 1.0)?)?;

        let r_log_q = r.mul(&log_sigmoid(&self.logits.neg()?)?)?;
        let k_log_p = k.mul(&log_sigmoid(&self.logits)?)?;

        ((lgamma_k_r - lgamma_r)? - lgamma_k_1)?
            .add(&r_log_q)?
            .add(&k_log_p)
    }

    fn mean(&self) -> Result<Tensor> {
        self.total_count.mul(&self.logits.exp()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_log_prob_standard() -> Result<()> {
        let dev = Device::Cpu;
        let normal = Normal::standard(3, DType::F32, &dev)?;
        let x = Tensor::new(&[0f32, 1., -2.], &dev)?;
        let lp: Vec<f32> = normal.log_prob(&x)?.to_vec1()?;

        for (v, x) in lp.iter().zip([0f64, 1., -2.]) {
            let expected = -0.5 * (x * x + LN_2PI);
            assert!((*v as f64 - expected).abs() < 1e-5, "{} vs {}", v, expected);
        }
        Ok(())
    }

    #[test]
    fn test_softplus_positive_and_inverse() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-30f32, -5., 0., 5., 30.], &dev)?;
        let y: Vec<f32> = softplus(&x)?.to_vec1()?;
        assert!(y.iter().all(|&v| v >= 0.0));
        assert!((y[2] - 2f32.ln()).abs() < 1e-6);
        assert!((y[4] - 30.0).abs() < 1e-4);

        let back = inv_softplus(1.0);
        let fwd: f32 = softplus(&Tensor::new(back as f32, &dev)?)?.to_scalar()?;
        assert!((fwd - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_negative_binomial_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        // r = 1, logits = 0 => geometric with p = 1/2: P(k) = 0.5^(k+1)
        let nb = NegativeBinomial::new(
            Tensor::new(&[1f32, 1., 1.], &dev)?,
            Tensor::new(&[0f32], &dev)?,
        )?;
        let k = Tensor::new(&[0f32, 1., 3.], &dev)?;
        let lp: Vec<f32> = nb.log_prob(&k)?.to_vec1()?;
        for (v, k) in lp.iter().zip([0f32, 1., 3.]) {
            let expected = (k + 1.0) * 0.5f32.ln();
            assert!((v - expected).abs() < 0.05, "{} vs {}", v, expected);
        }

        let mean: Vec<f32> = nb.mean()?.to_vec1()?;
        assert_eq!(mean, vec![1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_negative_binomial_sample_mean() -> Result<()> {
        let dev = Device::Cpu;
        // r = 3, odds = 2 => E[k] = 6
        let n = 20_000;
        let nb = NegativeBinomial::new(
            Tensor::full(3f32, n, &dev)?,
            Tensor::new(&[2f32.ln()], &dev)?,
        )?;
        let draws = nb.sample()?;
        assert_eq!(draws.dims(), &[n]);

        let draws: Vec<f32> = draws.to_vec1()?;
        assert!(draws.iter().all(|&k| k >= 0.0 && k.fract() == 0.0));
        let mean = draws.iter().sum::<f32>() / n as f32;
        assert!((mean - 6.0).abs() < 0.2, "sample mean {}", mean);
        Ok(())
    }

    #[test]
    fn test_delta_log_prob() -> Result<()> {
        let dev = Device::Cpu;
        let delta = Delta::new(Tensor::new(&[1f32, 2.], &dev)?);
        let lp: Vec<f32> = delta.log_prob(&Tensor::new(&[1f32, 3.], &dev)?)?.to_vec1()?;
        assert_eq!(lp[0], 0.0);
        assert!(lp[1].is_infinite() && lp[1] < 0.0);
        Ok(())
    }
}
