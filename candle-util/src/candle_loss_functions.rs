use candle_core::{Result, Tensor};

use crate::candle_distributions::{Distribution, Normal};

/// Closed-form KL divergence between two diagonal Gaussians, element-wise
///
/// KL(q || p) = ln(σp/σq) + (σq² + (μq - μp)²) / (2 σp²) - 1/2
///
/// * `q` - approximate posterior
/// * `p` - prior
///
pub fn gaussian_kl(q: &Normal, p: &Normal) -> Result<Tensor> {
    let var_q = q.scale().sqr()?;
    let var_p = p.scale().sqr()?;
    let diff_sq = q.loc().broadcast_sub(p.loc())?.sqr()?;
    let log_ratio = p.scale().log()?.broadcast_sub(&q.scale().log()?)?;
    let quad = var_q.broadcast_add(&diff_sq)?.broadcast_div(&(var_p * 2.0)?)?;
    (log_ratio.broadcast_add(&quad)? - 0.5)
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    // Clamp x to avoid log(0) issues
    let x_safe = x.clamp(1e-6f32, f32::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let product = ((&x_safe * &x_plus_1)? * &x_plus_2)?;
    let logterm = product.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let log_xp3 = xp3.log()?;

    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * &log_xp3)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// Total log-likelihood of `x` under any distribution, summed over
/// all elements
///
/// * `dist` - distribution with parameters broadcastable to `x`
/// * `x` - observed data
///
pub fn total_log_likelihood<D: Distribution>(dist: &D, x: &Tensor) -> Result<Tensor> {
    dist.log_prob(x)?.sum_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_lgamma_approx() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::from_vec(vec![1.0f32, 2.0, 5.0, 10.0], (4,), &device)?;
        let vals: Vec<f32> = lgamma_approx(&x)?.to_vec1()?;

        // lgamma(1) = 0, lgamma(2) = 0, lgamma(5) ≈ 3.178, lgamma(10) ≈ 12.802
        assert!((vals[0] - 0.0).abs() < 0.1);
        assert!((vals[1] - 0.0).abs() < 0.1);
        assert!((vals[2] - 3.178).abs() < 0.2);
        assert!((vals[3] - 12.802).abs() < 0.5);
        Ok(())
    }

    #[test]
    fn test_gaussian_kl_zero_for_identical() -> Result<()> {
        let dev = Device::Cpu;
        let p = Normal::standard(4, DType::F32, &dev)?;
        let kl = gaussian_kl(&p, &p)?.sum_all()?.to_scalar::<f32>()?;
        assert!(kl.abs() < 1e-6);

        let q = Normal::new(
            Tensor::new(&[1f32], &dev)?,
            Tensor::new(&[2f32], &dev)?,
        )?;
        let p = Normal::standard(1, DType::F32, &dev)?;
        let kl = gaussian_kl(&q, &p)?.sum_all()?.to_scalar::<f32>()?;
        // ln(1/2) + (4 + 1) / 2 - 1/2
        let expected = 0.5f32.ln() + 2.5 - 0.5;
        assert!((kl - expected).abs() < 1e-5);
        Ok(())
    }
}
