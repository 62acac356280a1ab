//! Persist and restore a trained experiment.
//!
//! * `{prefix}.state.json` - configuration, gene list, covariate
//!   schema, factor registry, optimizer settings and epoch
//! * `{prefix}.params.safetensors` - every network parameter by name

use crate::count_model::Covariate;
use crate::experiment::{StConfig, StExperiment};
use crate::factors::FactorRegistry;

use candle_util::candle_inference::ExecContext;
use candle_util::candle_nn::VarMap;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingState {
    pub config: StConfig,
    pub genes: Vec<Box<str>>,
    pub covariates: Vec<Covariate>,
    pub registry: FactorRegistry,
    pub learning_rate: f32,
    /// number of finished epochs
    pub epoch: usize,
}

impl TrainingState {
    pub fn of(exp: &StExperiment, learning_rate: f32, epoch: usize) -> Self {
        Self {
            config: exp.config().clone(),
            genes: exp.count_model().genes().to_vec(),
            covariates: exp.count_model().covariates().to_vec(),
            registry: exp.registry().clone(),
            learning_rate,
            epoch,
        }
    }
}

/// `({prefix}.state.json, {prefix}.params.safetensors)`
pub fn state_files(prefix: &str) -> (String, String) {
    (
        format!("{}.state.json", prefix),
        format!("{}.params.safetensors", prefix),
    )
}

/// Write the metadata and all parameters; every active factor gets a
/// decoder first so that the parameter file is complete
pub fn save_state(
    exp: &mut StExperiment,
    learning_rate: f32,
    epoch: usize,
    prefix: &str,
) -> anyhow::Result<()> {
    exp.ensure_decoders()?;
    let (json_file, params_file) = state_files(prefix);

    let state = TrainingState::of(exp, learning_rate, epoch);
    serde_json::to_writer_pretty(BufWriter::new(File::create(&json_file)?), &state)?;
    exp.varmap().save(&params_file)?;

    info!("saved state to {} and {}", json_file, params_file);
    Ok(())
}

/// Rebuild the experiment from `prefix` and overwrite its freshly
/// initialized parameters with the stored ones
pub fn load_state(prefix: &str, ctx: &ExecContext) -> anyhow::Result<(StExperiment, TrainingState)> {
    let (json_file, params_file) = state_files(prefix);
    let state: TrainingState = serde_json::from_reader(BufReader::new(
        File::open(&json_file)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {}", json_file, e))?,
    ))?;

    let mut varmap = VarMap::new();
    let mut exp = StExperiment::new(
        state.config.clone(),
        &state.genes,
        &state.covariates,
        None,
        state.registry.clone(),
        &varmap,
        ctx,
    )?;
    exp.ensure_decoders()?;
    varmap.load(&params_file)?;

    info!(
        "loaded state from {} (epoch {}, {} factors)",
        prefix,
        state.epoch,
        state.registry.len()
    );
    Ok((exp, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::Factor;
    use crate::histonet::HistonetConfig;

    fn param(varmap: &VarMap, name: &str) -> anyhow::Result<Vec<f32>> {
        let data = varmap.data().lock().map_err(|_| anyhow::anyhow!("lock"))?;
        let var = data.get(name).ok_or(anyhow::anyhow!("no {}", name))?;
        Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_state_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let prefix = dir.path().join("run");
        let prefix = prefix.to_str().ok_or(anyhow::anyhow!("path"))?;

        let config = StConfig {
            histonet: HistonetConfig {
                num_factors: 3,
                latent_size: 4,
                nf: 2,
                evidence_channels: 0,
                mixture_bias: -1.0,
            },
            default_scale: 2.0,
        };
        let genes: Vec<Box<str>> = vec!["x".into(), "y".into()];
        let mut registry = FactorRegistry::new();
        for _ in 0..3 {
            registry.add(Factor::default());
        }

        let varmap = VarMap::new();
        let mut exp = StExperiment::new(
            config,
            &genes,
            &[Covariate::new("batch", &["a", "b"])],
            Some(&[3.0, 0.5]),
            registry,
            &varmap,
            &ExecContext::cpu(),
        )?;
        exp.remove_factor(1)?;
        exp.add_factor(Some(Factor::new(0.3, Some(vec![1.0, -1.0]))))?;
        exp.remove_factor(2)?;

        save_state(&mut exp, 1e-3, 7, prefix)?;
        let (mut restored, state) = load_state(prefix, &ExecContext::cpu())?;

        assert_eq!(state.epoch, 7);
        assert_eq!(state.learning_rate, 1e-3);
        assert_eq!(restored.config(), exp.config());
        assert_eq!(restored.factors(), exp.factors());
        assert_eq!(restored.count_model().covariates(), exp.count_model().covariates());

        for name in [
            "std.rg.q_mu",
            "std.rgt1.q_mu",
            "st.factor1.conv.1.bias",
            "histonet.mixture.conv.1.bias",
        ] {
            assert_eq!(param(restored.varmap(), name)?, param(&varmap, name)?);
        }

        // the registry keeps its recycling order across save/load
        assert_eq!(restored.add_factor(None)?, 2);
        Ok(())
    }
}
