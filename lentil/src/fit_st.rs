use crate::experiment::StExperiment;
use crate::slide_data::{SlideBatch, SlideData};
use crate::training_state::save_state;

use candle_util::candle_inference::TrainConfig;
use candle_util::candle_nn::{AdamW, Optimizer};
use candle_util::candle_param_store::var_ids;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Per-epoch losses of a training run
#[derive(Default)]
pub struct LossTrace {
    /// mean minibatch loss
    pub train: Vec<f32>,
    /// held-out loss (empty without validation slides)
    pub validation: Vec<f32>,
}

/// Shuffle the slide indexes and cut them into minibatches
pub fn epoch_batches<R: Rng>(num_slides: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..num_slides).collect();
    order.shuffle(rng);
    order
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Train the experiment by minimizing the negative ELBO over shuffled
/// minibatches of slides.
///
/// The optimizer is rebuilt whenever the set of parameters changes
/// (a factor decoder was created or evicted); its moment estimates
/// restart at that point.
///
/// # Arguments
/// * `exp` - the experiment to train in place
/// * `slides` - the whole dataset
/// * `validation` - slides labelled by their held-out spots
/// * `train_config` - learning rate, batch size, epochs, checkpoints, seed
/// * `start_epoch` - number of epochs already done (when resuming)
/// * `checkpoint_prefix` - where to write `{prefix}.epoch{e}` states
pub fn fit_st(
    exp: &mut StExperiment,
    slides: &[SlideData],
    validation: &[SlideData],
    train_config: &TrainConfig,
    start_epoch: usize,
    checkpoint_prefix: Option<&str>,
) -> anyhow::Result<LossTrace> {
    if slides.is_empty() {
        anyhow::bail!("no slides to train on");
    }
    let batch_size = train_config.batch_size.clamp(1, slides.len());

    let mut rng = match train_config.seed {
        Some(seed) => {
            // the CPU backend has no seedable generator
            if !exp.ctx().device.is_cpu() {
                exp.ctx().device.set_seed(seed)?;
            }
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_rng(&mut rand::rng()),
    };

    exp.ensure_decoders()?;
    let mut param_ids = var_ids(exp.varmap());
    let mut adam = AdamW::new_lr(exp.varmap().all_vars(), train_config.learning_rate.into())?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = LossTrace::default();

    for epoch in start_epoch..(start_epoch + train_config.num_epochs) {
        let mut loss_tot = 0f32;
        let mut nbatch = 0;

        for chunk in epoch_batches(slides.len(), batch_size, &mut rng) {
            exp.ensure_decoders()?;
            let ids = var_ids(exp.varmap());
            if ids != param_ids {
                debug!("parameter set changed; rebuilding the optimizer");
                adam = AdamW::new_lr(exp.varmap().all_vars(), train_config.learning_rate.into())?;
                param_ids = ids;
            }

            let batch = SlideBatch::new(
                chunk.iter().map(|&i| slides[i].clone()).collect(),
                slides.len(),
            );
            let out = exp.elbo_loss(&batch)?;
            adam.backward_step(&out.loss)?;

            let loss = out.loss.to_scalar::<f32>()?;
            debug!(
                "[{}] loss: {}, image llik: {}, expression llik: {}, complexity: {}",
                epoch + 1,
                loss,
                out.image_llik,
                out.expression_llik,
                out.complexity()
            );
            loss_tot += loss;
            nbatch += 1;
        }

        let train_loss = loss_tot / nbatch.max(1) as f32;
        trace.train.push(train_loss);

        if validation.is_empty() {
            if train_config.verbose {
                info!("[{}] loss: {}", epoch + 1, train_loss);
            }
        } else {
            let held_out = exp.validation_loss(validation)?;
            trace.validation.push(held_out);
            if train_config.verbose {
                info!("[{}] loss: {}, validation: {}", epoch + 1, train_loss, held_out);
            }
        }
        pb.inc(1);

        if let (Some(interval), Some(prefix)) = (train_config.checkpoint_interval, checkpoint_prefix)
        {
            if interval > 0 && (epoch + 1) % interval == 0 {
                save_state(
                    exp,
                    train_config.learning_rate,
                    epoch + 1,
                    &format!("{}.epoch{:05}", prefix, epoch + 1),
                )?;
            }
        }
    } // each epoch

    pb.finish_and_clear();
    Ok(trace)
}
