use crate::ComputeDevice;

use lentil::count_model::Covariate;
use lentil::experiment::{StConfig, StExperiment, EXPRESSION_EMBEDDING};
use lentil::factors::{Factor, FactorRegistry};
use lentil::fit_st::fit_st;
use lentil::histonet::HistonetConfig;
use lentil::slide_data::{gene_baseline, read_genes, spot_size, SlideData, SlideDesign};
use lentil::training_state::{load_state, save_state};

use candle_util::candle_inference::{ExecContext, TrainConfig};
use candle_util::candle_nn::VarMap;
use clap::Args;
use log::info;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        required = true,
        help = "Design file",
        long_help = "Tab-separated design file with columns `name`, `file`\n\
		     and one column per categorical covariate (batch effects).\n\
		     Each `file` is a safetensors slide with tensors\n\
		     `image` (3 x H x W), `label` (H x W) and `counts` (L x G).\n\
		     An optional `validation` column names safetensors files\n\
		     whose `label` (H x W) marks held-out spots."
    )]
    design_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Gene list file",
        long_help = "Gene names, one per line, in the column order of `counts`."
    )]
    genes: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.state.json\n\
		     - {out}.params.safetensors\n\
		     - {out}.epoch{e}.* checkpoints\n\
		     - {out}.loss.tsv (with a validation column if\n\
		       the design has held-out spots)"
    )]
    out: Box<str>,

    #[arg(
        long,
        short = 'k',
        default_value_t = 50,
        help = "Number of factors",
        long_help = "Number of mixture factors (spatial expression programs)\n\
		     at the start of training."
    )]
    factors: usize,

    #[arg(long, default_value_t = 96, help = "Channels of the latent image code")]
    latent_size: usize,

    #[arg(
        long,
        default_value_t = 16,
        help = "Base width of the image network",
        long_help = "Base width of the image network.\n\
		     The encoder and decoder use nf, 2nf, 4nf, 8nf and 16nf channels."
    )]
    nf: usize,

    #[arg(long, default_value_t = 1.0, help = "Initial per-pixel scale")]
    default_scale: f32,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    learning_rate: f32,

    #[arg(long, short = 'b', default_value_t = 1, help = "Slides per minibatch")]
    batch_size: usize,

    #[arg(long, short = 'i', default_value_t = 100, help = "Number of epochs")]
    epochs: usize,

    #[arg(
        long,
        help = "Checkpoint interval",
        long_help = "Save the training state every {n} epochs\n\
		     as {out}.epoch{e}.state.json and {out}.epoch{e}.params.safetensors."
    )]
    checkpoint_interval: Option<usize>,

    #[arg(long, help = "Random seed (minibatch order)")]
    seed: Option<u64>,

    #[arg(
        long,
        help = "Resume from a saved state",
        long_help = "Resume training from {prefix}.state.json and\n\
		     {prefix}.params.safetensors. Network sizes and factors\n\
		     come from the state; optimizer moments restart."
    )]
    restore: Option<Box<str>>,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device ordinal (cuda/metal)")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

pub fn train_st(args: &TrainArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let ctx = args.device.to_ctx(args.device_no)?;

    // 1. design, slides and the experiment (fresh or restored)
    let design = SlideDesign::from_tsv(&args.design_file)?;

    let (mut exp, start_epoch, slides) = match args.restore.as_deref() {
        Some(prefix) => {
            let (exp, state) = load_state(prefix, &ctx)?;
            let slides = design.load_slides(exp.count_model().covariates(), &ctx)?;
            (exp, state.epoch, slides)
        }
        None => {
            let covariates = design.covariates();
            let slides = design.load_slides(&covariates, &ctx)?;
            let exp = build_experiment(args, &covariates, &slides, &ctx)?;
            (exp, 0, slides)
        }
    };

    let validation = design.load_validation_slides(exp.count_model().covariates(), &ctx)?;
    if !validation.is_empty() {
        info!("{} slides with held-out spots", validation.len());
    }

    let ngenes = exp.count_model().num_genes();
    for s in slides.iter() {
        match &s.counts {
            Some(c) if c.dim(1)? == ngenes => {}
            Some(c) => anyhow::bail!(
                "slide {} has {} genes, but the gene list has {}",
                s.name,
                c.dim(1)?,
                ngenes
            ),
            None => anyhow::bail!("slide {} has no counts", s.name),
        }
    }

    // 2. stochastic variational inference
    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        checkpoint_interval: args.checkpoint_interval,
        seed: args.seed,
        show_progress: true,
        verbose: args.verbose,
    };

    info!(
        "training {} factors on {} slides for {} epochs",
        exp.factors().len(),
        slides.len(),
        args.epochs
    );
    let trace = fit_st(
        &mut exp,
        &slides,
        &validation,
        &train_config,
        start_epoch,
        Some(args.out.as_ref()),
    )?;

    // 3. outputs
    save_state(&mut exp, args.learning_rate, start_epoch + args.epochs, &args.out)?;

    let mut header: Vec<Box<str>> = vec!["epoch".into(), "loss".into()];
    if !trace.validation.is_empty() {
        header.push("validation".into());
    }
    let rows: Vec<Vec<f32>> = trace
        .train
        .iter()
        .enumerate()
        .map(|(e, &l)| {
            let mut row = vec![(start_epoch + e + 1) as f32, l];
            row.extend(trace.validation.get(e));
            row
        })
        .collect();
    lentil::common_io::write_tsv(&header, &rows, &format!("{}.loss.tsv", args.out))?;

    Ok(())
}

fn build_experiment(
    args: &TrainArgs,
    covariates: &[Covariate],
    slides: &[SlideData],
    ctx: &ExecContext,
) -> anyhow::Result<StExperiment> {
    let genes = read_genes(&args.genes)?;
    let baseline = gene_baseline(slides)?;
    if baseline.len() != genes.len() {
        anyhow::bail!(
            "count matrices have {} columns, but the gene list has {} genes",
            baseline.len(),
            genes.len()
        );
    }

    // initial mixture logits spread each spot over the factors
    let mixture_bias = -(spot_size(slides)? * args.factors.max(1) as f32).ln();

    let config = StConfig {
        histonet: HistonetConfig {
            num_factors: args.factors,
            latent_size: args.latent_size,
            nf: args.nf,
            evidence_channels: EXPRESSION_EMBEDDING,
            mixture_bias,
        },
        default_scale: args.default_scale,
    };

    let mut registry = FactorRegistry::new();
    for _ in 0..args.factors {
        registry.add(Factor::default());
    }

    let varmap = VarMap::new();
    StExperiment::new(
        config,
        &genes,
        covariates,
        Some(&baseline),
        registry,
        &varmap,
        ctx,
    )
}
