use crate::ComputeDevice;

use lentil::common_io::{mkdir_parent, write_tsv};
use lentil::experiment::StExperiment;
use lentil::gene_selection::{rank_profiles, select_genes};
use lentil::slide_data::{SlideData, SlideDesign};
use lentil::training_state::load_state;

use candle_util::candle_core::{safetensors, Device, Tensor};
use candle_util::candle_distributions::Distribution;
use candle_util::candle_inference::ExecContext;
use clap::Args;
use log::info;
use std::collections::HashMap;

#[derive(Args, Debug)]
pub struct SlideAnalysisArgs {
    #[arg(
        required = true,
        help = "Saved state prefix",
        long_help = "Prefix of {prefix}.state.json and {prefix}.params.safetensors."
    )]
    state: Box<str>,

    #[arg(
        required = true,
        help = "Design file",
        long_help = "Design file listing the slides to analyze.\n\
		     Counts in the slide files are ignored; covariate columns\n\
		     must use the categories seen in training."
    )]
    design_file: Box<str>,

    #[arg(long, short, required = true, help = "Output header")]
    out: Box<str>,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device ordinal (cuda/metal)")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

#[derive(Args, Debug)]
pub struct ImputeArgs {
    #[command(flatten)]
    slides: SlideAnalysisArgs,

    #[arg(
        long,
        help = "Also draw counts",
        long_help = "Also write one negative binomial draw per spot and gene\n\
		     to {out}.{slide}.sampled.tsv.gz."
    )]
    sample: bool,
}

#[derive(Args, Debug)]
pub struct MapsArgs {
    #[command(flatten)]
    slides: SlideAnalysisArgs,
}

#[derive(Args, Debug)]
pub struct GeneMapsArgs {
    #[command(flatten)]
    slides: SlideAnalysisArgs,

    #[arg(
        long = "gene",
        short = 'g',
        required = true,
        help = "Genes to map (repeatable)",
        long_help = "Gene names, or case-insensitive patterns unless\n\
		     --exact is given. Repeat the option for several genes."
    )]
    genes: Vec<Box<str>>,

    #[arg(long, help = "Match gene names exactly")]
    exact: bool,
}

#[derive(Args, Debug)]
pub struct ProfilesArgs {
    #[arg(
        required = true,
        help = "Saved state prefix",
        long_help = "Prefix of {prefix}.state.json and {prefix}.params.safetensors."
    )]
    state: Box<str>,

    #[arg(
        help = "Genes to report",
        long_help = "Gene names, or case-insensitive patterns unless --exact\n\
		     is given. All genes are candidates if none are listed."
    )]
    genes: Vec<Box<str>>,

    #[arg(long = "factor", short = 'k', help = "Factors to report (repeatable; default: all)")]
    factors: Vec<usize>,

    #[arg(
        long,
        default_value_t = 25,
        help = "Top genes per factor",
        long_help = "Number of top genes kept per factor; 0 keeps all."
    )]
    truncate: usize,

    #[arg(long, help = "Match gene names exactly")]
    exact: bool,

    #[arg(
        long,
        short,
        required = true,
        help = "Output file",
        long_help = "Ranked factor/gene/rate table at the posterior means,\n\
		     e.g., {out}.profiles.tsv.gz"
    )]
    out: Box<str>,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}

/// the trained experiment and the slides of the design
fn load_analysis(args: &SlideAnalysisArgs) -> anyhow::Result<(StExperiment, Vec<SlideData>)> {
    let ctx = args.device.to_ctx(args.device_no)?;
    let (exp, _) = load_state(&args.state, &ctx)?;
    let design = SlideDesign::from_tsv(&args.design_file)?;
    let slides = design.load_slides(exp.count_model().covariates(), &ctx)?;
    mkdir_parent(&args.out)?;
    Ok((exp, slides))
}

/// spots x genes table with the label of every row
fn write_spot_table(exp: &StExperiment, counts_lg: &Tensor, file: &str) -> anyhow::Result<()> {
    let mut header: Vec<Box<str>> = vec!["label".into()];
    header.extend(exp.count_model().genes().iter().cloned());

    let counts_lg: Vec<Vec<f32>> = counts_lg.to_device(&Device::Cpu)?.to_vec2()?;
    let rows: Vec<Vec<String>> = counts_lg
        .iter()
        .enumerate()
        .map(|(l, row)| {
            std::iter::once((l + 1).to_string())
                .chain(row.iter().map(|x| x.to_string()))
                .collect()
        })
        .collect();
    write_tsv(&header, &rows, file)
}

/// Expected counts of every spot of every slide, predicted from the
/// image alone
pub fn impute_st(args: &ImputeArgs) -> anyhow::Result<()> {
    init_logger(args.slides.verbose);
    let (mut exp, slides) = load_analysis(&args.slides)?;
    let out = &args.slides.out;

    for slide in slides.iter() {
        info!("imputing slide {}", slide.name);
        let expression = exp.predict_counts(slide)?;
        write_spot_table(
            &exp,
            &expression.mean()?,
            &format!("{}.{}.impute.tsv.gz", out, slide.name),
        )?;
        if args.sample {
            write_spot_table(
                &exp,
                &expression.sample()?,
                &format!("{}.{}.sampled.tsv.gz", out, slide.name),
            )?;
        }
    }
    Ok(())
}

/// Reconstructed image, factor proportions and factor activations of
/// every slide
pub fn slide_maps_st(args: &MapsArgs) -> anyhow::Result<()> {
    init_logger(args.slides.verbose);
    let (mut exp, slides) = load_analysis(&args.slides)?;

    for slide in slides.iter() {
        info!("mapping slide {}", slide.name);
        let maps = exp.slide_maps(slide)?;
        let tensors: HashMap<&str, Tensor> = [
            ("reconstruction", maps.reconstruction.to_device(&Device::Cpu)?),
            ("proportions", maps.proportions.to_device(&Device::Cpu)?),
            ("activations", maps.activations.to_device(&Device::Cpu)?),
        ]
        .into();
        safetensors::save(
            &tensors,
            format!("{}.{}.maps.safetensors", args.slides.out, slide.name),
        )?;
    }
    Ok(())
}

/// Per-pixel expected expression of selected genes on every slide
pub fn gene_maps_st(args: &GeneMapsArgs) -> anyhow::Result<()> {
    init_logger(args.slides.verbose);
    let (mut exp, slides) = load_analysis(&args.slides)?;

    let genes = exp.count_model().genes().to_vec();
    let gene_idx = select_genes(&genes, &args.genes, !args.exact)?;
    info!("mapping {} genes", gene_idx.len());

    for slide in slides.iter() {
        let maps_xhw = exp.gene_maps(slide, &gene_idx)?.to_device(&Device::Cpu)?;
        let tensors = gene_idx
            .iter()
            .enumerate()
            .map(|(j, &g)| Ok((genes[g].to_string(), maps_xhw.get(j)?)))
            .collect::<anyhow::Result<HashMap<String, Tensor>>>()?;
        safetensors::save(
            &tensors,
            format!("{}.{}.genes.safetensors", args.slides.out, slide.name),
        )?;
    }
    Ok(())
}

/// Top genes of each factor of a trained model
pub fn gene_profiles_st(args: &ProfilesArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let (mut exp, _) = load_state(&args.state, &ExecContext::cpu())?;
    let genes = exp.count_model().genes().to_vec();
    let gene_idx = select_genes(&genes, &args.genes, !args.exact)?;
    let (ids, rate_gk) = exp.gene_profiles()?;

    let truncate = (args.truncate > 0).then_some(args.truncate);
    let entries = rank_profiles(&genes, &rate_gk, &ids, &args.factors, &gene_idx, truncate)?;

    let header: Vec<Box<str>> = vec!["factor".into(), "gene".into(), "rate".into()];
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| vec![e.factor.to_string(), e.gene.to_string(), e.rate.to_string()])
        .collect();

    mkdir_parent(&args.out)?;
    write_tsv(&header, &rows, &args.out)?;
    info!("wrote {} profile entries to {}", rows.len(), args.out);
    Ok(())
}
