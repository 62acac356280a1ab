mod analyze_st;
mod train_st;

use analyze_st::*;
use train_st::*;

use candle_util::candle_core::Device;
use candle_util::candle_inference::ExecContext;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    /// f32 execution context on this device
    pub fn to_ctx(&self, device_no: usize) -> anyhow::Result<ExecContext> {
        let device = match self {
            ComputeDevice::Metal => Device::new_metal(device_no)?,
            ComputeDevice::Cuda => Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => Device::Cpu,
        };
        Ok(ExecContext::new(device, candle_util::candle_core::DType::F32))
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Latent Expression aNd Tissue Image Learning\n\
		  Joint factorization of histology images and spatial gene expression.\n\
		  Slides are safetensors files with `image`, `label` and `counts`\n\
		  tensors, listed in a tab-separated design file."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit the joint image and expression model",
        long_about = "Fit the joint model by stochastic variational inference:\n\
		      (1) Encode each slide image (and its expression) into a latent map\n\
		      (2) Decode factor proportions and the image from the latent map\n\
		      (3) Explain per-spot counts by negative binomial regression\n\
		          on the proportions pooled within each spot.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Impute spot-level expression from images",
        long_about = "Predict the expected counts of every labelled spot\n\
		      from the slide image alone using a trained state.\n\
		      Optionally draw counts from the predicted distribution.\n"
    )]
    Impute(ImputeArgs),

    #[command(
        about = "Write reconstruction and factor maps",
        long_about = "Write the reconstructed image, the per-pixel factor\n\
		      proportions and the scaled factor activations of\n\
		      every slide to {out}.{slide}.maps.safetensors.\n"
    )]
    Maps(MapsArgs),

    #[command(
        about = "Write spatial expression maps of genes",
        long_about = "Predict the expected expression of the selected genes\n\
		      at every pixel of every slide from the image alone,\n\
		      written to {out}.{slide}.genes.safetensors.\n"
    )]
    Genes(GeneMapsArgs),

    /// write the top genes of every factor of a trained state
    Profiles(ProfilesArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            train_st(args)?;
        }
        Commands::Impute(args) => {
            impute_st(args)?;
        }
        Commands::Maps(args) => {
            slide_maps_st(args)?;
        }
        Commands::Genes(args) => {
            gene_maps_st(args)?;
        }
        Commands::Profiles(args) => {
            gene_profiles_st(args)?;
        }
    }

    info!("Done");
    Ok(())
}
