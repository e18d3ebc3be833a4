use crate::{
    predict, train, AugmentConfig, ModelConfig, Output, PlateauConfig, PredictConfig,
    TrainingConfig,
};
use burn::{backend::Autodiff, optim::AdamConfig};
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::{num::NonZeroUsize, path::PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Fine-tune VGG16 on a directory of lesion images and export the model
    Train {
        /// Dataset root with one subdirectory per class, sorted as No Cancer, Benign, Malignant
        #[arg(short, long, default_value = "dataset")]
        dataset_dir: PathBuf,
        /// Directory to save artifacts (created if missing, existing artifacts are overwritten)
        #[arg(short, long, default_value = "skin_cancer_detection")]
        output_dir: PathBuf,
        #[arg(short = 'e', long, default_value = "20")]
        num_epochs: usize,
        #[arg(short, long, default_value = "8")]
        batch_size: NonZeroUsize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "1")]
        num_workers: usize,
        /// Initial learning rate, reduced by 5x when validation loss plateaus
        #[arg(short, long, default_value = "1.0e-4")]
        learning_rate: f64,
        /// Leading layers of the backbone kept frozen
        #[arg(short, long, default_value = "15")]
        frozen_layers: usize,
        /// Path to a torchvision VGG16 checkpoint, downloaded when omitted
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Train the backbone from random weights
        #[arg(long)]
        no_pretrained: bool,
        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Classify an image with an exported model
    Predict {
        /// Directory holding the exported model
        #[arg(short, long, default_value = ".")]
        artifact_dir: PathBuf,
        /// Use the half precision model
        #[arg(long)]
        lite: bool,
        /// Method to output the predictions
        #[arg(short, long, default_value = "tty")]
        output: Output,
        #[arg(short, long, default_value = "8")]
        batch_size: NonZeroUsize,
        /// Image to classify, or a directory of images
        #[arg(default_value = "ISIC_0015251_downsampled_640x426.jpg")]
        input: PathBuf,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch"), target_os = "macos"))]
    let device = burn::backend::candle::CandleDevice::metal(0);
    #[cfg(all(feature = "candle", not(feature = "tch"), not(target_os = "macos")))]
    let device = burn::backend::candle::CandleDevice::cuda(0);

    #[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    let args = Cli::parse();
    match args.subcmd {
        SubCmd::Train {
            dataset_dir,
            output_dir,
            num_epochs,
            batch_size,
            num_workers,
            learning_rate,
            frozen_layers,
            weights,
            no_pretrained,
            seed,
        } => {
            train::<MyAutodiffBackend>(
                output_dir,
                TrainingConfig::new(
                    ModelConfig::new().with_frozen_layers(frozen_layers),
                    AdamConfig::new().with_epsilon(1.0e-7),
                    AugmentConfig::new(),
                    PlateauConfig::new(),
                    dataset_dir,
                )
                .with_num_epochs(num_epochs)
                .with_batch_size(batch_size.get())
                .with_num_workers(num_workers)
                .with_learning_rate(learning_rate)
                .with_weights(weights)
                .with_pretrained(!no_pretrained)
                .with_seed(seed),
                device,
            )?;
        }
        SubCmd::Predict {
            artifact_dir,
            lite,
            output,
            batch_size,
            input,
        } => predict::<MyBackend>(
            PredictConfig::new(artifact_dir, input, output)
                .with_lite(lite)
                .with_batch_size(batch_size.get()),
            device,
        )?,
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "lesion", &mut std::io::stdout());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_must_be_positive() {
        for subcmd in ["train", "predict"] {
            assert!(Cli::try_parse_from(["lesion", subcmd, "-b", "0"]).is_err());
            assert!(Cli::try_parse_from(["lesion", subcmd, "-b", "4"]).is_ok());
        }
    }

    #[test]
    fn train_defaults() {
        let cli = Cli::try_parse_from(["lesion", "train"]).unwrap();
        match cli.subcmd {
            SubCmd::Train {
                batch_size,
                num_epochs,
                frozen_layers,
                ..
            } => {
                assert_eq!(batch_size.get(), 8);
                assert_eq!(num_epochs, 20);
                assert_eq!(frozen_layers, 15);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
