use crate::{
    data::{
        AugmentConfig, FullBatches, ImageBatch, ImageBatcher, ImageData, ImageDataSet, ImageFolder,
    },
    error::{LesionError, Result},
    export::Exporter,
    model::{Model, ModelConfig},
    schedule::{steps_per_epoch, PlateauConfig},
    weights::VGG16_IMAGENET,
};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{transform::ShuffledDataset, Dataset},
    },
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    pub augment: AugmentConfig,
    pub plateau: PlateauConfig,
    /// One subdirectory per class
    pub dataset_dir: PathBuf,
    /// Local VGG16 checkpoint, downloaded when absent
    pub weights: Option<PathBuf>,
    #[config(default = true)]
    pub pretrained: bool,
    #[config(default = 20)]
    pub num_epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-4)]
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

pub struct Trained<B: AutodiffBackend, O> {
    pub model: Model<B>,
    pub optimizer: O,
    pub history: TrainingHistory,
}

/// Sample weighted running loss and accuracy.
#[derive(Debug, Default)]
struct Accumulator {
    loss: f64,
    correct: usize,
    samples: usize,
}

impl Accumulator {
    fn add(&mut self, loss: f64, correct: usize, samples: usize) {
        self.loss += loss * samples as f64;
        self.correct += correct;
        self.samples += samples;
    }

    fn finish(&self) -> Evaluation {
        Evaluation {
            loss: self.loss / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
        }
    }
}

/// One epoch of `steps_per_epoch` full batches, shuffled with `seed`.
fn epoch_loader<B: Backend>(
    dataset: &ImageDataSet,
    batch_size: usize,
    num_workers: usize,
    seed: u64,
    device: &B::Device,
) -> Arc<dyn DataLoader<ImageBatch<B>>> {
    let dataset = ShuffledDataset::<_, ImageData>::with_seed(dataset.clone().reseed(seed), seed);
    let batcher = ImageBatcher::<B>::new(device.clone());
    DataLoaderBuilder::<Vec<ImageData>, ImageBatch<B>>::new(batcher)
        .batch_size(1)
        .num_workers(num_workers)
        .build(FullBatches::new(dataset, batch_size))
}

pub fn fit<B: AutodiffBackend>(
    config: &TrainingConfig,
    folder: &ImageFolder,
    device: &B::Device,
) -> Result<Trained<B, impl Optimizer<Model<B>, B>>> {
    if folder.num_classes() != config.model.num_classes() {
        return Err(LesionError::ClassCount {
            expected: config.model.num_classes(),
            found: folder.num_classes(),
            path: config.dataset_dir.clone(),
        });
    }
    B::seed(config.seed);

    let dataset_train = ImageDataSet::train(folder, &config.augment);
    let dataset_valid = ImageDataSet::valid(folder, &config.augment);
    let steps = steps_per_epoch(dataset_train.len(), config.batch_size);
    let valid_steps = steps_per_epoch(dataset_valid.len(), config.batch_size);
    info!(
        "Training on {} images ({steps} steps), validating on {} images ({valid_steps} steps)",
        dataset_train.len(),
        dataset_valid.len()
    );
    if steps == 0 {
        warn!("Fewer training images than one batch, the model will not be updated");
    }

    let mut model = config.model.init::<B>(device);
    if config.pretrained {
        let weights = match config.weights {
            Some(ref path) => path.clone(),
            None => VGG16_IMAGENET.download()?,
        };
        info!("Loading pretrained backbone from {}", weights.display());
        model = model.load_pretrained(&weights, device)?;
    }
    println!("{}", model.summary());

    let mut optimizer = config.optimizer.init();
    let mut scheduler = config.plateau.init(config.learning_rate);
    let mut history = TrainingHistory::default();

    for epoch in 1..=config.num_epochs {
        let lr = scheduler.lr();
        let seed = config.seed.wrapping_add(epoch as u64);
        let dataloader_train = epoch_loader::<B>(
            &dataset_train,
            config.batch_size,
            config.num_workers,
            seed,
            device,
        );
        let dataloader_valid = epoch_loader::<B::InnerBackend>(
            &dataset_valid,
            config.batch_size,
            config.num_workers,
            seed,
            device,
        );

        let mut train = Accumulator::default();
        for (iteration, batch) in dataloader_train.iter().enumerate() {
            let samples = batch.targets.dims()[0];
            let step = model.forward_classification(batch.images, batch.targets);
            let loss = step.loss.clone().into_scalar().elem::<f64>();
            train.add(loss, step.correct(), samples);
            debug!("[Train - Epoch {epoch} - Iteration {iteration}] Loss {loss:.4}");

            let grads = GradientsParams::from_grads(step.loss.backward(), &model);
            model = optimizer.step(lr, model, grads);
        }

        let model_valid = model.valid();
        let mut valid = Accumulator::default();
        for batch in dataloader_valid.iter() {
            let samples = batch.targets.dims()[0];
            let step = model_valid.forward_classification(batch.images, batch.targets);
            valid.add(step.loss.clone().into_scalar().elem::<f64>(), step.correct(), samples);
        }

        let (train, valid) = (train.finish(), valid.finish());
        info!(
            "Epoch {epoch}/{}: loss={:.4} accuracy={:.4} val_loss={:.4} val_accuracy={:.4} \
             lr={lr:e}",
            config.num_epochs,
            train.loss,
            train.accuracy,
            valid.loss,
            valid.accuracy
        );
        match valid.loss.is_nan() {
            true => warn!("No validation batch, learning rate left unchanged"),
            false => {
                scheduler.step(valid.loss);
            }
        }
        history.epochs.push(EpochMetrics {
            epoch,
            learning_rate: lr,
            train_loss: train.loss,
            train_accuracy: train.accuracy,
            valid_loss: valid.loss,
            valid_accuracy: valid.accuracy,
        });
    }

    Ok(Trained {
        model,
        optimizer,
        history,
    })
}

/// Runs every batch of the unaugmented dataset, remainder included.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    folder: &ImageFolder,
    batch_size: usize,
    num_workers: usize,
    device: &B::Device,
) -> Evaluation {
    let batcher = ImageBatcher::<B>::new(device.clone());
    let dataloader_test = DataLoaderBuilder::<ImageData, ImageBatch<B>>::new(batcher)
        .batch_size(batch_size)
        .num_workers(num_workers)
        .build(ImageDataSet::test(folder));

    let mut test = Accumulator::default();
    for batch in dataloader_test.iter() {
        let samples = batch.targets.dims()[0];
        let step = model.forward_classification(batch.images, batch.targets);
        test.add(step.loss.clone().into_scalar().elem::<f64>(), step.correct(), samples);
    }
    test.finish()
}

/// Trains, evaluates on the whole dataset and exports into `output_dir`.
pub fn train<B: AutodiffBackend>(
    output_dir: PathBuf,
    config: TrainingConfig,
    device: B::Device,
) -> Result<TrainingHistory> {
    let folder = ImageFolder::open(&config.dataset_dir)?;
    let trained = fit::<B>(&config, &folder, &device)?;

    let model = trained.model.valid();
    let test = evaluate(&model, &folder, config.batch_size, config.num_workers, &device);
    println!("Test Loss: {}", test.loss);
    println!("Test Accuracy: {}", test.accuracy);

    let exporter = Exporter::new(output_dir)?;
    config.save(exporter.dir().join("train_config.json"))?;
    let path = exporter.model(&model, &config.model)?;
    println!("Model saved successfully to {}", path.display());
    exporter.optimizer::<B, _>(trained.optimizer.to_record())?;
    let path = exporter.lite(&model)?;
    println!("Lite model saved successfully to {}", path.display());

    Ok(trained.history)
}
