#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
mod cli;
mod data;
mod error;
mod export;
mod model;
mod predict;
mod schedule;
mod train;
pub mod weights;

#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
pub use cli::run;
pub use data::{load_image, preprocess_image, AugmentConfig, ImageFolder, Subset, CHANNELS, SIZE};
pub use error::{LesionError, Result};
pub use export::{load_model, Exporter};
pub use model::{LayerInfo, LayerKind, Model, ModelConfig, Summary, LABELS};
pub use predict::{predict, predict_image, predict_paths, Output, PredictConfig, Prediction};
pub use schedule::{steps_per_epoch, PlateauConfig, PlateauScheduler};
pub use train::{
    evaluate, fit, train, EpochMetrics, Evaluation, Trained, TrainingConfig, TrainingHistory,
};
