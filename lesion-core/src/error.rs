use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = LesionError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum LesionError {
    #[error("dataset directory {} not found", .0.display())]
    DatasetNotFound(PathBuf),

    #[error("class directory {} contains no images", .0.display())]
    EmptyClass(PathBuf),

    /// The dataset and the model disagree on the number of classes.
    #[error("expected {expected} classes, found {found} in {}", path.display())]
    ClassCount {
        expected: usize,
        found: usize,
        path: PathBuf,
    },

    #[error("failed to decode image {}", path.display())]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to load model from {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },

    #[error("shape mismatch: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("failed to export {}: {reason}", path.display())]
    Export { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LesionError {
    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl std::fmt::Debug) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: format!("{reason:?}"),
        }
    }

    pub(crate) fn export(path: impl Into<PathBuf>, reason: impl std::fmt::Debug) -> Self {
        Self::Export {
            path: path.into(),
            reason: format!("{reason:?}"),
        }
    }
}
