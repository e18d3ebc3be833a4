use crate::error::{LesionError, Result};
use crate::model::{Model, ModelConfig};
use burn::prelude::*;
use burn::record::{
    DefaultRecorder, FileRecorder, HalfPrecisionSettings, NamedMpkFileRecorder, Record, Recorder,
};
use std::path::{Path, PathBuf};
use tracing::info;

pub const MODEL_NAME: &str = "skin_cancer_detection_model";
pub const LITE_NAME: &str = "skin_cancer_detection_model_lite";
pub const OPTIMIZER_NAME: &str = "skin_cancer_detection_optimizer";

/// Half precision weights, without optimizer state.
pub type LiteRecorder = NamedMpkFileRecorder<HalfPrecisionSettings>;

/// Writes model artifacts into one directory.
///
/// The directory is created when missing and existing artifacts are
/// overwritten in place.
pub struct Exporter {
    dir: PathBuf,
}

impl Exporter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full precision weights plus the architecture as JSON.
    pub fn model<B: Backend>(&self, model: &Model<B>, config: &ModelConfig) -> Result<PathBuf> {
        config.save(config_path(&self.dir))?;
        self.save(model, &DefaultRecorder::new(), MODEL_NAME)
    }

    pub fn lite<B: Backend>(&self, model: &Model<B>) -> Result<PathBuf> {
        self.save(model, &LiteRecorder::new(), LITE_NAME)
    }

    pub fn optimizer<B: Backend, R: Record<B>>(&self, record: R) -> Result<PathBuf> {
        let recorder = DefaultRecorder::new();
        let path = self
            .dir
            .join(OPTIMIZER_NAME)
            .with_extension(<DefaultRecorder as FileRecorder<B>>::file_extension());
        Recorder::<B>::record(&recorder, record, path.clone())
            .map_err(|e| LesionError::export(&path, e))?;
        info!("Saved optimizer state to {}", path.display());
        Ok(path)
    }

    fn save<B: Backend, FR: FileRecorder<B>>(
        &self,
        model: &Model<B>,
        recorder: &FR,
        name: &str,
    ) -> Result<PathBuf> {
        let path = self.dir.join(name).with_extension(<FR as FileRecorder<B>>::file_extension());
        model
            .clone()
            .save_file(&path, recorder)
            .map_err(|e| LesionError::export(&path, e))?;
        info!("Saved {} to {}", name, path.display());
        Ok(path)
    }
}

pub(crate) fn config_path(dir: &Path) -> PathBuf {
    dir.join(MODEL_NAME).with_extension("json")
}

/// Rebuilds a model exported by [`Exporter`], from the full or the lite weights.
pub fn load_model<B: Backend>(dir: &Path, lite: bool, device: &B::Device) -> Result<Model<B>> {
    let config_path = config_path(dir);
    let config =
        ModelConfig::load(&config_path).map_err(|e| LesionError::model_load(&config_path, e))?;
    let model = config.init::<B>(device);
    let path = dir.join(if lite { LITE_NAME } else { MODEL_NAME });
    let model = match lite {
        true => model.load_file(&path, &LiteRecorder::new(), device),
        false => model.load_file(&path, &DefaultRecorder::new(), device),
    };
    model.map_err(|e| LesionError::model_load(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_config;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn export_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/artifacts");
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<NdArray>(&device);

        let exporter = Exporter::new(&out).unwrap();
        let full = exporter.model(&model, &config).unwrap();
        let lite = exporter.lite(&model).unwrap();
        assert!(full.ends_with("skin_cancer_detection_model.mpk"));
        assert!(lite.ends_with("skin_cancer_detection_model_lite.mpk"));
        assert!(out.join("skin_cancer_detection_model.json").is_file());

        let images = Tensor::<NdArray, 4>::random([1, 32, 32, 3], Distribution::Default, &device);
        let expected = model.forward(images.clone()).into_data();
        let loaded = load_model::<NdArray>(&out, false, &device).unwrap();
        loaded
            .forward(images.clone())
            .into_data()
            .assert_approx_eq(&expected, 5);
        let loaded = load_model::<NdArray>(&out, true, &device).unwrap();
        loaded.forward(images).into_data().assert_approx_eq(&expected, 2);
    }

    #[test]
    fn second_export_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let exporter = Exporter::new(dir.path()).unwrap();

        let first = config.init::<NdArray>(&device);
        let second = config.init::<NdArray>(&device);
        exporter.model(&first, &config).unwrap();
        exporter.model(&second, &config).unwrap();

        let images = Tensor::<NdArray, 4>::random([1, 32, 32, 3], Distribution::Default, &device);
        let loaded = load_model::<NdArray>(dir.path(), false, &device).unwrap();
        loaded
            .forward(images.clone())
            .into_data()
            .assert_approx_eq(&second.forward(images).into_data(), 5);
    }

    #[test]
    fn missing_artifacts_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model::<NdArray>(dir.path(), false, &Default::default()).unwrap_err();
        assert!(matches!(err, LesionError::ModelLoad { .. }));
    }
}
