use crate::{
    data::{image_files, preprocess_image, CHANNELS, SIZE},
    error::{LesionError, Result},
    export::load_model,
    model::{Model, LABELS},
};
use burn::{config::Config, prelude::*};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path, path::PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, ValueEnum, Serialize, Deserialize)]
pub enum Output {
    #[default]
    Tty,
    Json,
}

#[derive(Config, Debug)]
pub struct PredictConfig {
    /// Directory holding the exported model
    artifact_dir: PathBuf,
    /// An image, or a directory searched for images
    input: PathBuf,
    output: Output,
    /// Load the half precision weights instead of the full ones
    #[config(default = false)]
    lite: bool,
    #[config(default = 8)]
    batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub index: usize,
    pub label: &'static str,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// Picks the most probable class, the first one on ties.
    pub fn from_probabilities(probabilities: Vec<f32>) -> Result<Self> {
        if probabilities.len() != LABELS.len() {
            return Err(LesionError::ShapeMismatch {
                expected: vec![LABELS.len()],
                found: vec![probabilities.len()],
            });
        }
        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| match p > best.1 {
                true => (i, p),
                false => best,
            });
        Ok(Self {
            index,
            label: LABELS[index],
            confidence,
            probabilities,
        })
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Prediction: {}", self.label)?;
        write!(f, "Confidence: {:.4}", self.confidence)
    }
}

/// Classifies a single image file.
pub fn predict_image<B: Backend>(
    model: &Model<B>,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Prediction> {
    let images = preprocess_image::<B>(path, device)?;
    let dims = images.dims();
    if dims != [1, SIZE, SIZE, CHANNELS] {
        return Err(LesionError::ShapeMismatch {
            expected: vec![1, SIZE, SIZE, CHANNELS],
            found: dims.to_vec(),
        });
    }
    let probabilities = model.forward(images).into_data().iter::<f32>().collect();
    Prediction::from_probabilities(probabilities)
}

/// Classifies `input`, or every image beneath it when it is a directory.
///
/// Files are decoded on the calling thread so an unreadable image surfaces
/// as [`LesionError::ImageDecode`].
pub fn predict_paths<B: Backend>(
    model: &Model<B>,
    input: PathBuf,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<(PathBuf, Prediction)>> {
    if !input.is_dir() {
        let prediction = predict_image(model, &input, device)?;
        return Ok(vec![(input, prediction)]);
    }
    let paths = image_files(&input);
    info!("Found {} images in {}", paths.len(), input.display());

    let mut predictions = Vec::with_capacity(paths.len());
    for chunk in paths.chunks(batch_size.max(1)) {
        let images = chunk
            .iter()
            .map(|path| preprocess_image::<B>(path, device))
            .collect::<Result<Vec<_>>>()?;
        let probabilities = model
            .forward(Tensor::cat(images, 0))
            .into_data()
            .iter::<f32>()
            .collect::<Vec<_>>();
        for (path, probabilities) in chunk.iter().zip(probabilities.chunks(LABELS.len())) {
            let prediction = Prediction::from_probabilities(probabilities.to_vec())?;
            predictions.push((path.clone(), prediction));
        }
    }
    Ok(predictions)
}

pub fn predict<B: Backend>(config: PredictConfig, device: B::Device) -> Result<()> {
    let model = load_model::<B>(&config.artifact_dir, config.lite, &device)?;
    info!(
        "Loaded model from {} ({} params)",
        config.artifact_dir.display(),
        model.num_params()
    );
    let single = !config.input.is_dir();
    let predictions = predict_paths(&model, config.input, config.batch_size, &device)?;

    match config.output {
        Output::Tty if single => {
            for (_, prediction) in &predictions {
                println!("{prediction}");
            }
        }
        Output::Tty => {
            for (path, prediction) in &predictions {
                println!(
                    "{}\t{}\t{:.4}",
                    path.display(),
                    prediction.label,
                    prediction.confidence
                );
            }
        }
        Output::Json => {
            let output = predictions.into_iter().collect::<BTreeMap<_, _>>();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::Exporter;
    use crate::model::tests::tiny_config;
    use burn::backend::NdArray;
    use image::RgbImage;

    #[test]
    fn maps_argmax_to_label() {
        let prediction = Prediction::from_probabilities(vec![0.1, 0.7, 0.2]).unwrap();
        assert_eq!(prediction.index, 1);
        assert_eq!(prediction.label, "Benign");
        assert_eq!(format!("{:.4}", prediction.confidence), "0.7000");
        assert_eq!(
            prediction.to_string(),
            "Prediction: Benign\nConfidence: 0.7000"
        );
    }

    #[test]
    fn ties_pick_the_first_class() {
        let prediction = Prediction::from_probabilities(vec![0.4, 0.2, 0.4]).unwrap();
        assert_eq!(prediction.label, "No Cancer");
    }

    #[test]
    fn wrong_output_width_is_a_shape_mismatch() {
        let err = Prediction::from_probabilities(vec![0.5, 0.5]).unwrap_err();
        assert!(matches!(err, LesionError::ShapeMismatch { .. }));
    }

    #[test]
    fn predicts_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(images.join("nested")).unwrap();
        for name in ["a.jpg", "b.png", "nested/c.png"] {
            RgbImage::from_pixel(64, 48, image::Rgb([180, 90, 60]))
                .save(images.join(name))
                .unwrap();
        }
        std::fs::write(images.join("readme.txt"), "not an image").unwrap();
        std::fs::write(images.join("logo.svg"), "<svg/>").unwrap();

        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<NdArray>(&device);
        Exporter::new(dir.path()).unwrap().model(&model, &config).unwrap();
        let model = load_model::<NdArray>(dir.path(), false, &device).unwrap();

        let single = predict_paths(&model, images.join("a.jpg"), 8, &device).unwrap();
        assert_eq!(single.len(), 1);
        let sum = single[0].1.probabilities.iter().sum::<f32>();
        assert!((sum - 1.0).abs() < 1e-5);

        let all = predict_paths(&model, images.clone(), 2, &device).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[2].0.ends_with("nested/c.png"));
    }

    #[test]
    fn missing_image_is_reported() {
        let device = Default::default();
        let model = tiny_config().init::<NdArray>(&device);
        let err = predict_image(&model, "ISIC_missing.jpg", &device).unwrap_err();
        assert!(matches!(err, LesionError::ImageDecode { .. }));
    }

    #[test]
    fn unreadable_image_in_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("broken.png"), "not a png").unwrap();

        let device = Default::default();
        let model = tiny_config().init::<NdArray>(&device);
        let err = predict_paths(&model, dir.path().to_path_buf(), 8, &device).unwrap_err();
        assert!(matches!(
            err,
            LesionError::ImageDecode { path, .. } if path.ends_with("broken.png")
        ));
    }
}
