use crate::error::{LesionError, Result};
use crate::schedule::steps_per_epoch;
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
    tensor::ElementConversion,
};
use image::{imageops::FilterType, RgbImage};
use imageproc::geometric_transformations::{warp_with, Interpolation};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Side length of the square input the network expects.
pub const SIZE: usize = 224;
pub const CHANNELS: usize = 3;

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Random transforms applied to training and validation images.
#[derive(Config, Debug)]
pub struct AugmentConfig {
    /// Degrees, sampled in [-range, range]
    #[config(default = 20.0)]
    pub rotation_range: f32,
    /// Fraction of the width
    #[config(default = 0.1)]
    pub width_shift_range: f32,
    /// Fraction of the height
    #[config(default = 0.1)]
    pub height_shift_range: f32,
    /// Shear angle in degrees
    #[config(default = 0.1)]
    pub shear_range: f32,
    /// Each axis is scaled by a factor in [1 - range, 1 + range]
    #[config(default = 0.1)]
    pub zoom_range: f32,
    #[config(default = true)]
    pub horizontal_flip: bool,
    #[config(default = true)]
    pub vertical_flip: bool,
    /// Leading share of each class held out for validation
    #[config(default = 0.2)]
    pub validation_split: f64,
}

/// Which part of an [`ImageFolder`] to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
    /// Every file, ignoring the validation split.
    All,
}

/// A directory with one subdirectory per class.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    classes: Vec<String>,
    files: Vec<Vec<PathBuf>>,
}

impl ImageFolder {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(LesionError::DatasetNotFound(root.to_path_buf()));
        }
        let mut class_dirs = std::fs::read_dir(root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        class_dirs.sort();

        let mut classes = Vec::with_capacity(class_dirs.len());
        let mut files = Vec::with_capacity(class_dirs.len());
        for dir in class_dirs {
            let mut images = walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(|res| res.ok())
                .filter(|e| e.file_type().is_file() && has_image_extension(e.path()))
                .map(|e| e.into_path())
                .collect::<Vec<_>>();
            if images.is_empty() {
                return Err(LesionError::EmptyClass(dir));
            }
            images.sort();
            classes.push(dir.file_name().unwrap_or_default().to_string_lossy().into_owned());
            files.push(images);
        }
        info!(
            "Found {} images belonging to {} classes in {}",
            files.iter().map(Vec::len).sum::<usize>(),
            classes.len(),
            root.display()
        );
        Ok(Self { classes, files })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Labeled paths of a subset. Per class, the first `split * n` files
    /// (rounded down) are the validation subset and the rest the training one.
    pub fn subset(&self, subset: Subset, split: f64) -> Vec<(PathBuf, usize)> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(label, paths)| {
                let cut = (split * paths.len() as f64) as usize;
                let range = match subset {
                    Subset::Training => cut..paths.len(),
                    Subset::Validation => 0..cut,
                    Subset::All => 0..paths.len(),
                };
                paths[range].iter().map(move |path| (path.clone(), label))
            })
            .collect()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[derive(Debug, Clone)]
pub(crate) struct ImageData {
    data: Vec<f32>,
    label: usize,
}

impl ImageData {
    pub(crate) fn data<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(
            TensorData::new(self.data.clone(), [SIZE, SIZE, CHANNELS]),
            device,
        )
    }

    pub(crate) fn label<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        Tensor::from_data([(self.label as i64).elem::<B::IntElem>()], device)
    }
}

#[derive(Clone)]
pub(crate) struct ImageDataSet {
    inner: Vec<(PathBuf, usize)>,
    augment: Option<AugmentConfig>,
    /// Augmentation of item `i` is drawn from a generator seeded by `(seed, i)`.
    seed: u64,
}

impl ImageDataSet {
    pub(crate) fn train(folder: &ImageFolder, augment: &AugmentConfig) -> Self {
        Self {
            inner: folder.subset(Subset::Training, augment.validation_split),
            augment: Some(augment.clone()),
            seed: 0,
        }
    }

    pub(crate) fn valid(folder: &ImageFolder, augment: &AugmentConfig) -> Self {
        Self {
            inner: folder.subset(Subset::Validation, augment.validation_split),
            augment: Some(augment.clone()),
            seed: 0,
        }
    }

    pub(crate) fn test(folder: &ImageFolder) -> Self {
        Self {
            inner: folder.subset(Subset::All, 0.),
            augment: None,
            seed: 0,
        }
    }

    pub(crate) fn reseed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Dataset<ImageData> for ImageDataSet {
    fn get(&self, index: usize) -> Option<ImageData> {
        self.inner.get(index).map(|(path, label)| {
            let img = load_image(path).unwrap_or_else(|e| panic!("{e}"));
            let img = match self.augment {
                Some(ref augment) => {
                    let mut rng = StdRng::seed_from_u64(
                        self.seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index as u64,
                    );
                    augment.sample(&mut rng).apply(&img)
                }
                None => img,
            };
            ImageData {
                data: normalize(&img),
                label: *label,
            }
        })
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Groups consecutive items into full batches, dropping the remainder.
///
/// Each item is a whole batch, so a loader with a batch size of one yields
/// only full batches no matter how it splits the work between workers.
pub(crate) struct FullBatches<D> {
    inner: D,
    batch_size: usize,
}

impl<D> FullBatches<D> {
    pub(crate) fn new(inner: D, batch_size: usize) -> Self {
        Self { inner, batch_size }
    }
}

impl<D: Dataset<ImageData>> Dataset<Vec<ImageData>> for FullBatches<D> {
    fn get(&self, index: usize) -> Option<Vec<ImageData>> {
        if index >= self.len() {
            return None;
        }
        let start = index * self.batch_size;
        (start..start + self.batch_size)
            .map(|i| self.inner.get(i))
            .collect()
    }

    fn len(&self) -> usize {
        steps_per_epoch(self.inner.len(), self.batch_size)
    }
}

/// Decodable images beneath `dir`, sorted by path.
pub(crate) fn image_files(dir: &Path) -> Vec<PathBuf> {
    let mut paths = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|res| res.ok())
        .filter(|e| e.file_type().is_file() && has_image_extension(e.path()))
        .map(|e| e.into_path())
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[derive(Clone)]
pub(crate) struct ImageBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Debug, Clone)]
pub(crate) struct ImageBatch<B: Backend> {
    /// [batch_size, SIZE, SIZE, CHANNELS]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatcher<B> {
    pub(crate) fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<ImageData, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageData>) -> ImageBatch<B> {
        let images = items
            .iter()
            .map(|item| item.data::<B>(&self.device).unsqueeze::<4>())
            .collect::<Vec<_>>();
        let targets = items
            .iter()
            .map(|item| item.label::<B>(&self.device))
            .collect::<Vec<_>>();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        ImageBatch { images, targets }
    }
}

impl<B: Backend> Batcher<Vec<ImageData>, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<Vec<ImageData>>) -> ImageBatch<B> {
        let items = items.into_iter().flatten().collect();
        <Self as Batcher<ImageData, ImageBatch<B>>>::batch(self, items)
    }
}

/// Decodes an image and stretches it to `SIZE x SIZE` RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<RgbImage> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|source| LesionError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Loaded {} ({}x{})", path.display(), img.width(), img.height());
    Ok(img
        .resize_exact(SIZE as u32, SIZE as u32, FilterType::Nearest)
        .to_rgb8())
}

fn normalize(img: &RgbImage) -> Vec<f32> {
    img.as_raw().iter().map(|&p| p as f32 / 255.0).collect()
}

/// Loads one image as a `[1, SIZE, SIZE, CHANNELS]` tensor with values in [0, 1].
pub fn preprocess_image<B: Backend>(
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let img = load_image(path)?;
    Ok(Tensor::<B, 3>::from_data(
        TensorData::new(normalize(&img), [SIZE, SIZE, CHANNELS]),
        device,
    )
    .unsqueeze::<4>())
}

/// One sampled set of augmentation parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transform {
    /// Maps centered output (row, col) to centered input (row, col).
    matrix: [[f32; 3]; 3],
    flip_h: bool,
    flip_v: bool,
}

impl AugmentConfig {
    pub(crate) fn sample(&self, rng: &mut impl Rng) -> Transform {
        let theta = symmetric(rng, self.rotation_range).to_radians();
        let tx = symmetric(rng, self.height_shift_range) * SIZE as f32;
        let ty = symmetric(rng, self.width_shift_range) * SIZE as f32;
        let shear = symmetric(rng, self.shear_range).to_radians();
        let zx = 1. + symmetric(rng, self.zoom_range);
        let zy = 1. + symmetric(rng, self.zoom_range);

        let rotation = [
            [theta.cos(), -theta.sin(), 0.],
            [theta.sin(), theta.cos(), 0.],
            [0., 0., 1.],
        ];
        let shift = [[1., 0., tx], [0., 1., ty], [0., 0., 1.]];
        let shear = [[1., -shear.sin(), 0.], [0., shear.cos(), 0.], [0., 0., 1.]];
        let zoom = [[zx, 0., 0.], [0., zy, 0.], [0., 0., 1.]];

        Transform {
            matrix: matmul(matmul(matmul(rotation, shift), shear), zoom),
            flip_h: self.horizontal_flip && rng.gen_bool(0.5),
            flip_v: self.vertical_flip && rng.gen_bool(0.5),
        }
    }
}

impl Transform {
    pub(crate) fn apply(&self, img: &RgbImage) -> RgbImage {
        let (w, h) = (img.width() as f32, img.height() as f32);
        let (cx, cy) = ((w - 1.) / 2., (h - 1.) / 2.);
        let m = self.matrix;
        // Out of range samples are clamped to the border pixel.
        let mut out = warp_with(
            img,
            move |x, y| {
                let (r, c) = (y - cy, x - cx);
                let row = m[0][0] * r + m[0][1] * c + m[0][2] + cy;
                let col = m[1][0] * r + m[1][1] * c + m[1][2] + cx;
                (clamp_edge(col, w), clamp_edge(row, h))
            },
            Interpolation::Bilinear,
            image::Rgb([0, 0, 0]),
        );
        if self.flip_h {
            image::imageops::flip_horizontal_in_place(&mut out);
        }
        if self.flip_v {
            image::imageops::flip_vertical_in_place(&mut out);
        }
        out
    }
}

fn symmetric(rng: &mut impl Rng, range: f32) -> f32 {
    match range > 0. {
        true => rng.gen_range(-range..range),
        false => 0.,
    }
}

fn clamp_edge(v: f32, extent: f32) -> f32 {
    // bilinear sampling reads v.floor() + 1, keep it inside the image
    v.clamp(0., (extent - 1.001).max(0.))
}

fn matmul(a: [[f32; 3]; 3], b: [[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let mut out = [[0.; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    fn write_image(path: &Path, w: u32, h: u32) {
        let img = RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 255])
        });
        img.save(path).unwrap();
    }

    fn dataset(counts: &[(&str, usize)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (class, n) in counts {
            let class_dir = dir.path().join(class);
            std::fs::create_dir(&class_dir).unwrap();
            for i in 0..*n {
                write_image(&class_dir.join(format!("{i:02}.png")), 16, 12);
            }
        }
        dir
    }

    #[test]
    fn preprocess_shape_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lesion.png");
        write_image(&path, 640, 426);

        let tensor = preprocess_image::<NdArray>(&path, &Default::default()).unwrap();
        assert_eq!(tensor.dims(), [1, SIZE, SIZE, CHANNELS]);
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(values.iter().any(|v| *v == 1.0));
    }

    #[test]
    fn missing_image_is_a_decode_error() {
        let err = load_image("does/not/exist.jpg").unwrap_err();
        assert!(matches!(err, LesionError::ImageDecode { .. }));
    }

    #[test]
    fn folder_classes_sorted_and_split_per_class() {
        let dir = dataset(&[("2_malignant", 5), ("0_none", 10), ("1_benign", 4)]);
        let folder = ImageFolder::open(dir.path()).unwrap();
        assert_eq!(folder.classes(), ["0_none", "1_benign", "2_malignant"]);

        let valid = folder.subset(Subset::Validation, 0.2);
        let train = folder.subset(Subset::Training, 0.2);
        let all = folder.subset(Subset::All, 0.2);
        // int(0.2 * n): 2, 0, 1
        assert_eq!(valid.len(), 3);
        assert_eq!(train.len(), 16);
        assert_eq!(all.len(), 19);
        assert!(valid[0].0.ends_with("0_none/00.png"));
        assert_eq!(valid.iter().filter(|(_, l)| *l == 2).count(), 1);
    }

    #[test]
    fn folder_errors() {
        let err = ImageFolder::open("no/such/dataset").unwrap_err();
        assert!(matches!(err, LesionError::DatasetNotFound(_)));

        let dir = dataset(&[("benign", 2)]);
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("empty/notes.txt"), "x").unwrap();
        let err = ImageFolder::open(dir.path()).unwrap_err();
        assert!(matches!(err, LesionError::EmptyClass(p) if p.ends_with("empty")));
    }

    #[test]
    fn batches_are_channels_last() {
        let dir = dataset(&[("a", 2), ("b", 1)]);
        let folder = ImageFolder::open(dir.path()).unwrap();
        let dataset = ImageDataSet::test(&folder);
        let items = (0..dataset.len())
            .filter_map(|i| dataset.get(i))
            .collect::<Vec<_>>();
        let batch: ImageBatch<NdArray> = ImageBatcher::new(Default::default()).batch(items);
        assert_eq!(batch.images.dims(), [3, SIZE, SIZE, CHANNELS]);
        assert_eq!(
            batch.targets.into_data().to_vec::<i64>().unwrap(),
            vec![0, 0, 1]
        );
    }

    #[test]
    fn augmentation_keeps_size_and_fills_borders() {
        let img = RgbImage::from_pixel(SIZE as u32, SIZE as u32, image::Rgb([200, 10, 10]));
        let config = AugmentConfig::new()
            .with_rotation_range(45.)
            .with_width_shift_range(0.3);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..4 {
            let out = config.sample(&mut rng).apply(&img);
            assert_eq!(out.dimensions(), img.dimensions());
            // nearest fill: no black corners on a uniform image
            assert!(out
                .pixels()
                .all(|p| p.0.iter().zip([200u8, 10, 10]).all(|(a, b)| a.abs_diff(b) <= 1)));
        }
    }

    #[test]
    fn zero_ranges_give_the_identity() {
        let config = AugmentConfig::new()
            .with_rotation_range(0.)
            .with_width_shift_range(0.)
            .with_height_shift_range(0.)
            .with_shear_range(0.)
            .with_zoom_range(0.)
            .with_horizontal_flip(false)
            .with_vertical_flip(false);
        let transform = config.sample(&mut StdRng::seed_from_u64(0));
        assert!(!transform.flip_h && !transform.flip_v);
        for (i, row) in transform.matrix.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1. } else { 0. };
                assert!((v - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn augmentation_follows_the_seed() {
        let dir = dataset(&[("a", 2), ("b", 2)]);
        let folder = ImageFolder::open(dir.path()).unwrap();
        let augment = AugmentConfig::new().with_validation_split(0.);
        let data = |seed| {
            ImageDataSet::train(&folder, &augment)
                .reseed(seed)
                .get(1)
                .unwrap()
                .data
        };
        assert_eq!(data(5), data(5));
        assert_ne!(data(5), data(6));
    }

    #[test]
    fn full_batches_drop_the_remainder() {
        let dir = dataset(&[("a", 4), ("b", 3)]);
        let folder = ImageFolder::open(dir.path()).unwrap();
        let batches = FullBatches::new(ImageDataSet::test(&folder), 3);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.get(1).unwrap().len(), 3);
        assert!(batches.get(2).is_none());

        let batch: ImageBatch<NdArray> = ImageBatcher::new(Default::default())
            .batch(vec![batches.get(0).unwrap(), batches.get(1).unwrap()]);
        assert_eq!(batch.images.dims(), [6, SIZE, SIZE, CHANNELS]);
    }

    #[test]
    fn image_files_skip_undecodable_formats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write_image(&dir.path().join("a.png"), 4, 4);
        write_image(&dir.path().join("nested/b.jpg"), 4, 4);
        std::fs::write(dir.path().join("logo.svg"), "<svg/>").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = image_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.png"));
        assert!(files[1].ends_with("nested/b.jpg"));
    }
}
