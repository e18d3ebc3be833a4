//! Pretrained ImageNet weights for the VGG16 backbone.

use crate::error::{LesionError, Result};
use crate::model::BackboneRecord;
use burn::data::network::downloader;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::fs::create_dir_all;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

pub struct Weights {
    pub url: &'static str,
    pub file_name: &'static str,
}

/// torchvision's `VGG16_Weights.IMAGENET1K_V1`
pub const VGG16_IMAGENET: Weights = Weights {
    url: "https://download.pytorch.org/models/vgg16-397923af.pth",
    file_name: "vgg16-397923af.pth",
};

impl Weights {
    /// Returns the cached checkpoint, downloading it on first use.
    pub fn download(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("lesion");
        create_dir_all(&cache_dir)?;
        let path = cache_dir.join(self.file_name);
        if !path.exists() {
            info!("Downloading {} to {}", self.url, path.display());
            let bytes = downloader::download_file_as_bytes(self.url, self.file_name);
            store(&path, &bytes)?;
        }
        Ok(path)
    }
}

/// Writes `bytes` next to `path` and renames the file into place, so an
/// interrupted write never leaves a truncated file at `path`.
fn store(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Position of every convolution inside torchvision's `features` sequential,
/// where each conv is followed by a ReLU and each block by a max-pool.
fn torchvision_indices(convs_per_block: &[usize]) -> Vec<(usize, usize, usize)> {
    let mut index = 0;
    let mut out = vec![];
    for (block, &n) in convs_per_block.iter().enumerate() {
        for conv in 0..n {
            out.push((index, block, conv));
            index += 2;
        }
        index += 1;
    }
    out
}

pub(crate) fn load_vgg16<B: Backend>(
    path: &Path,
    convs_per_block: &[usize],
    device: &B::Device,
) -> Result<BackboneRecord<B>> {
    let args = torchvision_indices(convs_per_block).into_iter().fold(
        LoadArgs::new(path.to_path_buf()),
        |args, (index, block, conv)| {
            args.with_key_remap(
                &format!(r"^features\.{index}\.(.+)"),
                &format!("blocks.{block}.convs.{conv}.$1"),
            )
        },
    );
    PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(args, device)
        .map_err(|e| LesionError::model_load(path, e))
}
