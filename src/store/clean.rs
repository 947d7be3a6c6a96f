//! Clean training sets on disk: an `imgs` tensor plus a `labels` JSON array,
//! the same layout a poisoned set uses.

use super::artifact::{IMGS_FILE, LABELS_FILE};
use super::tensor::{load_tensor, save_tensor};
use crate::models::{Dataset, DatasetId, PoisonsetError, Result, TensorDataset};
use ndarray::Ix4;
use std::fs;
use std::path::Path;
use tracing::info;

/// Load the clean set stored in `dir`, checking its image shape against
/// `dataset`.
pub fn load_clean_set(dir: &Path, dataset: DatasetId) -> Result<TensorDataset> {
    let imgs = dir.join(IMGS_FILE);
    if !imgs.exists() {
        return Err(PoisonsetError::missing(
            format!("clean {dataset} training set"),
            &imgs,
            "run the clean-set phase first",
        ));
    }

    let images = load_tensor(&imgs)?
        .into_dimensionality::<Ix4>()
        .map_err(|_| PoisonsetError::Data(format!("{} is not N×C×H×W", imgs.display())))?;
    let (_, c, h, w) = images.dim();
    if (c, h, w) != dataset.image_shape() {
        return Err(PoisonsetError::Data(format!(
            "{dataset} images must be {:?}, found {c}x{h}x{w}",
            dataset.image_shape()
        )));
    }

    let raw = fs::read_to_string(dir.join(LABELS_FILE))
        .map_err(|e| PoisonsetError::io(format!("reading {dataset} labels"), e))?;
    let labels: Vec<u32> = serde_json::from_str(&raw)
        .map_err(|e| PoisonsetError::Data(format!("Unable to parse {dataset} labels: {e}")))?;
    if let Some(&bad) = labels.iter().find(|&&l| l as usize >= dataset.num_classes()) {
        return Err(PoisonsetError::Data(format!(
            "label {bad} out of range for {dataset}"
        )));
    }

    let set = TensorDataset::new(images, labels)?;
    info!(dataset = %dataset, samples = set.len(), "Loaded clean set");
    Ok(set)
}

/// Write a clean set into `dir` (created if missing).
pub fn save_clean_set(dir: &Path, set: &TensorDataset) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| PoisonsetError::io(format!("creating {}", dir.display()), e))?;
    save_tensor(&dir.join(IMGS_FILE), set.images().view().into_dyn())?;
    let labels = serde_json::to_string(&set.labels()?)
        .map_err(|e| PoisonsetError::Internal(format!("Serializing labels: {e}")))?;
    fs::write(dir.join(LABELS_FILE), labels)
        .map_err(|e| PoisonsetError::io(format!("writing {}", dir.display()), e))
}
