//! Dataset abstractions consumed by the reducer and the poison generators.
//!
//! Images are C×H×W `f32` arrays with values in [0, 1]. Labels are class ids.

use super::{PoisonsetError, Result};
use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Image channels for every supported dataset.
pub const CHANNELS: usize = 3;

/// Datasets the poisoning pipeline knows how to size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetId {
    Cifar10,
    Gtsrb,
    Stl10,
    Imagenette,
}

impl DatasetId {
    pub const ALL: [DatasetId; 4] = [
        DatasetId::Cifar10,
        DatasetId::Gtsrb,
        DatasetId::Stl10,
        DatasetId::Imagenette,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cifar10 => "cifar10",
            Self::Gtsrb => "gtsrb",
            Self::Stl10 => "stl10",
            Self::Imagenette => "imagenette",
        }
    }

    /// Side length of the (square) training images.
    pub fn img_size(self) -> usize {
        match self {
            Self::Cifar10 | Self::Gtsrb => 32,
            Self::Stl10 => 96,
            Self::Imagenette => 224,
        }
    }

    pub fn num_classes(self) -> usize {
        match self {
            Self::Gtsrb => 43,
            Self::Cifar10 | Self::Stl10 | Self::Imagenette => 10,
        }
    }

    /// Expected shape of a single image.
    pub fn image_shape(self) -> (usize, usize, usize) {
        (CHANNELS, self.img_size(), self.img_size())
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetId {
    type Err = PoisonsetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PoisonsetError::InvalidParameter(format!("Undefined dataset '{s}'")))
    }
}

/// Indexed, labeled image collection.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Label of the sample at `index`.
    fn label(&self, index: usize) -> Result<u32>;

    /// Materialize the image at `index`.
    fn image(&self, index: usize) -> Result<Array3<f32>>;

    /// Full label vector, in sample order.
    fn labels(&self) -> Result<Vec<u32>> {
        (0..self.len()).map(|i| self.label(i)).collect()
    }
}

/// In-memory dataset backed by an N×C×H×W image tensor.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    images: Array4<f32>,
    labels: Vec<u32>,
}

impl TensorDataset {
    pub fn new(images: Array4<f32>, labels: Vec<u32>) -> Result<Self> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(PoisonsetError::Data(format!(
                "{} images but {} labels",
                images.len_of(Axis(0)),
                labels.len()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn images(&self) -> &Array4<f32> {
        &self.images
    }

    pub fn into_parts(self) -> (Array4<f32>, Vec<u32>) {
        (self.images, self.labels)
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.labels.len() {
            return Err(PoisonsetError::Data(format!(
                "Sample index {index} out of range (len {})",
                self.labels.len()
            )));
        }
        Ok(())
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn label(&self, index: usize) -> Result<u32> {
        self.check(index)?;
        Ok(self.labels[index])
    }

    fn image(&self, index: usize) -> Result<Array3<f32>> {
        self.check(index)?;
        Ok(self.images.index_axis(Axis(0), index).to_owned())
    }

    fn labels(&self) -> Result<Vec<u32>> {
        Ok(self.labels.clone())
    }
}

/// View over a subset of another dataset's samples, in the given order.
#[derive(Debug)]
pub struct Subset<'a, D: Dataset + ?Sized> {
    base: &'a D,
    indices: Vec<usize>,
}

impl<'a, D: Dataset + ?Sized> Subset<'a, D> {
    pub fn new(base: &'a D, indices: Vec<usize>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= base.len()) {
            return Err(PoisonsetError::Data(format!(
                "Subset index {bad} out of range (len {})",
                base.len()
            )));
        }
        Ok(Self { base, indices })
    }

    /// Positions in the base dataset, in subset order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D: Dataset + ?Sized> Dataset for Subset<'_, D> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn label(&self, index: usize) -> Result<u32> {
        let inner = self.indices.get(index).ok_or_else(|| {
            PoisonsetError::Data(format!(
                "Subset index {index} out of range (len {})",
                self.indices.len()
            ))
        })?;
        self.base.label(*inner)
    }

    fn image(&self, index: usize) -> Result<Array3<f32>> {
        let inner = self.indices.get(index).ok_or_else(|| {
            PoisonsetError::Data(format!(
                "Subset index {index} out of range (len {})",
                self.indices.len()
            ))
        })?;
        self.base.image(*inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Dataset with `counts[c]` samples of class `c`, each image filled with
    /// its own sample index so tests can track where samples went.
    pub(crate) fn synthetic(counts: &[usize], size: usize) -> TensorDataset {
        let total: usize = counts.iter().sum();
        let mut labels = Vec::with_capacity(total);
        for (class, &n) in counts.iter().enumerate() {
            labels.extend(std::iter::repeat(class as u32).take(n));
        }
        let mut images = Array4::<f32>::zeros((total, CHANNELS, size, size));
        for (i, mut img) in images.axis_iter_mut(Axis(0)).enumerate() {
            img.fill((i % 256) as f32 / 255.0);
        }
        TensorDataset::new(images, labels).unwrap()
    }

    #[test]
    fn test_dataset_id_parse() {
        assert_eq!("cifar10".parse::<DatasetId>().unwrap(), DatasetId::Cifar10);
        assert_eq!("GTSRB".parse::<DatasetId>().unwrap(), DatasetId::Gtsrb);
        assert!("mnist".parse::<DatasetId>().is_err());
        assert_eq!(DatasetId::Stl10.img_size(), 96);
        assert_eq!(DatasetId::Gtsrb.num_classes(), 43);
    }

    #[test]
    fn test_tensor_dataset_rejects_length_mismatch() {
        let images = Array4::<f32>::zeros((3, CHANNELS, 4, 4));
        assert!(TensorDataset::new(images, vec![0, 1]).is_err());
    }

    #[test]
    fn test_subset_maps_indices() {
        let ds = synthetic(&[2, 3], 4);
        let sub = Subset::new(&ds, vec![4, 0]).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.labels().unwrap(), vec![1, 0]);
        assert_eq!(sub.image(0).unwrap()[[0, 0, 0]], 4.0 / 255.0);
        assert!(sub.label(2).is_err());
        assert!(Subset::new(&ds, vec![5]).is_err());
    }
}
