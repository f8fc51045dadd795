//! Class-folder dataset scanning and the deterministic train/validation split
//!
//! The directory is expected to hold one sub-directory per class:
//! ```text
//! Chest-CT-Scan-data/
//! ├── adenocarcinoma/
//! │   ├── 000001.png
//! │   └── ...
//! └── normal/
//!     └── ...
//! ```
//! Labels are assigned in sorted folder-name order.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::utils::error::{PipelineError, Result};

/// File extensions accepted as images
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tif"];

/// A single image file with its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: usize,
    pub class_name: String,
}

/// Which side of a validation split to take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

/// All labelled images found under a class-folder root
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub root_dir: PathBuf,
    pub class_names: Vec<String>,
    /// Grouped by class, sorted by file name within each class
    pub samples: Vec<ImageSample>,
}

impl ImageFolder {
    pub fn scan<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        info!("Scanning image folder: {}", root_dir.display());

        if !root_dir.is_dir() {
            return Err(PipelineError::InvalidInput(format!(
                "dataset directory does not exist: {}",
                root_dir.display()
            )));
        }

        let mut class_names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&root_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    class_names.push(name.to_string());
                }
            }
        }
        class_names.sort();

        let mut samples = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            let before = samples.len();
            for entry in WalkDir::new(root_dir.join(class_name))
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if entry.file_type().is_file() && is_image_file(path) {
                    samples.push(ImageSample {
                        path: path.to_path_buf(),
                        label,
                        class_name: class_name.clone(),
                    });
                }
            }
            debug!(
                "Class '{}' (label {}): {} images",
                class_name,
                label,
                samples.len() - before
            );
        }

        info!(
            "Found {} images in {} classes",
            samples.len(),
            class_names.len()
        );

        Ok(Self {
            root_dir,
            class_names,
            samples,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Images per class, indexed by label
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }

    /// Deterministic per-class split.
    ///
    /// For each class the first `floor(fraction * n)` files (sorted by name) form the
    /// validation subset and the remainder the training subset, so the two subsets
    /// never overlap and together cover the folder.
    pub fn split(&self, fraction: f64, subset: Subset) -> Vec<ImageSample> {
        let mut selected = Vec::new();
        for label in 0..self.num_classes() {
            let class_samples: Vec<&ImageSample> =
                self.samples.iter().filter(|s| s.label == label).collect();
            let n_val = (fraction * class_samples.len() as f64).floor() as usize;
            let range = match subset {
                Subset::Validation => 0..n_val,
                Subset::Training => n_val..class_samples.len(),
            };
            selected.extend(class_samples[range].iter().map(|s| (*s).clone()));
        }
        selected
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_folder(counts: &[(&str, usize)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (class, n) in counts {
            let class_dir = dir.path().join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..*n {
                fs::write(class_dir.join(format!("{:03}.png", i)), b"stub").unwrap();
            }
            fs::write(class_dir.join("notes.txt"), b"ignored").unwrap();
        }
        dir
    }

    #[test]
    fn test_scan_sorts_classes_and_filters_extensions() {
        let dir = make_folder(&[("normal", 3), ("adenocarcinoma", 4)]);
        let folder = ImageFolder::scan(dir.path()).unwrap();

        assert_eq!(folder.class_names, vec!["adenocarcinoma", "normal"]);
        assert_eq!(folder.len(), 7);
        assert_eq!(folder.class_counts(), vec![4, 3]);
        assert!(folder.samples.iter().all(|s| s.path.extension().unwrap() == "png"));
    }

    #[test]
    fn test_scan_missing_directory() {
        let dir = TempDir::new().unwrap();
        assert!(ImageFolder::scan(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_split_takes_leading_files_per_class() {
        let dir = make_folder(&[("a", 10), ("b", 5)]);
        let folder = ImageFolder::scan(dir.path()).unwrap();

        let val = folder.split(0.2, Subset::Validation);
        let train = folder.split(0.2, Subset::Training);

        // floor(0.2 * 10) = 2, floor(0.2 * 5) = 1
        assert_eq!(val.len(), 3);
        assert_eq!(train.len(), 12);
        assert_eq!(val[0].path.file_name().unwrap(), "000.png");
        assert_eq!(val[1].path.file_name().unwrap(), "001.png");
        assert!(val.iter().all(|v| !train.contains(v)));
    }

    #[test]
    fn test_split_is_deterministic() {
        let dir = make_folder(&[("a", 7), ("b", 7)]);
        let folder = ImageFolder::scan(dir.path()).unwrap();
        assert_eq!(
            folder.split(0.3, Subset::Validation),
            folder.split(0.3, Subset::Validation)
        );
    }
}
