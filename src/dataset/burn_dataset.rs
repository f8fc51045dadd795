//! Burn Dataset Integration
//!
//! Decoding and resizing happen once when a dataset is loaded; the raw
//! (resized, not normalised) images stay in memory so the training generator
//! can augment them differently every epoch. The batcher turns items into
//! normalised NCHW tensors.

use std::path::Path;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::ImageSize;
use crate::dataset::loader::ImageSample;
use crate::utils::error::{PipelineError, Result};

/// ImageNet channel means used for input normalisation
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations used for input normalisation
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode an image file and resize it to the network input size
pub fn load_image(path: &Path, size: ImageSize) -> Result<RgbImage> {
    let img = ImageReader::open(path)
        .map_err(|e| PipelineError::Image(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| PipelineError::Image(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| PipelineError::Image(path.to_path_buf(), e.to_string()))?;
    Ok(resize(&img, size))
}

/// Decode an in-memory upload; anything that is not a supported image is invalid input
pub fn decode_image_bytes(bytes: &[u8], size: ImageSize) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(PipelineError::InvalidInput("empty image payload".to_string()));
    }
    let img = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::InvalidInput(format!("not a decodable image: {}", e)))?;
    Ok(resize(&img, size))
}

fn resize(img: &DynamicImage, size: ImageSize) -> RgbImage {
    img.resize_exact(size.width as u32, size.height as u32, FilterType::Triangle)
        .to_rgb8()
}

/// Convert to CHW floats scaled to [0, 1]
pub fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let plane = height * width;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = pixel[c] as f32 / 255.0;
        }
    }

    data
}

/// A single item ready for batching
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Flattened CHW float array [3 * H * W] in [0, 1]
    pub image: Vec<f32>,
    pub label: usize,
    pub path: String,
}

impl ImageItem {
    pub fn from_raw(raw: &RawImageItem) -> Self {
        Self {
            image: to_chw(&raw.image),
            label: raw.label,
            path: raw.path.clone(),
        }
    }
}

/// A decoded and resized image kept in memory for on-the-fly augmentation
#[derive(Clone)]
pub struct RawImageItem {
    pub image: RgbImage,
    pub label: usize,
    pub path: String,
}

impl std::fmt::Debug for RawImageItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImageItem")
            .field("label", &self.label)
            .field("path", &self.path)
            .field(
                "image_size",
                &format!("{}x{}", self.image.width(), self.image.height()),
            )
            .finish()
    }
}

/// In-memory dataset of resized images
#[derive(Clone)]
pub struct ImageDataset {
    items: Vec<RawImageItem>,
    image_size: ImageSize,
    skipped: usize,
}

impl std::fmt::Debug for ImageDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDataset")
            .field("len", &self.items.len())
            .field("image_size", &self.image_size)
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl ImageDataset {
    /// Load every sample into memory. Unreadable files are skipped with a warning.
    pub fn load(samples: &[ImageSample], image_size: ImageSize) -> Self {
        info!("Pre-loading {} images at {}", samples.len(), image_size);

        let pb = ProgressBar::new(samples.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut items = Vec::with_capacity(samples.len());
        let mut skipped = 0;
        for sample in samples {
            match load_image(&sample.path, image_size) {
                Ok(image) => items.push(RawImageItem {
                    image,
                    label: sample.label,
                    path: sample.path.to_string_lossy().to_string(),
                }),
                Err(e) => {
                    warn!("Skipping unreadable image: {}", e);
                    skipped += 1;
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        if skipped > 0 {
            warn!("{} of {} images could not be decoded", skipped, samples.len());
        }

        Self {
            items,
            image_size,
            skipped,
        }
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }

    /// Number of samples that failed to decode
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Dataset<RawImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<RawImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A batch of images with integer and one-hot targets
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Shape [batch_size, 3, height, width], ImageNet-normalised
    pub images: Tensor<B, 4>,
    /// Shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// Shape [batch_size, num_classes]
    pub one_hot: Tensor<B, 2>,
}

/// Batcher producing normalised image tensors
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: ImageSize,
    num_classes: usize,
}

impl ImageBatcher {
    pub fn new(image_size: ImageSize, num_classes: usize) -> Self {
        Self {
            image_size,
            num_classes,
        }
    }
}

/// Build the normalised NCHW input tensor for a set of CHW images
pub fn images_to_tensor<B: Backend>(
    images: Vec<f32>,
    batch_size: usize,
    size: ImageSize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let images = Tensor::<B, 4>::from_floats(
        TensorData::new(images, [batch_size, 3, size.height, size.width]),
        device,
    );

    let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), device);
    let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), device);

    (images - mean) / std
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();

        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();
        let images_data: Vec<f32> = items.into_iter().flat_map(|item| item.image).collect();
        let images = images_to_tensor::<B>(images_data, batch_size, self.image_size, device);

        let targets_data: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        let mut one_hot_data = vec![0.0f32; batch_size * self.num_classes];
        for (row, &label) in labels.iter().enumerate() {
            if label < self.num_classes {
                one_hot_data[row * self.num_classes + label] = 1.0;
            }
        }
        let one_hot = Tensor::<B, 2>::from_floats(
            TensorData::new(one_hot_data, [batch_size, self.num_classes]),
            device,
        );

        ImageBatch {
            images,
            targets,
            one_hot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::path::PathBuf;
    use tempfile::TempDir;

    type TestBackend = crate::backend::DefaultBackend;

    fn write_png(path: &Path, shade: u8) {
        let img: RgbImage = ImageBuffer::from_fn(20, 10, |_, _| Rgb([shade, 0, 255]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_to_chw_layout() {
        let img: RgbImage = ImageBuffer::from_fn(2, 1, |x, _| Rgb([x as u8 * 255, 0, 255]));
        let data = to_chw(&img);
        assert_eq!(data, vec![0.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_load_resizes_and_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.png");
        let bad = dir.path().join("bad.png");
        write_png(&good, 10);
        std::fs::write(&bad, b"definitely not a png").unwrap();

        let samples = vec![
            ImageSample { path: good, label: 0, class_name: "a".into() },
            ImageSample { path: bad, label: 1, class_name: "b".into() },
        ];
        let dataset = ImageDataset::load(&samples, ImageSize::new(8, 12));

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.skipped(), 1);
        let item = dataset.get(0).unwrap();
        assert_eq!(item.image.dimensions(), (12, 8));
    }

    #[test]
    fn test_decode_rejects_non_images() {
        let err = decode_image_bytes(b"hello", ImageSize::new(8, 8)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(decode_image_bytes(&[], ImageSize::new(8, 8)).is_err());
    }

    #[test]
    fn test_missing_file_is_image_error() {
        let err = load_image(&PathBuf::from("/nonexistent/x.png"), ImageSize::new(8, 8)).unwrap_err();
        assert!(matches!(err, PipelineError::Image(_, _)));
    }

    #[test]
    fn test_batcher_shapes_and_one_hot() {
        let size = ImageSize::new(4, 6);
        let item = |label| ImageItem {
            image: vec![0.5; 3 * 4 * 6],
            label,
            path: String::new(),
        };
        let batcher = ImageBatcher::new(size, 2);
        let device = Default::default();
        let batch: ImageBatch<TestBackend> = batcher.batch(vec![item(0), item(1), item(1)], &device);

        assert_eq!(batch.images.dims(), [3, 3, 4, 6]);
        assert_eq!(batch.targets.dims(), [3]);
        assert_eq!(batch.one_hot.dims(), [3, 2]);

        let one_hot = batch.one_hot.into_data().to_vec::<f32>().unwrap();
        assert_eq!(one_hot, vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
    }
}
