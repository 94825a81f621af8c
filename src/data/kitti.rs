use std::path::{Path, PathBuf};

use image::RgbImage;
use image::imageops::{self, FilterType};
use tracing::debug;

use crate::data::{Dataset, DatasetError, Example};
use crate::ir::Tensor;

/// Ground-truth colour of everything that is not road.
pub const BACKGROUND_COLOR: [u8; 3] = [255, 0, 0];
/// Label channel holding the road class; channel 0 is background.
pub const ROAD_CLASS: usize = 1;

const IMAGE_DIR: &str = "image_2";
const GT_DIR: &str = "gt_image_2";
const ROAD_MARKER: &str = "_road_";

/// The KITTI road training split: `image_2/*.png` paired with
/// `gt_image_2/*_road_*.png`, resized to `image_shape`.
#[derive(Debug, Clone)]
pub struct KittiRoadDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
    image_shape: (usize, usize),
}

impl KittiRoadDataset {
    /// Indexes `training_dir` (normally `data_dir/data_road/training`).
    pub fn open(training_dir: &Path, image_shape: (usize, usize)) -> Result<Self, DatasetError> {
        if image_shape.0 == 0 || image_shape.1 == 0 {
            return Err(DatasetError::Layout(format!(
                "image shape {image_shape:?} has an empty side"
            )));
        }
        let image_dir = training_dir.join(IMAGE_DIR);
        let gt_dir = training_dir.join(GT_DIR);
        for dir in [&image_dir, &gt_dir] {
            if !dir.is_dir() {
                return Err(DatasetError::Layout(format!(
                    "missing directory {}",
                    dir.display()
                )));
            }
        }

        let mut pairs = Vec::new();
        for gt_path in png_files(&gt_dir)? {
            let Some(gt_name) = gt_path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !gt_name.contains(ROAD_MARKER) {
                continue;
            }
            let image_path = image_dir.join(gt_name.replacen(ROAD_MARKER, "_", 1));
            if !image_path.is_file() {
                return Err(DatasetError::Layout(format!(
                    "ground truth {} has no matching image {}",
                    gt_path.display(),
                    image_path.display()
                )));
            }
            pairs.push((image_path, gt_path));
        }
        if pairs.is_empty() {
            return Err(DatasetError::Layout(format!(
                "no road ground truth found in {}",
                gt_dir.display()
            )));
        }
        debug!(examples = pairs.len(), dir = %training_dir.display(), "indexed KITTI road split");
        Ok(Self { pairs, image_shape })
    }

    #[must_use]
    pub fn image_shape(&self) -> (usize, usize) {
        self.image_shape
    }
}

impl Dataset for KittiRoadDataset {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn example(&self, index: usize) -> Result<Example, DatasetError> {
        let (image_path, gt_path) = self.pairs.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.pairs.len(),
        })?;
        let image = load_resized(image_path, self.image_shape, FilterType::Triangle)?;
        // Nearest keeps ground-truth colours exact.
        let gt = load_resized(gt_path, self.image_shape, FilterType::Nearest)?;
        Ok(Example {
            image: image_tensor(&image)?,
            label: road_label(&gt)?,
        })
    }
}

/// Sorted `*.png` files in `dir`.
pub(crate) fn png_files(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("png")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) fn load_resized(
    path: &Path,
    (height, width): (usize, usize),
    filter: FilterType,
) -> Result<RgbImage, DatasetError> {
    let image = image::open(path)
        .map_err(|source| DatasetError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let (w, h) = (dimension(width)?, dimension(height)?);
    if image.dimensions() == (w, h) {
        return Ok(image);
    }
    Ok(imageops::resize(&image, w, h, filter))
}

/// `[H, W, 3]` raw pixel values.
pub(crate) fn image_tensor(image: &RgbImage) -> Result<Tensor, DatasetError> {
    let (w, h) = image.dimensions();
    let data = image.as_raw().iter().map(|&v| f32::from(v)).collect();
    Ok(Tensor::new(vec![h as usize, w as usize, 3], data)?)
}

/// Two-channel one-hot label: background where the pixel is exactly
/// [`BACKGROUND_COLOR`], road everywhere else.
pub(crate) fn road_label(gt: &RgbImage) -> Result<Tensor, DatasetError> {
    let (w, h) = gt.dimensions();
    let mut data = Vec::with_capacity(w as usize * h as usize * 2);
    for pixel in gt.pixels() {
        let background = pixel.0 == BACKGROUND_COLOR;
        data.push(if background { 1.0 } else { 0.0 });
        data.push(if background { 0.0 } else { 1.0 });
    }
    Ok(Tensor::new(vec![h as usize, w as usize, 2], data)?)
}

fn dimension(value: usize) -> Result<u32, DatasetError> {
    u32::try_from(value)
        .map_err(|_| DatasetError::Layout(format!("image dimension {value} is too large")))
}
