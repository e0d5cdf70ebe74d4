//! Vision transforms for image preprocessing and augmentation.
//!
//! ```text
//! transforms/vision/
//! ├── geometric.rs     → Spatial transformations (resize, crop), target-aware
//! ├── photometric.rs   → Normalize
//! ├── conversion.rs    → Image ↔ tensor, target → tensors
//! ├── augmentation.rs  → Random flips driven by the worker RNG
//! └── io.rs            → Image loading
//! ```
//!
//! Geometric ops implement both `Transform<DynamicImage, DynamicImage>` and
//! `Transform<DataSample, DataSample>`. The latter keeps boxes, keypoints and
//! masks aligned with the image.
//!
//! ```ignore
//! use image_tasks::transforms::Transform;
//! use image_tasks::transforms::vision::{Resize, RandomHorizontalFlip, ToTensor};
//!
//! let pipeline = Resize::new(196, 196)?
//!     .then(RandomHorizontalFlip::new(0.5)?)
//!     .then(ToTensor::new());
//! ```

pub mod augmentation;
pub mod conversion;
pub mod geometric;
pub mod io;
pub mod photometric;

pub use augmentation::RandomHorizontalFlip;
pub use conversion::{image_to_tensor, tensor_to_image, ToTensor};
pub use geometric::{CenterCrop, CenterCropTensor, EnsureRGB, Resize, ResizeTensor};
pub use io::LoadImage;
pub use photometric::Normalize;
