//! Getting data in and predictions out.
//!
//! ```text
//! io/
//! ├── loader.rs        → Extension checks and image/.npy loading
//! ├── input.rs         → Input trait, formats and sources
//! ├── image.rs         → Image inputs (paths, folders, tensors, numpy, FiftyOne)
//! ├── fiftyone.rs      → FiftyOne JSON export parsing
//! ├── coco.rs          → COCO annotations (boxes, keypoints, polygons)
//! ├── deserializer.rs  → Base64 image payloads
//! └── output.rs        → Prediction formats
//! ```

pub mod coco;
pub mod deserializer;
pub mod fiftyone;
pub mod image;
pub mod input;
pub mod loader;
pub mod output;

pub use deserializer::ImageDeserializer;
pub use input::{Input, InputFormat, InputSource, LoadedData, LoadedInput};
pub use loader::{has_file_allowed_extension, image_loader, IMG_EXTENSIONS, NP_EXTENSIONS};
pub use output::{Output, Prediction};
