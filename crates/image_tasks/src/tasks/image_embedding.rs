//! Image embedding: images in, vectors out, targets ignored.

use crate::data_module::{DataModule, DataModuleConfig};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::input::InputFormat;
use crate::io::output::{EmbeddingOutput, Output};
use crate::output_transform::{DefaultOutputTransform, OutputTransform};
use crate::sample::DataSample;
use crate::stage::RunningStage;
use crate::tasks::{parse_args, resize_transforms, to_state, with_image_inputs, StagePaths, TaskSpec, TaskType, TransformConfig};
use crate::transforms::vision::{Normalize, ToTensor};
use crate::transforms::{from_fn, Sequential};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAME: &str = "image_embedding";
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (196, 196);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageEmbeddingArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
}

pub struct ImageEmbeddingInputTransform {
    args: ImageEmbeddingArgs,
    transforms: StageTransforms,
}

impl ImageEmbeddingInputTransform {
    pub fn new(args: ImageEmbeddingArgs) -> Result<Self> {
        args.transform.validate()?;
        let normalize = args.transform.normalize()?.unwrap_or_else(Normalize::imagenet);
        let size = args.transform.image_size_or(DEFAULT_IMAGE_SIZE);
        let mut transforms = resize_transforms(size, None, ToTensor::new(), Some(normalize))?;
        if let Some(resize) = transforms.pre_tensor.take() {
            transforms = transforms.with_pre_tensor(
                Sequential::<DataSample>::new()
                    .push(from_fn(|mut sample: DataSample| {
                        sample.target = None;
                        Ok(sample)
                    }))
                    .push(resize),
            );
        }
        Ok(Self { args, transforms })
    }
}

impl TransformProvider for ImageEmbeddingInputTransform {
    fn name(&self) -> &'static str {
        NAME
    }

    fn default_transforms(&self, _stage: RunningStage) -> Option<StageTransforms> {
        Some(self.transforms.clone())
    }

    fn state(&self) -> serde_json::Value {
        to_state(&self.args)
    }
}

pub fn input_transform(args: ImageEmbeddingArgs) -> Result<InputTransform> {
    Ok(with_image_inputs(InputTransform::new(ImageEmbeddingInputTransform::new(args)?)))
}

pub fn from_folders(folders: StagePaths, args: ImageEmbeddingArgs, config: DataModuleConfig) -> Result<DataModule> {
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(DefaultOutputTransform),
        InputFormat::Folders,
        folders.into_folder_sources(),
        config,
    )
}

pub fn spec() -> TaskSpec {
    let (height, width) = DEFAULT_IMAGE_SIZE;
    TaskSpec {
        name: NAME.to_string(),
        description: TaskType::ImageEmbedding.description().to_string(),
        formats: vec![
            InputFormat::Files,
            InputFormat::Folders,
            InputFormat::Numpy,
            InputFormat::Tensors,
        ],
        default_format: InputFormat::Files,
        default_arguments: BTreeMap::from([
            ("input_transform.image_size".to_string(), serde_json::json!([height, width])),
            ("model.embedding_dim".to_string(), serde_json::json!(128)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(DefaultOutputTransform) },
        build_output: |_, _| -> Result<Arc<dyn Output>> { Ok(Arc::new(EmbeddingOutput)) },
    }
}
