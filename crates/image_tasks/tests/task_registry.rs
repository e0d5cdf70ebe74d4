//! Building data modules and tasks by name through the registry.

mod common;
use common::flat_folder;
use image_tasks::io::input::{InputFormat, InputSource};
use image_tasks::io::output::Prediction;
use image_tasks::model::{Task, TaskHead};
use image_tasks::tasks::face_detection::{self, FaceDetectionArgs, StageFaces};
use image_tasks::tasks::{self, TaskRegistry, TaskType};
use image_tasks::{BoundingBox, DataModuleConfig, MiniBatch, PipelineError, RunningStage, StageSources};

use anyhow::Result;
use tch::Tensor;

#[test]
fn test_registry_lists_builtin_tasks() -> Result<()> {
    let registry = TaskRegistry::with_defaults();
    assert_eq!(registry.names().len(), TaskType::ALL.len());

    let keypoints = registry.get("keypoint_detection")?;
    assert_eq!(keypoints.default_arguments["model.num_keypoints"], 1);
    assert_eq!(keypoints.default_arguments["trainer.max_epochs"], 3);
    assert_eq!(keypoints.default_format, InputFormat::Coco);

    let err = registry.get("image_captioning").err();
    assert!(matches!(
        err.as_ref().and_then(|e| e.downcast_ref::<PipelineError>()),
        Some(PipelineError::UnknownTask(_))
    ));
    Ok(())
}

#[test]
fn test_style_transfer_rejects_validation_data() -> Result<()> {
    let dir = tempfile::tempdir()?;
    flat_folder(dir.path(), &[(20, 20), (24, 16)])?;
    let registry = TaskRegistry::with_defaults();
    let spec = registry.get("style_transfer")?;
    let args = serde_json::json!({ "image_size": [8, 8] });

    let train_only = tasks::data_module(
        spec,
        &args,
        InputFormat::Folders,
        StageSources::default().with_train(InputSource::Folder(dir.path().to_path_buf())),
        DataModuleConfig::default(),
    )?;
    let batch = train_only
        .train_dataloader()?
        .iter()?
        .next()
        .transpose()?
        .map(|b: MiniBatch| b.get("input").map(Tensor::size))
        .transpose()?;
    assert_eq!(batch, Some(vec![2, 3, 8, 8]));

    let with_val = tasks::data_module(
        spec,
        &args,
        InputFormat::Folders,
        StageSources::default()
            .with_train(InputSource::Folder(dir.path().to_path_buf()))
            .with_val(InputSource::Folder(dir.path().to_path_buf())),
        DataModuleConfig::default(),
    );
    assert!(with_val.is_err());
    Ok(())
}

#[test]
fn test_face_detection_predictions_in_original_pixels() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let paths = flat_folder(dir.path(), &[(20, 10), (10, 20)])?;
    let data = face_detection::from_datasets(
        StageFaces {
            train: Some(vec![(paths[0].clone(), vec![BoundingBox::new(1.0, 1.0, 5.0, 5.0)])]),
            predict: Some(paths),
            ..Default::default()
        },
        FaceDetectionArgs::default(),
        DataModuleConfig {
            batch_size: 2,
            ..Default::default()
        },
    )?;
    assert_eq!(data.labels().map(<[String]>::len), Some(2));
    assert_eq!(data.stages(), vec![RunningStage::Training, RunningStage::Predicting]);

    // One face per image, in padded batch coordinates.
    let model = |_: &MiniBatch| -> Result<Tensor> {
        Ok(Tensor::from_slice(&[
            0.0f32, 5.0, 10.0, 15.0, 0.9, 0.0, //
            5.0, 0.0, 15.0, 10.0, 0.8, 1.0,
        ])
        .reshape([2, 6]))
    };
    let spec = TaskType::FaceDetection.spec();
    let task = Task::from_spec(&spec, &serde_json::Value::Null, None, TaskHead::regression(), model)?;
    let predictions = task.predict(&data.predict_dataloader()?)?;

    assert_eq!(predictions.len(), 2);
    for (prediction, score) in predictions.iter().zip([0.9f32, 0.8]) {
        match prediction {
            Prediction::Detections { detections } => {
                assert_eq!(detections.len(), 1);
                assert_eq!(detections[0].bbox, [0.0, 0.0, 10.0, 10.0]);
                assert!((detections[0].score - score).abs() < 1e-6);
            }
            other => panic!("expected detections, got {:?}", other),
        }
    }
    Ok(())
}
