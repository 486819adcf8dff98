use anyhow::Result;
use candle_core::Device;
use std::fs;
use surfscore_core::{assemble_dataset, SamplingConfig, SurfScoreError, TrainingSet};
use surfscore_nn::{BestCheckpoint, ModelConfig, ScoreModel, TrainConfig, Trainer};
use surfscore_test_data::{SyntheticPair, TestDataset};

fn sampling() -> SamplingConfig {
    SamplingConfig {
        n_positives: 10,
        n_negatives: 10,
        max_npoints: 50,
        ..Default::default()
    }
}

fn small_model() -> ModelConfig {
    ModelConfig {
        conv_channels: vec![4, 8],
        dense_units: vec![8, 4],
        l2_regularization: 1e-4,
        ..Default::default()
    }
}

fn training_set(dataset: &TestDataset) -> Result<TrainingSet> {
    let dirs = vec![
        dataset.pair_dir("1ABC_A_B"),
        dataset.pair_dir("2XYZ_C_D"),
    ];
    let (set, _) = assemble_dataset(&dirs, &sampling())?;
    Ok(set)
}

#[test]
fn test_fit_writes_checkpoint_and_metrics() -> Result<()> {
    let dataset = TestDataset::create(&[
        SyntheticPair::new("1ABC_A_B", 12, 30).seed(1),
        SyntheticPair::new("2XYZ_C_D", 6, 30).seed(2),
    ])?;
    let set = training_set(&dataset)?;
    assert_eq!(set.n_samples(), 40);

    let out = tempfile::tempdir()?;
    let train_config = TrainConfig {
        batch_size: 8,
        epochs: 3,
        validation_split: 0.25,
        checkpoint_path: out.path().join("models/trained_model.safetensors"),
        log_dir: out.path().join("logs"),
        ..Default::default()
    };
    let mut trainer = Trainer::new(small_model(), train_config.clone(), Device::Cpu)?
        .with_default_callbacks()?;
    let history = trainer.fit(&set)?;

    assert_eq!(history.len(), 3);
    let last = history.last().unwrap();
    assert!(last.loss.is_finite());
    assert!(last.val_loss.is_some());
    assert!((0.0..=1.0).contains(&last.accuracy));

    assert!(train_config.checkpoint_path.is_file());
    let saved = BestCheckpoint::config_path(&train_config.checkpoint_path);
    assert_eq!(ModelConfig::load_json(&saved)?, small_model());

    let metrics = fs::read_to_string(train_config.log_dir.join("metrics.jsonl"))?;
    assert_eq!(metrics.lines().count(), 3);

    let scorer = ScoreModel::load_checkpoint(&train_config.checkpoint_path, &Device::Cpu)?;
    let pair = surfscore_core::PairRecord::load(&dataset.pair_dir("1ABC_A_B"))?;
    let scores = scorer.score_pair(&pair, &sampling())?;
    assert_eq!(scores.len(), pair.n_candidates());
    assert!(scores.iter().all(|p| (0.0..=1.0).contains(p)));
    Ok(())
}

#[test]
fn test_fit_without_validation_split() -> Result<()> {
    let dataset = TestDataset::create(&[
        SyntheticPair::new("1ABC_A_B", 12, 30),
        SyntheticPair::new("2XYZ_C_D", 6, 30),
    ])?;
    let set = training_set(&dataset)?;
    let train_config = TrainConfig {
        epochs: 1,
        validation_split: 0.0,
        ..Default::default()
    };
    let mut trainer = Trainer::new(small_model(), train_config, Device::Cpu)?;
    let history = trainer.fit(&set)?;
    let epoch = history.best().unwrap();
    assert!(epoch.val_loss.is_none());
    assert_eq!(epoch.monitored(), epoch.loss);
    Ok(())
}

#[test]
fn test_trailing_validation_rows_are_one_class() -> Result<()> {
    let dataset = TestDataset::create(&[
        SyntheticPair::new("1ABC_A_B", 12, 30).seed(1),
        SyntheticPair::new("2XYZ_C_D", 6, 30).seed(2),
    ])?;
    let set = training_set(&dataset)?;
    // 40 rows with a 0.1 split hold out the last 4, all negatives of the second pair
    assert!(set.labels.slice(ndarray::s![36.., ..]).iter().all(|&l| l == 0));

    let train_config = TrainConfig {
        epochs: 1,
        batch_size: 8,
        validation_split: 0.1,
        ..Default::default()
    };
    let mut trainer = Trainer::new(small_model(), train_config, Device::Cpu)?;
    let history = trainer.fit(&set)?;
    let epoch = history.last().unwrap();
    assert!(epoch.val_loss.is_some());
    assert!(epoch.val_auroc.is_none());
    Ok(())
}

#[test]
fn test_empty_training_set_is_an_error() -> Result<()> {
    let (set, report) = assemble_dataset(&[], &sampling())?;
    assert!(report.pairs.is_empty());
    let mut trainer = Trainer::new(small_model(), TrainConfig::default(), Device::Cpu)?;
    let err = trainer.fit(&set).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SurfScoreError>(),
        Some(SurfScoreError::EmptyDataset)
    ));
    Ok(())
}
