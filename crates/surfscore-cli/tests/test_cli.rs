use assert_cmd::Command;
use std::fs;
use surfscore_test_data::{SyntheticPair, TestDataset};

fn small_pairs() -> TestDataset {
    TestDataset::create(&[
        SyntheticPair::new("1ABC_A_B", 12, 30).seed(1),
        SyntheticPair::new("2XYZ_C_D", 6, 30).seed(2),
    ])
    .unwrap()
}

fn sampling_args(cmd: &mut Command) -> &mut Command {
    cmd.args(["--n-positives", "10", "--n-negatives", "10", "--max-npoints", "50"])
}

#[test]
fn test_assemble_command() {
    let dataset = small_pairs();
    let output = dataset.root.path().join("training_set.safetensors");

    let mut cmd = Command::cargo_bin("surfscore").unwrap();
    cmd.arg("assemble")
        .arg("--data-dir")
        .arg(&dataset.data_dir)
        .arg("--training-list")
        .arg(&dataset.training_list)
        .arg("--output")
        .arg(&output);
    sampling_args(&mut cmd);
    cmd.assert().success();

    let set = surfscore_core::TrainingSet::load(&output).unwrap();
    assert_eq!(set.n_samples(), 40);
    assert_eq!(set.max_npoints(), 50);
}

#[test]
fn test_train_and_score_commands() {
    let dataset = small_pairs();
    let out = tempfile::tempdir().unwrap();
    let weights = out.path().join("trained_model.safetensors");
    let log_dir = out.path().join("logs");
    let model_config = out.path().join("topology.json");
    fs::write(
        &model_config,
        r#"{"conv_channels": [4, 8], "dense_units": [8, 4]}"#,
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("surfscore").unwrap();
    cmd.arg("train")
        .arg("--data-dir")
        .arg(&dataset.data_dir)
        .arg("--training-list")
        .arg(&dataset.training_list)
        .args(["--epochs", "2", "--batch-size", "8", "--validation-split", "0.25"])
        .arg("--model-config")
        .arg(&model_config)
        .arg("--checkpoint")
        .arg(&weights)
        .arg("--log-dir")
        .arg(&log_dir)
        .arg("--cpu");
    sampling_args(&mut cmd);
    cmd.assert().success();

    assert!(weights.is_file());
    assert!(weights.with_extension("json").is_file());
    let metrics = fs::read_to_string(log_dir.join("metrics.jsonl")).unwrap();
    let first: serde_json::Value = serde_json::from_str(metrics.lines().next().unwrap()).unwrap();
    assert_eq!(first["epoch"], 1);
    assert_eq!(metrics.lines().count(), 2);

    let mut cmd = Command::cargo_bin("surfscore").unwrap();
    cmd.arg("score")
        .arg("--pair-dir")
        .arg(dataset.pair_dir("1ABC_A_B"))
        .arg("--weights")
        .arg(&weights)
        .args(["--max-npoints", "50", "--cpu"]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let text = String::from_utf8(output).unwrap();
    // header plus one line per candidate
    assert_eq!(text.lines().count(), 1 + 42);
}

#[test]
fn test_convert_command() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("legacy_pair");
    let written = SyntheticPair::new("5LEG_A_B", 4, 6)
        .ragged()
        .write_legacy(&dir)
        .unwrap();

    let mut cmd = Command::cargo_bin("surfscore").unwrap();
    cmd.arg("convert")
        .arg("--pair-dir")
        .arg(&dir)
        .args(["--pair-id", "5LEG_A_B"]);
    cmd.assert().success();

    let record = surfscore_core::PairRecord::load_record(&dir.join("pair.safetensors")).unwrap();
    assert_eq!(record, written);
}

#[test]
fn test_missing_training_list_fails() {
    let dataset = small_pairs();
    let mut cmd = Command::cargo_bin("surfscore").unwrap();
    cmd.arg("assemble")
        .arg("--data-dir")
        .arg(&dataset.data_dir)
        .arg("--training-list")
        .arg(dataset.root.path().join("missing.txt"))
        .arg("--output")
        .arg(dataset.root.path().join("out.safetensors"));
    cmd.assert().failure();
}
