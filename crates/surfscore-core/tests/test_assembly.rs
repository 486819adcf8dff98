use anyhow::Result;
use std::collections::HashSet;
use surfscore_core::{
    assemble_dataset, discover_pairs, process_pair, read_training_list, NegativeShortfall,
    PairOutcome, PairRecord, SampleGroup, SamplingConfig, SamplingError, SurfScoreError,
    TrainingSet,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use surfscore_test_data::{SyntheticPair, TestDataset};

fn three_pairs() -> Vec<SyntheticPair> {
    vec![
        SyntheticPair::new("1ABC_A_B", 120, 300).seed(1),
        SyntheticPair::new("2DEF_C_D", 30, 300).seed(2),
        SyntheticPair::new("3GHI_E_F", 100, 250).seed(3),
    ]
}

fn listed_pairs(dataset: &TestDataset) -> Result<Vec<std::path::PathBuf>> {
    let training = read_training_list(&dataset.training_list)?;
    Ok(discover_pairs(&dataset.data_dir, &training)?)
}

#[test]
fn test_three_pairs_end_to_end() -> Result<()> {
    let dataset = TestDataset::create(&three_pairs())?;
    let pairs = listed_pairs(&dataset)?;
    assert_eq!(pairs.len(), 3);

    let (set, report) = assemble_dataset(&pairs, &SamplingConfig::default())?;
    assert_eq!(set.features.shape(), &[600, 200, 2]);
    assert_eq!(set.labels.shape(), &[600, 1]);
    assert_eq!(set.n_samples(), 600);
    assert_eq!(report.n_samples(), 600);
    assert_eq!(report.n_included(), 3);
    assert_eq!(set.n_positive(), 300);
    assert_eq!(set.pair_ids, vec!["1ABC_A_B", "2DEF_C_D", "3GHI_E_F"]);

    // every row's label agrees with its group
    for (label, group) in set.labels.iter().zip(&set.groups) {
        assert_eq!(*label, group.label());
    }
    // patches have 40 points, the remaining slots are zero padding
    assert!(set.features.slice(ndarray::s![.., 40.., ..]).iter().all(|&v| v == 0.0));
    Ok(())
}

#[test]
fn test_unlisted_pairs_are_ignored() -> Result<()> {
    let dataset = TestDataset::create(&three_pairs()[..2])?;
    dataset.add_unlisted(&SyntheticPair::new("9XYZ_A_B", 50, 200))?;
    std::fs::create_dir_all(dataset.data_dir.join("not_a_pair"))?;

    let pairs = listed_pairs(&dataset)?;
    let names: Vec<_> = pairs
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["1ABC_A_B", "2DEF_C_D"]);
    Ok(())
}

#[test]
fn test_pair_without_positives_is_skipped() -> Result<()> {
    let mut pairs = three_pairs();
    pairs.insert(1, SyntheticPair::new("0NEG_A_B", 0, 300));
    let dataset = TestDataset::create(&pairs)?;

    let (set, report) = assemble_dataset(&listed_pairs(&dataset)?, &SamplingConfig::default())?;
    assert_eq!(set.n_samples(), 600);
    assert_eq!(report.n_skipped(), 1);
    assert!(report
        .pairs
        .contains(&("0NEG_A_B".to_string(), PairOutcome::NoPositives)));
    assert!(!set.pair_ids.contains(&"0NEG_A_B".to_string()));
    Ok(())
}

#[test]
fn test_negative_shortfall_policy() -> Result<()> {
    let dataset = TestDataset::create(&[
        SyntheticPair::new("1ABC_A_B", 120, 300),
        SyntheticPair::new("2FEW_A_B", 20, 30),
    ])?;
    let pairs = listed_pairs(&dataset)?;

    let err = assemble_dataset(&pairs, &SamplingConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        SurfScoreError::Sampling {
            source: SamplingError::InsufficientNegatives { .. },
            ..
        }
    ));

    let config = SamplingConfig {
        negative_shortfall: NegativeShortfall::Skip,
        ..Default::default()
    };
    let (set, report) = assemble_dataset(&pairs, &config)?;
    assert_eq!(set.n_samples(), 200);
    assert!(matches!(
        report.pairs[1].1,
        PairOutcome::InsufficientNegatives { .. }
    ));
    Ok(())
}

#[test]
fn test_assembly_is_deterministic() -> Result<()> {
    let dataset = TestDataset::create(&three_pairs())?;
    let pairs = listed_pairs(&dataset)?;
    let (a, _) = assemble_dataset(&pairs, &SamplingConfig::default())?;
    let (b, _) = assemble_dataset(&pairs, &SamplingConfig::default())?;
    assert_eq!(a, b);

    let other_seed = SamplingConfig {
        seed: 7,
        ..Default::default()
    };
    let (c, _) = assemble_dataset(&pairs, &other_seed)?;
    assert_ne!(a.features, c.features);
    Ok(())
}

#[test]
fn test_hard_negatives_are_true_negatives() -> Result<()> {
    let synthetic = SyntheticPair::new("1ABC_A_B", 120, 300).seed(5);
    let pair = synthetic.build();
    let config = SamplingConfig::default();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let samples = process_pair(&pair, &config, &mut rng)?.expect("pair has positives");

    assert!(samples.len() <= config.samples_per_pair());
    assert_eq!(samples.features.shape()[0], samples.labels.len());
    let hard: Vec<usize> = samples
        .candidates
        .iter()
        .zip(&samples.groups)
        .filter(|(_, g)| **g == SampleGroup::HardNegative)
        .map(|(&c, _)| c)
        .collect();
    assert_eq!(hard.len(), config.n_hard_negatives());
    for c in &hard {
        assert!(pair.source_patch_rmsds[*c] >= config.max_rmsd);
    }
    // hard negatives are the on-surface decoys, every fourth negative
    assert!(hard.iter().all(|c| (c - 120) % 4 == 0));
    let unique: HashSet<_> = hard.iter().collect();
    assert_eq!(unique.len(), hard.len());
    Ok(())
}

#[test]
fn test_training_set_file_round_trip() -> Result<()> {
    let dataset = TestDataset::create(&three_pairs()[..1])?;
    let (set, _) = assemble_dataset(&listed_pairs(&dataset)?, &SamplingConfig::default())?;
    let path = dataset.root.path().join("out").join("training_set.safetensors");
    set.save(&path)?;
    assert_eq!(TrainingSet::load(&path)?, set);
    Ok(())
}

#[test]
fn test_legacy_layout_matches_record() -> Result<()> {
    let root = tempfile::tempdir()?;
    let synthetic = SyntheticPair::new("4LEG_A_B", 8, 12).seed(9);
    let dir = root.path().join("4LEG_A_B");
    let written = synthetic.write_legacy(&dir)?;

    assert!(PairRecord::is_pair_dir(&dir));
    let loaded = PairRecord::load(&dir)?;
    assert_eq!(loaded, written);
    Ok(())
}

#[test]
fn test_ragged_legacy_pair_assembles() -> Result<()> {
    let root = tempfile::tempdir()?;
    let synthetic = SyntheticPair::new("5RAG_A_B", 30, 120).seed(4).ragged();
    let dir = root.path().join("5RAG_A_B");
    let written = synthetic.write_legacy(&dir)?;

    let loaded = PairRecord::load(&dir)?;
    assert_eq!(loaded, written);
    assert_eq!(loaded.source_patches[3].nrows(), 37);

    let (set, report) = assemble_dataset(&[dir], &SamplingConfig::default())?;
    assert_eq!(report.n_included(), 1);
    assert_eq!(set.n_samples(), 200);

    // rows past each candidate's own point count are padding
    let config = SamplingConfig::default();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let samples = process_pair(&loaded, &config, &mut rng)?.expect("pair has positives");
    for (row, &c) in samples.candidates.iter().enumerate() {
        let npoints = written.source_patches[c].nrows();
        let padding = samples.features.slice(ndarray::s![row, npoints.., ..]);
        assert!(padding.iter().all(|&v| v == 0.0));
    }
    Ok(())
}
