//! Label assignment and balanced candidate sampling for one pair.
//!
//! Positives are candidates with `rmsd < max_rmsd`. They are subsampled down to `n_positives`, or
//! tiled up to `n_positives` when there are fewer, so repeated positive rows are expected. Half of
//! the negative quota goes to hard negatives (the best inlier rates that are still true negatives);
//! the rest is drawn at random from the full negative set.
use crate::config::SamplingConfig;
use crate::correspondence::PairFeatures;
use crate::error::SamplingError;
use itertools::Itertools;
use ndarray::{Array3, Axis};
use rand::seq::index;
use rand::Rng;
use std::collections::HashSet;
use strum::Display;

/// Why a row was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SampleGroup {
    Positive,
    HardNegative,
    RandomNegative,
}

impl SampleGroup {
    /// Binary alignment label: 1 for good alignments.
    pub fn label(self) -> u32 {
        match self {
            SampleGroup::Positive => 1,
            SampleGroup::HardNegative | SampleGroup::RandomNegative => 0,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SampleGroup::Positive => 0,
            SampleGroup::HardNegative => 1,
            SampleGroup::RandomNegative => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SampleGroup::Positive),
            1 => Some(SampleGroup::HardNegative),
            2 => Some(SampleGroup::RandomNegative),
            _ => None,
        }
    }
}

/// Candidate indices chosen for one pair, by group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSelection {
    pub positives: Vec<usize>,
    pub hard_negatives: Vec<usize>,
    pub random_negatives: Vec<usize>,
}

impl CandidateSelection {
    pub fn len(&self) -> usize {
        self.positives.len() + self.hard_negatives.len() + self.random_negatives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn grouped(&self) -> impl Iterator<Item = (usize, SampleGroup)> + '_ {
        tagged(&self.positives, SampleGroup::Positive)
            .chain(tagged(&self.hard_negatives, SampleGroup::HardNegative))
            .chain(tagged(&self.random_negatives, SampleGroup::RandomNegative))
    }

    /// Positives, then hard negatives, then random negatives.
    pub fn indices(&self) -> Vec<usize> {
        self.grouped().map(|(i, _)| i).collect()
    }

    pub fn groups(&self) -> Vec<SampleGroup> {
        self.grouped().map(|(_, g)| g).collect()
    }

    pub fn labels(&self) -> Vec<u32> {
        self.grouped().map(|(_, g)| g.label()).collect()
    }
}

fn tagged(indices: &[usize], group: SampleGroup) -> impl Iterator<Item = (usize, SampleGroup)> + '_ {
    indices.iter().map(move |&i| (i, group))
}

pub fn positive_indices(rmsds: &[f32], max_rmsd: f32) -> Vec<usize> {
    rmsds
        .iter()
        .positions(|&r| r < max_rmsd)
        .collect()
}

pub fn negative_indices(rmsds: &[f32], max_rmsd: f32) -> Vec<usize> {
    rmsds
        .iter()
        .positions(|&r| r >= max_rmsd)
        .collect()
}

/// Exactly `n` positives: a random subset when there are more, the list tiled when there are not.
pub fn choose_positives<R: Rng + ?Sized>(positives: &[usize], n: usize, rng: &mut R) -> Vec<usize> {
    if positives.is_empty() {
        return Vec::new();
    }
    if positives.len() > n {
        index::sample(rng, positives.len(), n)
            .into_iter()
            .map(|i| positives[i])
            .collect()
    } else {
        positives.iter().copied().cycle().take(n).collect()
    }
}

/// The `n` best-ranked candidates by inlier rate that are also negatives, in ascending index order.
///
/// Ranking covers every candidate, so a top-ranked positive uses up a slot without being emitted.
/// Ties rank the lower index first.
pub fn hard_negatives(inlier_rates: &[f32], negatives: &[usize], n: usize) -> Vec<usize> {
    let negatives: HashSet<usize> = negatives.iter().copied().collect();
    (0..inlier_rates.len())
        .sorted_by(|&a, &b| inlier_rates[b].total_cmp(&inlier_rates[a]).then(a.cmp(&b)))
        .take(n)
        .filter(|i| negatives.contains(i))
        .sorted()
        .collect()
}

/// Picks the rows one pair contributes to the training set.
///
/// Returns `Ok(None)` when the pair has no positive candidate. Random negatives come from the whole
/// negative set and may repeat a hard negative.
pub fn select_candidates<R: Rng + ?Sized>(
    rmsds: &[f32],
    inlier_rates: &[f32],
    config: &SamplingConfig,
    rng: &mut R,
) -> Result<Option<CandidateSelection>, SamplingError> {
    let positives = positive_indices(rmsds, config.max_rmsd);
    if positives.is_empty() {
        return Ok(None);
    }
    let positives = choose_positives(&positives, config.n_positives, rng);

    let negatives = negative_indices(rmsds, config.max_rmsd);
    let hard = hard_negatives(inlier_rates, &negatives, config.n_hard_negatives());

    let requested = config.n_negatives.saturating_sub(hard.len());
    if requested > negatives.len() {
        return Err(SamplingError::InsufficientNegatives {
            requested,
            available: negatives.len(),
        });
    }
    let random = index::sample(rng, negatives.len(), requested)
        .into_iter()
        .map(|i| negatives[i])
        .collect();

    Ok(Some(CandidateSelection {
        positives,
        hard_negatives: hard,
        random_negatives: random,
    }))
}

/// Rows one pair contributes: features, labels and provenance.
#[derive(Debug, Clone)]
pub struct PairSamples {
    pub pair_id: String,
    /// `(n_selected, max_npoints, N_FEATURES)`
    pub features: Array3<f32>,
    pub labels: Vec<u32>,
    pub groups: Vec<SampleGroup>,
    /// Candidate index of each row within the pair.
    pub candidates: Vec<usize>,
}

impl PairSamples {
    pub fn gather(pair_id: &str, features: &PairFeatures, selection: &CandidateSelection) -> Self {
        let candidates = selection.indices();
        Self {
            pair_id: pair_id.to_string(),
            features: features.features.select(Axis(0), &candidates),
            labels: selection.labels(),
            groups: selection.groups(),
            candidates,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
