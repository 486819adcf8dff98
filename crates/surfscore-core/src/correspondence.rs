//! Per-candidate point features.
//!
//! Every source point is matched to its nearest target point. The two feature channels are the
//! spatial distance of that match and the Euclidean distance between the two descriptors. Rows past
//! a candidate's point count stay zero.
use crate::config::{SamplingConfig, N_FEATURES};
use crate::error::{Result, SurfScoreError};
use crate::kdtree::KdTree;
use crate::pair::PairRecord;
use ndarray::{s, Array3, ArrayView2};

/// Nearest-target match for every point of one source patch.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    pub target_index: Vec<usize>,
    pub distance: Vec<f32>,
}

/// Features of every candidate in a pair.
#[derive(Debug, Clone)]
pub struct PairFeatures {
    /// `(n_candidates, max_npoints, N_FEATURES)`
    pub features: Array3<f32>,
    pub npoints: Vec<usize>,
    pub inlier_rates: Vec<f32>,
}

impl PairFeatures {
    pub fn n_candidates(&self) -> usize {
        self.npoints.len()
    }
}

pub fn nearest_correspondences(tree: &KdTree, patch: ArrayView2<f32>) -> Correspondence {
    let (target_index, distance) = patch
        .rows()
        .into_iter()
        .filter_map(|row| tree.nearest([row[0], row[1], row[2]]))
        .map(|hit| (hit.index, hit.distance))
        .unzip();
    Correspondence {
        target_index,
        distance,
    }
}

/// Euclidean distance between each source descriptor and the descriptor of its matched target point.
pub fn descriptor_distances(
    source_descs: ArrayView2<f32>,
    target_descs: ArrayView2<f32>,
    target_index: &[usize],
) -> Vec<f32> {
    source_descs
        .rows()
        .into_iter()
        .zip(target_index)
        .map(|(src, &t)| {
            src.iter()
                .zip(target_descs.row(t))
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt()
        })
        .collect()
}

/// Fraction of distances strictly below `threshold`; zero for an empty patch.
pub fn inlier_rate(distances: &[f32], threshold: f32) -> f32 {
    if distances.is_empty() {
        return 0.0;
    }
    let inliers = distances.iter().filter(|&&d| d < threshold).count();
    inliers as f32 / distances.len() as f32
}

/// Builds the feature tensor and inlier rates for every candidate of `pair`.
pub fn compute_pair_features(pair: &PairRecord, config: &SamplingConfig) -> Result<PairFeatures> {
    // fields are public, so the record may have changed since it was loaded
    pair.validate()?;
    if pair.target_patch.nrows() == 0 {
        return Err(SurfScoreError::EmptyTarget {
            pair_id: pair.pair_id.clone(),
        });
    }
    let tree = KdTree::from_rows(pair.target_patch.view());
    let n_candidates = pair.n_candidates();
    let mut features = Array3::<f32>::zeros((n_candidates, config.max_npoints, N_FEATURES));
    let mut npoints = Vec::with_capacity(n_candidates);
    let mut inlier_rates = Vec::with_capacity(n_candidates);

    for (i, (patch, descs)) in pair.source_patches.iter().zip(&pair.source_descs).enumerate() {
        let k = patch.nrows();
        if k > config.max_npoints {
            return Err(SurfScoreError::PatchTooLarge {
                pair_id: pair.pair_id.clone(),
                patch: i,
                npoints: k,
                max_npoints: config.max_npoints,
            });
        }
        let corr = nearest_correspondences(&tree, patch.view());
        let desc_dist = descriptor_distances(descs.view(), pair.target_descs.view(), &corr.target_index);

        let mut slot = features.slice_mut(s![i, ..k, ..]);
        for (j, (d, dd)) in corr.distance.iter().zip(&desc_dist).enumerate() {
            slot[[j, 0]] = *d;
            slot[[j, 1]] = *dd;
        }
        npoints.push(k);
        inlier_rates.push(inlier_rate(&corr.distance, config.inlier_distance));
    }

    log::debug!(
        "pair {}: features for {} candidates against {} target points",
        pair.pair_id,
        n_candidates,
        tree.len()
    );
    Ok(PairFeatures {
        features,
        npoints,
        inlier_rates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};

    fn pair_with(source_patches: Vec<Array2<f32>>) -> PairRecord {
        let source_descs = source_patches
            .iter()
            .map(|p| Array2::from_elem((p.nrows(), 2), 1.0))
            .collect();
        let n = source_patches.len();
        PairRecord::new(
            "pair",
            source_patches,
            source_descs,
            array![[0.0, 0.0, 0.0], [10.0, 0.0, 0.0]],
            array![[1.0, 1.0], [4.0, 5.0]],
            Array1::from_elem(n, 1.0),
        )
        .unwrap()
    }

    #[test]
    fn test_two_channel_features() {
        let pair = pair_with(vec![array![[0.0, 3.0, 0.0], [9.0, 0.0, 0.0]]]);
        let config = SamplingConfig {
            max_npoints: 4,
            ..Default::default()
        };
        let out = compute_pair_features(&pair, &config).unwrap();
        assert_eq!(out.features.shape(), &[1, 4, 2]);
        // first point matches target 0 at distance 3, identical descriptors
        assert_eq!(out.features[[0, 0, 0]], 3.0);
        assert_eq!(out.features[[0, 0, 1]], 0.0);
        // second point matches target 1 at distance 1, descriptor distance |(1,1)-(4,5)| = 5
        assert_eq!(out.features[[0, 1, 0]], 1.0);
        assert_eq!(out.features[[0, 1, 1]], 5.0);
        assert_eq!(out.npoints, vec![2]);
        // only the distance-1.0 point is below 1.5
        assert_eq!(out.inlier_rates, vec![0.5]);
    }

    #[test]
    fn test_zero_padding_past_point_count() {
        let pair = pair_with(vec![
            Array2::from_elem((3, 3), 2.0),
            Array2::from_elem((5, 3), 2.0),
        ]);
        let config = SamplingConfig {
            max_npoints: 5,
            ..Default::default()
        };
        let out = compute_pair_features(&pair, &config).unwrap();
        assert!(out.features.slice(s![0, 3.., ..]).iter().all(|&v| v == 0.0));
        assert!(out.features.slice(s![0, ..3, 0]).iter().all(|&v| v > 0.0));
        assert!(out.features.slice(s![1, .., 0]).iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_patch_too_large() {
        let pair = pair_with(vec![Array2::zeros((6, 3))]);
        let config = SamplingConfig {
            max_npoints: 5,
            ..Default::default()
        };
        let err = compute_pair_features(&pair, &config).unwrap_err();
        assert!(matches!(
            err,
            SurfScoreError::PatchTooLarge {
                npoints: 6,
                max_npoints: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_patch_has_zero_inlier_rate() {
        let pair = pair_with(vec![Array2::zeros((0, 3))]);
        let out = compute_pair_features(&pair, &SamplingConfig::default()).unwrap();
        assert_eq!(out.inlier_rates, vec![0.0]);
        assert!(out.features.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_nan_source_point_is_rejected() {
        let mut pair = pair_with(vec![array![[0.0, 3.0, 0.0], [9.0, 0.0, 0.0]]]);
        pair.source_patches[0][[0, 0]] = f32::NAN;
        let err = compute_pair_features(&pair, &SamplingConfig::default()).unwrap_err();
        assert!(matches!(err, SurfScoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_inlier_rate_is_strict() {
        assert_eq!(inlier_rate(&[0.5, 1.0, 1.5, 2.0], 1.0), 0.25);
        assert_eq!(inlier_rate(&[], 1.0), 0.0);
    }
}
