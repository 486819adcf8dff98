//! Classification metrics computed on host vectors.

/// Fraction of predictions that match the labels.
pub fn accuracy(predictions: &[u32], labels: &[u32]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    correct as f64 / labels.len() as f64
}

/// Area under the ROC curve for positive-class scores.
///
/// Uses the rank-sum form with averaged ranks for tied scores. `None` when only one class is present.
pub fn roc_auc(scores: &[f32], labels: &[u32]) -> Option<f64> {
    let n_pos = labels.iter().filter(|&&l| l == 1).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // ranks are 1-based
        let mean_rank = (start + end + 1) as f64 / 2.0;
        rank_sum += order[start..end]
            .iter()
            .filter(|&&i| labels[i] == 1)
            .count() as f64
            * mean_rank;
        start = end;
    }

    let n_pos = n_pos as f64;
    Some((rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[1, 0, 1, 1], &[1, 0, 0, 1]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [0, 0, 1, 1];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), Some(0.0));
    }

    #[test]
    fn test_auc_ties() {
        assert_eq!(roc_auc(&[0.5, 0.5, 0.5, 0.5], &[0, 1, 0, 1]), Some(0.5));
        // one positive above both negatives, one tied with a negative
        let auc = roc_auc(&[0.2, 0.4, 0.4, 0.9], &[0, 0, 1, 1]).unwrap();
        assert!((auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_auc_single_class() {
        assert!(roc_auc(&[0.1, 0.7], &[1, 1]).is_none());
    }
}
