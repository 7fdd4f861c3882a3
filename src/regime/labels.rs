//! Regime label alignment
//!
//! Mixture components and HMM states come out of every fit in arbitrary
//! order. Before labels are persisted they are put in a canonical order,
//! either ranked by expansiveness or matched to the previous committed fit.
//! An ordering is a vector where new index `i` holds old index `order[i]`.

use std::cmp::Ordering;

/// Largest K for which exhaustive permutation matching is attempted
pub const MAX_MATCHED_REGIMES: usize = 8;

/// Rank regimes by descending sum of their means over `columns`
/// (regime 0 = most expansive). Ties keep the lower original index first.
pub fn rank_by_expansiveness(means: &[Vec<f64>], columns: &[usize]) -> Vec<usize> {
    let score = |state: usize| -> f64 { columns.iter().map(|&c| means[state][c]).sum() };
    let mut order: Vec<usize> = (0..means.len()).collect();
    order.sort_by(|&a, &b| score(b).partial_cmp(&score(a)).unwrap_or(Ordering::Equal));
    order
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// All permutations of `0..k` in lexicographic order
fn permutations(k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current: Vec<usize> = (0..k).collect();
    loop {
        out.push(current.clone());
        // Next lexicographic permutation
        let pivot = match (0..k.saturating_sub(1)).rev().find(|&i| current[i] < current[i + 1]) {
            Some(i) => i,
            None => break,
        };
        let swap_with = (pivot + 1..k)
            .rev()
            .find(|&j| current[j] > current[pivot])
            .unwrap_or(pivot + 1);
        current.swap(pivot, swap_with);
        current[pivot + 1..].reverse();
    }
    out
}

/// Ordering that places each new regime at the index of the nearest
/// previous centroid, minimising total squared distance.
///
/// Returns `None` when the fits are not comparable (different K or
/// feature dimension) or K exceeds `MAX_MATCHED_REGIMES`. Ties keep the
/// lexicographically first ordering.
pub fn match_previous(means: &[Vec<f64>], previous: &[Vec<f64>]) -> Option<Vec<usize>> {
    let k = means.len();
    if k != previous.len() || k > MAX_MATCHED_REGIMES || k == 0 {
        return None;
    }
    let dim = means[0].len();
    if means.iter().chain(previous).any(|m| m.len() != dim) {
        return None;
    }

    let mut best: Option<(f64, Vec<usize>)> = None;
    for order in permutations(k) {
        let cost: f64 = order
            .iter()
            .enumerate()
            .map(|(new_idx, &old_idx)| squared_distance(&means[old_idx], &previous[new_idx]))
            .sum();
        if best.as_ref().map_or(true, |(c, _)| cost < *c) {
            best = Some((cost, order));
        }
    }
    best.map(|(_, order)| order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_by_expansiveness() {
        let means = vec![vec![-1.0, 0.0], vec![2.0, 1.0], vec![0.5, 0.5]];
        assert_eq!(rank_by_expansiveness(&means, &[0, 1]), vec![1, 2, 0]);
        // Ranking on the second column only
        assert_eq!(rank_by_expansiveness(&means, &[1]), vec![1, 2, 0]);
    }

    #[test]
    fn test_rank_ties_keep_original_order() {
        let means = vec![vec![1.0], vec![1.0], vec![3.0]];
        assert_eq!(rank_by_expansiveness(&means, &[0]), vec![2, 0, 1]);
    }

    #[test]
    fn test_permutations_complete() {
        assert_eq!(permutations(1), vec![vec![0]]);
        let three = permutations(3);
        assert_eq!(three.len(), 6);
        assert_eq!(three[0], vec![0, 1, 2]);
        assert_eq!(three[5], vec![2, 1, 0]);
        assert_eq!(permutations(4).len(), 24);
    }

    #[test]
    fn test_match_previous_undoes_label_switch() {
        let previous = vec![vec![2.0, 2.0], vec![0.0, 0.0], vec![-2.0, -2.0]];
        // Same regimes, shuffled and slightly moved
        let refit = vec![vec![-1.9, -2.1], vec![2.1, 1.9], vec![0.1, 0.0]];
        let order = match_previous(&refit, &previous).unwrap();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_match_previous_rejects_incomparable_fits() {
        let previous = vec![vec![1.0], vec![0.0]];
        assert!(match_previous(&[vec![1.0, 0.0], vec![0.0, 1.0]], &previous).is_none());
        assert!(match_previous(&[vec![1.0]], &previous).is_none());
    }
}
