use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{NodeId, WordId};

/// Bag-of-Words representation of an image or descriptor set.
///
/// Sparse mapping from word/leaf id in the vocabulary to the total weight
/// of that word in the provided features. Only non-zero weights are stored,
/// and iteration is always in ascending word id order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BoW {
    words: Vec<(WordId, f64)>,
}

impl BoW {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct words with non-zero weight.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Weight of `word`, zero when absent.
    pub fn get(&self, word: WordId) -> f64 {
        match self.words.binary_search_by_key(&word, |&(w, _)| w) {
            Ok(i) => self.words[i].1,
            Err(_) => 0.,
        }
    }

    /// (word id, weight) pairs in ascending word id order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (WordId, f64)> + '_ {
        self.words.iter().copied()
    }

    /// Sum of all weights.
    pub fn l1_norm(&self) -> f64 {
        self.words.iter().map(|(_, v)| v.abs()).sum()
    }

    /// Scale weights so they sum to one. No-op on an empty vector.
    pub fn normalize_l1(&mut self) {
        let sum = self.l1_norm();
        if sum > 0. {
            let inv_sum = 1. / sum;
            for (_, w) in self.words.iter_mut() {
                *w *= inv_sum;
            }
        }
    }

    /// Word ids strictly ascending and every weight positive and finite.
    pub(crate) fn is_canonical(&self) -> bool {
        self.words.windows(2).all(|w| w[0].0 < w[1].0)
            && self.words.iter().all(|&(_, v)| v > 0. && v.is_finite())
    }

    /// Walk the union of words present in either vector, calling `f` with
    /// both weights (zero for the absent side) in ascending word order.
    pub(crate) fn merge_with<F: FnMut(f64, f64)>(&self, other: &Self, mut f: F) {
        let (a, b) = (&self.words, &other.words);
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            let (wa, va) = a[i];
            let (wb, vb) = b[j];
            if wa == wb {
                f(va, vb);
                i += 1;
                j += 1;
            } else if wa < wb {
                f(va, 0.);
                i += 1;
            } else {
                f(0., vb);
                j += 1;
            }
        }
        for &(_, va) in &a[i..] {
            f(va, 0.);
        }
        for &(_, vb) in &b[j..] {
            f(0., vb);
        }
    }
}

impl FromIterator<(WordId, f64)> for BoW {
    /// Collect (word, weight) pairs, summing duplicates and dropping
    /// non-positive weights.
    fn from_iter<I: IntoIterator<Item = (WordId, f64)>>(iter: I) -> Self {
        let mut acc: BTreeMap<WordId, f64> = BTreeMap::new();
        for (w, v) in iter {
            *acc.entry(w).or_insert(0.) += v;
        }
        Self {
            words: acc.into_iter().filter(|&(_, v)| v > 0.).collect(),
        }
    }
}

/// Provides methods for computing the similarity score between bow vectors.
///
/// All methods run over the union of words present in either vector and
/// sum in ascending word order, so results do not depend on how the vectors
/// were built.
pub trait BoWTrait {
    /// `1 - 0.5 * Σ|a_i - b_i|`. 1 for identical L1-normalized vectors.
    /// (Used in Galvez (Eq 2)).
    fn l1(&self, other: &Self) -> f64;
    /// `1 - ||a - b|| / √2`. 1 for identical vectors, decreasing with distance.
    fn l2(&self, other: &Self) -> f64;
    /// Symmetric chi-square statistic `Σ (a_i - b_i)² / (a_i + b_i)`.
    /// 0 for identical vectors, higher means more different.
    fn chi_square(&self, other: &Self) -> f64;
    /// Kullback-Leibler divergence of `self` from `other`. Words missing
    /// from `other` are floored at machine epsilon.
    fn kl(&self, other: &Self) -> f64;
    /// Bhattacharyya coefficient `Σ sqrt(a_i * b_i)`.
    fn bhattacharyya(&self, other: &Self) -> f64;
    /// Inner product.
    fn dot(&self, other: &Self) -> f64;
}

impl BoWTrait for BoW {
    fn l1(&self, other: &Self) -> f64 {
        let mut sum = 0.;
        self.merge_with(other, |a, b| sum += (a - b).abs());
        1. - 0.5 * sum
    }

    fn l2(&self, other: &Self) -> f64 {
        let mut sum = 0.;
        self.merge_with(other, |a, b| sum += (a - b) * (a - b));
        1. - sum.sqrt() / std::f64::consts::SQRT_2
    }

    fn chi_square(&self, other: &Self) -> f64 {
        let mut sum = 0.;
        self.merge_with(other, |a, b| {
            let s = a + b;
            if s > 0. {
                sum += (a - b) * (a - b) / s;
            }
        });
        sum
    }

    fn kl(&self, other: &Self) -> f64 {
        let log_eps = f64::EPSILON.ln();
        let mut sum = 0.;
        self.merge_with(other, |a, b| {
            if a > 0. {
                sum += if b > 0. {
                    a * (a / b).ln()
                } else {
                    a * (a.ln() - log_eps)
                };
            }
        });
        sum
    }

    fn bhattacharyya(&self, other: &Self) -> f64 {
        let mut sum = 0.;
        self.merge_with(other, |a, b| sum += (a * b).sqrt());
        sum
    }

    fn dot(&self, other: &Self) -> f64 {
        let mut sum = 0.;
        self.merge_with(other, |a, b| sum += a * b);
        sum
    }
}

/// This type represents a map from vocabulary nodes to the features that
/// fell under them during transform.
///
/// For a direct index built at `levels_up`, every feature `i` is listed
/// exactly once, under the node at depth `levels - levels_up` on its
/// descent path (the root when `levels_up >= levels`, the leaf itself when
/// the leaf is shallower). Node ids ascend; feature indices within a node
/// ascend.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FeatureVector {
    nodes: BTreeMap<NodeId, Vec<usize>>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, node: NodeId, feature: usize) {
        self.nodes.entry(node).or_default().push(feature);
    }

    /// Feature indices recorded under `node`.
    pub fn features(&self, node: NodeId) -> &[usize] {
        self.nodes.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// (node id, feature indices) pairs in ascending node order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[usize])> + '_ {
        self.nodes.iter().map(|(n, f)| (*n, f.as_slice()))
    }

    /// Number of distinct nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total number of features recorded.
    pub fn num_features(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }
}
