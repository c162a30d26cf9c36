use serde::{Deserialize, Serialize};

use crate::bow::{BoW, BoWTrait};

/// Selects how two bow vectors are compared.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoringType {
    L1Norm,
    L2Norm,
    ChiSquare,
    Kl,
    Bhattacharyya,
    DotProduct,
}

impl Default for ScoringType {
    fn default() -> Self {
        ScoringType::L1Norm
    }
}

impl ScoringType {
    /// Raw score of `a` against `b` as defined by the [`BoWTrait`] method
    /// for this kind. Chi-square and KL grow with dissimilarity; every other
    /// kind grows with similarity.
    pub fn score(&self, a: &BoW, b: &BoW) -> f64 {
        match self {
            ScoringType::L1Norm => a.l1(b),
            ScoringType::L2Norm => a.l2(b),
            ScoringType::ChiSquare => a.chi_square(b),
            ScoringType::Kl => a.kl(b),
            ScoringType::Bhattacharyya => a.bhattacharyya(b),
            ScoringType::DotProduct => a.dot(b),
        }
    }

    /// True for kinds where a lower raw score means a better match.
    pub fn is_distance(&self) -> bool {
        matches!(self, ScoringType::ChiSquare | ScoringType::Kl)
    }

    /// Score oriented so that higher is always a better match. Distances
    /// are negated.
    pub fn similarity(&self, a: &BoW, b: &BoW) -> f64 {
        self.orient(self.score(a, b))
    }

    /// Orient a raw score of this kind so that higher is better.
    pub fn orient(&self, raw: f64) -> f64 {
        if self.is_distance() {
            // 0 - raw keeps an exact match at +0.0
            0. - raw
        } else {
            raw
        }
    }

    /// Score of a vector against itself, when the kind has a fixed one for
    /// L1-normalized input.
    pub fn max_score(&self) -> Option<f64> {
        match self {
            ScoringType::L1Norm | ScoringType::L2Norm | ScoringType::Bhattacharyya => Some(1.),
            ScoringType::ChiSquare | ScoringType::Kl => Some(0.),
            ScoringType::DotProduct => None,
        }
    }
}
