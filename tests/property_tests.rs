//! Property-based tests for bow scoring and database ranking.
//!
//! These check invariants that should hold regardless of input:
//! - Scores are invariant to how a bow vector was assembled
//! - Bounded scores stay in [0, 1]
//! - Queries never return entries sharing no word with the query
//! - Results are sorted, truncated, and filtered by max id

use proptest::prelude::*;
use std::sync::Arc;

use vbow::{
    BoW, BoWTrait, Database, Descriptors, FeatureVector, ScoringType, VocabParams, Vocabulary,
};

prop_compose! {
    /// A normalized bow vector over words 0..32.
    fn arb_bow()(pairs in prop::collection::vec((0u32..32, 0.01f64..1.), 1..12)) -> BoW {
        let mut bow: BoW = pairs.into_iter().collect();
        bow.normalize_l1();
        bow
    }
}

/// One level, one word per distinct row: exactly the 32 words `arb_bow` draws from.
fn tiny_vocabulary(scoring: ScoringType) -> Arc<Vocabulary> {
    let rows: Vec<Vec<f32>> = (0..32).map(|i| vec![i as f32 * 10.]).collect();
    let train = Descriptors::from_float_rows(&rows).unwrap();
    let voc = Vocabulary::create(&train, VocabParams::new(32, 1).scoring(scoring)).unwrap();
    assert_eq!(voc.size(), 32);
    Arc::new(voc)
}

fn arb_scoring() -> impl Strategy<Value = ScoringType> {
    prop_oneof![
        Just(ScoringType::L1Norm),
        Just(ScoringType::L2Norm),
        Just(ScoringType::ChiSquare),
        Just(ScoringType::Kl),
        Just(ScoringType::Bhattacharyya),
        Just(ScoringType::DotProduct),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn scores_ignore_insertion_order(
        words in prop::collection::btree_map(0u32..32, 0.01f64..1., 1..12),
        other in arb_bow(),
        scoring in arb_scoring(),
    ) {
        let forward: BoW = words.iter().map(|(w, v)| (*w, *v)).collect();
        let backward: BoW = words.iter().rev().map(|(w, v)| (*w, *v)).collect();
        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(
            scoring.score(&forward, &other).to_bits(),
            scoring.score(&backward, &other).to_bits()
        );
    }

    #[test]
    fn bounded_scores_stay_in_unit_interval(a in arb_bow(), b in arb_bow()) {
        for s in [a.l1(&b), a.l2(&b), a.bhattacharyya(&b)] {
            prop_assert!((-1e-9..=1. + 1e-9).contains(&s), "score {}", s);
        }
        prop_assert!(a.chi_square(&b) >= 0.);
        prop_assert!(a.kl(&b) >= -1e-9);
        prop_assert!((a.l1(&a) - 1.).abs() < 1e-9);
        prop_assert!((a.bhattacharyya(&a) - 1.).abs() < 1e-9);
    }

    #[test]
    fn query_results_are_consistent(
        entries in prop::collection::vec(arb_bow(), 1..20),
        q in arb_bow(),
        max_results in 0usize..6,
        max_id in prop::option::of(0u32..20),
        scoring in arb_scoring(),
    ) {
        let db = Database::with_vocabulary(tiny_vocabulary(scoring), false, 0);
        for (i, e) in entries.iter().enumerate() {
            prop_assert_eq!(db.add_bow(e.clone(), FeatureVector::new()).unwrap(), i as u32);
        }
        let res = db.query_bow(&q, max_results, max_id).unwrap();

        if max_results > 0 {
            prop_assert!(res.len() <= max_results);
        }
        for r in &res {
            let stored = db.bow(r.entry_id).unwrap();
            prop_assert!(stored.iter().any(|(w, _)| q.get(w) > 0.));
            prop_assert!(r.n_words > 0);
            if let Some(m) = max_id {
                prop_assert!(r.entry_id <= m);
            }
        }
        for w in res.windows(2) {
            prop_assert!(
                w[0].score > w[1].score
                    || (w[0].score == w[1].score && w[0].entry_id < w[1].entry_id)
            );
        }

        // Without truncation, every eligible entry sharing a word is returned.
        let all = db.query_bow(&q, 0, max_id).unwrap();
        let expected = entries
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                max_id.map_or(true, |m| *i as u32 <= m) && e.iter().any(|(w, _)| q.get(w) > 0.)
            })
            .count();
        prop_assert_eq!(all.len(), expected);
    }
}
