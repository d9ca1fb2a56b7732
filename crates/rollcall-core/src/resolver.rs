//! Identity resolution: which known user, if any, a query embedding belongs to.

use crate::embedder::FaceMetric;
use crate::types::{Embedding, MatchResult, Snapshot};
use std::str::FromStr;

/// How to pick among several known embeddings within tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// First matching entry in snapshot order, regardless of distance.
    ///
    /// Confidence still reflects the closest embedding overall, which may
    /// belong to a different user than the one selected.
    #[default]
    FirstMatch,
    /// The matching entry with the smallest distance.
    Nearest,
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Self::FirstMatch),
            "nearest" => Ok(Self::Nearest),
            other => Err(format!("unknown tie-break policy: {other} (expected first or nearest)")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    pub tolerance: f32,
    pub tie_break: TieBreak,
}

impl IdentityResolver {
    pub fn new(tolerance: f32) -> Self {
        Self {
            tolerance,
            tie_break: TieBreak::default(),
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Match `query` against every known embedding in `snapshot`.
    ///
    /// Always walks the whole snapshot: confidence is `1 - min distance`
    /// over all entries, clamped to [0, 1].
    pub fn resolve<M>(&self, query: &Embedding, snapshot: &Snapshot, metric: &M) -> MatchResult
    where
        M: FaceMetric + ?Sized,
    {
        let mut min_distance = f32::INFINITY;
        let mut selected: Option<(usize, f32)> = None;

        for (idx, known) in snapshot.faces().iter().enumerate() {
            let distance = metric.distance(query, &known.embedding);
            min_distance = min_distance.min(distance);

            if !metric.matches(query, &known.embedding, self.tolerance) {
                continue;
            }
            selected = match (self.tie_break, selected) {
                (_, None) => Some((idx, distance)),
                (TieBreak::Nearest, Some((_, best))) if distance < best => Some((idx, distance)),
                (_, keep) => keep,
            };
        }

        match selected {
            Some((idx, _)) => MatchResult {
                user_id: Some(snapshot.faces()[idx].user_id),
                confidence: (1.0 - min_distance).clamp(0.0, 1.0),
            },
            None => MatchResult::absent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::EuclideanMetric;
    use crate::types::KnownFace;

    fn known(user_id: i64, values: Vec<f32>) -> KnownFace {
        KnownFace {
            user_id,
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_empty_snapshot_is_absent() {
        let resolver = IdentityResolver::new(0.6);
        for query in [vec![0.0, 0.0], vec![1.0, -3.0], vec![]] {
            let result = resolver.resolve(&Embedding::new(query), &Snapshot::default(), &EuclideanMetric);
            assert_eq!(result, MatchResult::absent());
        }
    }

    #[test]
    fn test_exact_match_has_full_confidence() {
        let snapshot = Snapshot::new(vec![known(7, vec![0.2, 0.4])]);
        let result = IdentityResolver::new(0.6).resolve(
            &Embedding::new(vec![0.2, 0.4]),
            &snapshot,
            &EuclideanMetric,
        );
        assert_eq!(result.user_id, Some(7));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_no_match_is_absent_with_zero_confidence() {
        let snapshot = Snapshot::new(vec![known(1, vec![0.0, 0.0])]);
        let result = IdentityResolver::new(0.6).resolve(
            &Embedding::new(vec![0.3, 0.7]),
            &snapshot,
            &EuclideanMetric,
        );
        assert_eq!(result, MatchResult::absent());
    }

    #[test]
    fn test_first_match_wins_with_closest_overall_confidence() {
        // Both within tolerance; user 2 is strictly closer.
        let snapshot = Snapshot::new(vec![known(1, vec![0.5, 0.0]), known(2, vec![0.1, 0.0])]);
        let result = IdentityResolver::new(0.6).resolve(
            &Embedding::new(vec![0.0, 0.0]),
            &snapshot,
            &EuclideanMetric,
        );
        assert_eq!(result.user_id, Some(1));
        assert!((result.confidence - 0.9).abs() < 1e-6, "confidence {}", result.confidence);
    }

    #[test]
    fn test_nearest_tie_break_selects_closest() {
        let snapshot = Snapshot::new(vec![known(1, vec![0.5, 0.0]), known(2, vec![0.1, 0.0])]);
        let result = IdentityResolver::new(0.6)
            .with_tie_break(TieBreak::Nearest)
            .resolve(&Embedding::new(vec![0.0, 0.0]), &snapshot, &EuclideanMetric);
        assert_eq!(result.user_id, Some(2));
        assert!((result.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_user_with_several_embeddings() {
        // Entries outside tolerance are ignored for selection but still
        // take part in the minimum distance.
        let snapshot = Snapshot::new(vec![
            known(3, vec![0.4, 0.0]),
            known(3, vec![2.0, 0.0]),
            known(4, vec![0.55, 0.0]),
        ]);
        let result = IdentityResolver::new(0.6).resolve(
            &Embedding::new(vec![0.0, 0.0]),
            &snapshot,
            &EuclideanMetric,
        );
        assert_eq!(result.user_id, Some(3));
        assert!((result.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_is_clamped_to_unit_interval() {
        // Tolerance above 1 lets a match through with distance > 1.
        let snapshot = Snapshot::new(vec![known(5, vec![1.5, 0.0])]);
        let result = IdentityResolver::new(2.0).resolve(
            &Embedding::new(vec![0.0, 0.0]),
            &snapshot,
            &EuclideanMetric,
        );
        assert_eq!(result.user_id, Some(5));
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_tie_break_parses() {
        assert_eq!("first".parse::<TieBreak>(), Ok(TieBreak::FirstMatch));
        assert_eq!("nearest".parse::<TieBreak>(), Ok(TieBreak::Nearest));
        assert!("best".parse::<TieBreak>().is_err());
    }
}
