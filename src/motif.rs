//! Cue-sequence motif decomposition.
//!
//! A VR scene hands the coordinator one long sequence of wall-cue identifiers. The
//! decomposer segments that sequence into trials by matching the configured trial
//! motifs against it: scanning left to right, it tries every registered motif at the
//! current position, emits a trial boundary for the first one that matches, and
//! advances past the matched cues. Motifs are tried in registration order and the
//! first match wins, so overlapping motif sets behave predictably. Positions that
//! match no motif are skipped one cue at a time without an error.
//!
//! Decomposition runs once per session, but trial configurations are refreshed from
//! disk between sessions, so the flattened motif storage is cached across calls and
//! rebuilt only when the motif set's content actually changes. The scan itself works
//! on contiguous arrays and allocates nothing per position.

use crate::config::TrialStructure;

/// One detected trial boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrialBoundary {
    /// Index into the cue sequence where the matched motif starts.
    pub start: usize,
    /// Registration index of the matched motif.
    pub motif: usize,
    /// Physical distance assigned to the trial, in centimeters.
    pub distance_cm: f64,
}

/// Flattened motif storage derived from one motif set.
///
/// All motif cues live in a single contiguous array; per-motif start offsets and
/// lengths give O(1) access without per-call allocation.
struct FlatMotifIndex {
    /// The motif set this index was built from, kept for cache validation.
    motifs: Vec<Vec<u8>>,
    /// Per-motif physical distances, kept for cache validation.
    distances: Vec<f64>,
    /// All motif cues, concatenated in registration order.
    flat: Vec<u8>,
    /// Start offset of each motif within `flat`.
    starts: Vec<usize>,
    /// Length of each motif, in cues.
    lengths: Vec<usize>,
}

impl FlatMotifIndex {
    fn build(trials: &[TrialStructure]) -> Self {
        let total: usize = trials.iter().map(|t| t.cues.len()).sum();
        let mut flat = Vec::with_capacity(total);
        let mut starts = Vec::with_capacity(trials.len());
        let mut lengths = Vec::with_capacity(trials.len());

        for trial in trials {
            starts.push(flat.len());
            lengths.push(trial.cues.len());
            flat.extend_from_slice(&trial.cues);
        }

        Self {
            motifs: trials.iter().map(|t| t.cues.clone()).collect(),
            distances: trials.iter().map(|t| t.distance_cm).collect(),
            flat,
            starts,
            lengths,
        }
    }

    fn matches(&self, trials: &[TrialStructure]) -> bool {
        self.motifs.len() == trials.len()
            && self
                .motifs
                .iter()
                .zip(trials)
                .all(|(cached, trial)| *cached == trial.cues)
            && self
                .distances
                .iter()
                .zip(trials)
                .all(|(cached, trial)| *cached == trial.distance_cm)
    }
}

/// Segments raw cue sequences into trials, caching the flattened motif index
/// between calls with an unchanged motif set.
#[derive(Default)]
pub struct MotifDecomposer {
    index: Option<FlatMotifIndex>,
    rebuilds: u64,
}

impl MotifDecomposer {
    /// Creates a decomposer with a cold cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the flattened index has been (re)built. Used to verify
    /// cache behavior.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Decomposes `sequence` into at most `max_trials` trial boundaries.
    ///
    /// An empty motif set or a sequence shorter than every motif yields zero
    /// boundaries; neither is an error.
    pub fn decompose(
        &mut self,
        trials: &[TrialStructure],
        sequence: &[u8],
        max_trials: usize,
    ) -> Vec<TrialBoundary> {
        if trials.is_empty() {
            return Vec::new();
        }
        self.ensure_index(trials);

        // The index is rebuilt above whenever it is missing or stale.
        let Some(index) = self.index.as_ref() else {
            return Vec::new();
        };

        let mut boundaries = Vec::new();
        let mut pos = 0;

        while pos < sequence.len() && boundaries.len() < max_trials {
            let mut matched = false;

            for motif in 0..index.lengths.len() {
                let length = index.lengths[motif];
                if length == 0 || pos + length > sequence.len() {
                    continue;
                }
                let start = index.starts[motif];
                if sequence[pos..pos + length] == index.flat[start..start + length] {
                    boundaries.push(TrialBoundary {
                        start: pos,
                        motif,
                        distance_cm: index.distances[motif],
                    });
                    pos += length;
                    matched = true;
                    break;
                }
            }

            if !matched {
                // Unmatched cues carry no trial; skip them one position at a time.
                pos += 1;
            }
        }

        boundaries
    }

    fn ensure_index(&mut self, trials: &[TrialStructure]) {
        let stale = match self.index.as_ref() {
            Some(index) => !index.matches(trials),
            None => true,
        };
        if stale {
            self.index = Some(FlatMotifIndex::build(trials));
            self.rebuilds += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrialStructure;

    fn motifs() -> Vec<TrialStructure> {
        vec![
            TrialStructure::reward("a", vec![1, 2, 3], 50.0, 5.0),
            TrialStructure::aversive("b", vec![4, 5], 20.0, 100),
        ]
    }

    fn distances(boundaries: &[TrialBoundary]) -> Vec<f64> {
        boundaries.iter().map(|b| b.distance_cm).collect()
    }

    #[test]
    fn test_reference_sequence_decomposition() {
        let mut decomposer = MotifDecomposer::new();
        let boundaries = decomposer.decompose(&motifs(), &[1, 2, 3, 4, 5, 1, 2, 3], 100);

        assert_eq!(boundaries.len(), 3);
        assert_eq!(distances(&boundaries), vec![50.0, 20.0, 50.0]);
        assert_eq!(boundaries[0].start, 0);
        assert_eq!(boundaries[1].start, 3);
        assert_eq!(boundaries[2].start, 5);
    }

    #[test]
    fn test_deterministic_cold_and_warm() {
        let mut decomposer = MotifDecomposer::new();
        let sequence = [1, 2, 3, 4, 5, 4, 5, 1, 2, 3];

        let cold = decomposer.decompose(&motifs(), &sequence, 100);
        assert_eq!(decomposer.rebuild_count(), 1);

        let warm = decomposer.decompose(&motifs(), &sequence, 100);
        assert_eq!(decomposer.rebuild_count(), 1, "warm call must reuse the index");
        assert_eq!(cold, warm);
    }

    #[test]
    fn test_changed_motif_set_rebuilds_index() {
        let mut decomposer = MotifDecomposer::new();
        let sequence = [1, 2, 3];

        decomposer.decompose(&motifs(), &sequence, 100);

        let mut changed = motifs();
        changed[0].distance_cm = 60.0;
        let boundaries = decomposer.decompose(&changed, &sequence, 100);

        assert_eq!(decomposer.rebuild_count(), 2);
        assert_eq!(boundaries[0].distance_cm, 60.0);
    }

    #[test]
    fn test_registration_order_breaks_overlap_ties() {
        // Both motifs match at position 0; the earlier-registered, shorter motif
        // must win even though a longer match exists.
        let trials = vec![
            TrialStructure::reward("short", vec![1, 2], 10.0, 5.0),
            TrialStructure::reward("long", vec![1, 2, 3], 30.0, 5.0),
        ];
        let mut decomposer = MotifDecomposer::new();
        let boundaries = decomposer.decompose(&trials, &[1, 2, 3], 100);

        assert_eq!(boundaries.len(), 1);
        assert_eq!(boundaries[0].motif, 0);
        assert_eq!(boundaries[0].distance_cm, 10.0);
    }

    #[test]
    fn test_longer_motif_matches_when_registered_first() {
        let trials = vec![
            TrialStructure::reward("long", vec![1, 2, 3], 30.0, 5.0),
            TrialStructure::reward("short", vec![1, 2], 10.0, 5.0),
        ];
        let mut decomposer = MotifDecomposer::new();
        let boundaries = decomposer.decompose(&trials, &[1, 2, 3, 1, 2], 100);

        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].motif, 0);
        assert_eq!(boundaries[1].motif, 1);
    }

    #[test]
    fn test_unmatched_cues_are_skipped() {
        let mut decomposer = MotifDecomposer::new();
        let boundaries = decomposer.decompose(&motifs(), &[9, 9, 1, 2, 3, 7, 4, 5], 100);

        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].start, 2);
        assert_eq!(boundaries[1].start, 6);
    }

    #[test]
    fn test_empty_motif_set_yields_zero_trials() {
        let mut decomposer = MotifDecomposer::new();
        assert!(decomposer.decompose(&[], &[1, 2, 3], 100).is_empty());
    }

    #[test]
    fn test_sequence_shorter_than_any_motif() {
        let mut decomposer = MotifDecomposer::new();
        assert!(decomposer.decompose(&motifs(), &[1], 100).is_empty());
    }

    #[test]
    fn test_max_trial_bound_stops_scan() {
        let mut decomposer = MotifDecomposer::new();
        let boundaries = decomposer.decompose(&motifs(), &[4, 5, 4, 5, 4, 5, 4, 5], 2);
        assert_eq!(boundaries.len(), 2);
    }
}
