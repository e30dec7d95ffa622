//! CRF search-range hinting from prior VMAF samples.
//!
//! A crf-search bisects between `--min-crf` and `--max-crf`; tight bounds
//! save whole encode probes. Prior samples from the same video bracket
//! tightly, samples from sibling episodes less so.

pub const MIN_CRF: f64 = 5.0;
pub const MAX_CRF: f64 = 70.0;

const OWN_MARGIN: f64 = 2.0;
const SIBLING_MARGIN: f64 = 4.0;

pub const DEFAULT_RANGE: (f64, f64) = (MIN_CRF, MAX_CRF);

/// Pick the search bracket for a video given its own prior samples and
/// those of comparable sibling episodes. A retry ignores history.
pub fn crf_range(
    own: &[(f64, f64)],
    siblings: &[(f64, f64)],
    target: f64,
    retry: bool,
) -> (f64, f64) {
    if retry {
        return DEFAULT_RANGE;
    }

    if !own.is_empty() {
        return bracket(own, target, OWN_MARGIN);
    }
    if !siblings.is_empty() {
        return bracket(siblings, target, SIBLING_MARGIN);
    }
    DEFAULT_RANGE
}

/// Bracket the search space around the pass/fail boundary of the samples.
fn bracket(samples: &[(f64, f64)], target: f64, margin: f64) -> (f64, f64) {
    let max_passing = samples
        .iter()
        .filter(|(_, score)| *score >= target)
        .map(|(crf, _)| *crf)
        .fold(f64::NAN, f64::max);
    let min_failing = samples
        .iter()
        .filter(|(_, score)| *score < target)
        .map(|(crf, _)| *crf)
        .fold(f64::NAN, f64::min);

    let (min_crf, max_crf) = match (max_passing.is_nan(), min_failing.is_nan()) {
        // Boundary is bracketed: search just around it.
        (false, false) => (
            max_passing.floor() - margin,
            min_failing.ceil() + margin,
        ),
        // Everything passed: the boundary is above the highest sample.
        (false, true) => (
            max_passing.floor() - margin,
            max_passing.ceil() + 2.0 * margin,
        ),
        // Everything failed: the boundary is below the lowest sample.
        (true, false) => (MIN_CRF, min_failing.ceil() + margin),
        (true, true) => DEFAULT_RANGE,
    };

    (min_crf.clamp(MIN_CRF, MAX_CRF), max_crf.clamp(MIN_CRF, MAX_CRF))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_samples_bracket_the_boundary() {
        let own = [(22.0, 96.5), (26.0, 94.0), (30.0, 91.0)];
        assert_eq!(crf_range(&own, &[], 95.0, false), (20.0, 28.0));
    }

    #[test]
    fn retry_ignores_all_history() {
        let own = [(22.0, 96.5), (26.0, 94.0)];
        assert_eq!(crf_range(&own, &[], 95.0, true), DEFAULT_RANGE);
    }

    #[test]
    fn only_passing_samples_search_above() {
        let own = [(20.0, 97.0), (24.0, 95.5)];
        // floor(24) - 2 = 22, ceil(24) + 4 = 28
        assert_eq!(crf_range(&own, &[], 95.0, false), (22.0, 28.0));
    }

    #[test]
    fn only_failing_samples_search_below() {
        let own = [(28.0, 93.0), (34.0, 90.0)];
        // floor stays at the absolute minimum, ceil(28) + 2 = 30
        assert_eq!(crf_range(&own, &[], 95.0, false), (5.0, 30.0));
    }

    #[test]
    fn own_samples_take_priority_over_siblings() {
        let own = [(22.0, 96.5), (26.0, 94.0)];
        let siblings = [(40.0, 96.0), (50.0, 90.0)];
        assert_eq!(crf_range(&own, &siblings, 95.0, false), (20.0, 28.0));
    }

    #[test]
    fn sibling_samples_use_the_wider_margin() {
        let siblings = [(22.0, 96.5), (26.0, 94.0)];
        assert_eq!(crf_range(&[], &siblings, 95.0, false), (18.0, 30.0));
    }

    #[test]
    fn no_samples_means_default_range() {
        assert_eq!(crf_range(&[], &[], 95.0, false), DEFAULT_RANGE);
    }

    #[test]
    fn bounds_are_clamped_to_the_legal_window() {
        let own = [(6.0, 96.0), (69.5, 80.0)];
        let (lo, hi) = crf_range(&own, &[], 95.0, false);
        assert!(lo >= MIN_CRF);
        assert!(hi <= MAX_CRF);
    }

    #[test]
    fn fractional_crfs_floor_and_ceil_outward() {
        let own = [(23.5, 95.2), (27.25, 94.1)];
        // floor(23.5) - 2 = 21, ceil(27.25) + 2 = 30
        assert_eq!(crf_range(&own, &[], 95.0, false), (21.0, 30.0));
    }
}
