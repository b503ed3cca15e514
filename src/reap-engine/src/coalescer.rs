//! Turns a per-page boolean classification into coalesced `(startPage, length)` regions,
//! under a minimum included-run size and a minimum gap between included runs.
//!
//! Grounded on the host lineage's `GetNonZeroRegions`/`createWsRegions`: build runs of
//! like-classified pages, drop any included run still too short to be worth keeping
//! (merging its span back into its excluded neighbors), then bridge any excluded run
//! that is now internal (sandwiched between two surviving included runs) and still
//! shorter than the interval threshold into one combined included run. Bridging repeats
//! to a fixed point, since merging two runs can expose a further internal gap.

use std::collections::BTreeMap;

/// One maximal run of same-classification pages, annotated with the minimum non-zero
/// layer observed among its pages (0 if none, or if the run is excluded and thus has no
/// layer concept at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    included: bool,
    start: usize,
    length: usize,
    layer: u32,
}

/// `0` means "no layer"; a zero operand never pulls the result away from the other one.
fn elevate_ignoring_zero(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (a, b) => a.max(b),
    }
}

/// Builds the initial run sequence from `include[i]`, tracking the minimum non-zero
/// `layer[i]` within each included run (`layer` may be empty, meaning "no layers tracked",
/// in which case every run's layer is 0 — this is the overlay-coalescing case).
fn build_runs(include: &[bool], layer: &[u32]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for (i, &inc) in include.iter().enumerate() {
        let page_layer = if layer.is_empty() { 0 } else { layer[i] };
        match runs.last_mut() {
            Some(last) if last.included == inc => {
                last.length += 1;
                if inc {
                    last.layer = match (last.layer, page_layer) {
                        (0, x) => x,
                        (l, 0) => l,
                        (l, x) => l.min(x),
                    };
                }
            }
            _ => runs.push(Run {
                included: inc,
                start: i,
                length: 1,
                layer: if inc { page_layer } else { 0 },
            }),
        }
    }
    runs
}

/// Drops every included run shorter than `size_threshold`, folding its span back into
/// whichever excluded neighbor(s) it had (runs always alternate kind, so an included
/// run's neighbors, when present, are excluded).
fn drop_small_included(mut runs: Vec<Run>, size_threshold: usize) -> Vec<Run> {
    loop {
        let idx = match runs
            .iter()
            .position(|r| r.included && r.length < size_threshold)
        {
            Some(i) => i,
            None => break,
        };
        let dropped_len = runs[idx].length;
        let has_prev = idx > 0;
        let has_next = idx + 1 < runs.len();
        match (has_prev, has_next) {
            (true, true) => {
                let next_len = runs[idx + 1].length;
                runs[idx - 1].length += dropped_len + next_len;
                runs.remove(idx + 1);
                runs.remove(idx);
            }
            (true, false) => {
                runs[idx - 1].length += dropped_len;
                runs.remove(idx);
            }
            (false, true) => {
                runs[idx + 1].start = runs[idx].start;
                runs[idx + 1].length += dropped_len;
                runs.remove(idx);
            }
            (false, false) => {
                runs.remove(idx);
            }
        }
    }
    runs
}

/// Repeatedly merges any excluded run that is internal (has an included run on both
/// sides) and shorter than `interval_threshold` into one combined included run, until no
/// such run remains.
fn bridge_small_gaps(mut runs: Vec<Run>, interval_threshold: usize) -> Vec<Run> {
    loop {
        let idx = (0..runs.len()).find(|&i| {
            !runs[i].included
                && runs[i].length < interval_threshold
                && i > 0
                && i + 1 < runs.len()
                && runs[i - 1].included
                && runs[i + 1].included
        });
        let idx = match idx {
            Some(i) => i,
            None => break,
        };
        let gap_len = runs[idx].length;
        let next_len = runs[idx + 1].length;
        let next_layer = runs[idx + 1].layer;
        runs[idx - 1].length += gap_len + next_len;
        runs[idx - 1].layer = elevate_ignoring_zero(runs[idx - 1].layer, next_layer);
        runs.remove(idx + 1);
        runs.remove(idx);
    }
    runs
}

fn coalesce_runs(
    include: &[bool],
    layer: &[u32],
    size_threshold: usize,
    interval_threshold: usize,
) -> Vec<Run> {
    let runs = build_runs(include, layer);
    let runs = drop_small_included(runs, size_threshold);
    let runs = bridge_small_gaps(runs, interval_threshold);
    runs.into_iter().filter(|r| r.included).collect()
}

/// Coalesces a non-zero/zero classification into an overlay region map, keyed by start
/// page, ignoring layer entirely (overlay regions have no layer concept).
pub fn coalesce_overlay(
    non_zero: &[bool],
    size_threshold: usize,
    interval_threshold: usize,
) -> BTreeMap<u64, u64> {
    coalesce_runs(non_zero, &[], size_threshold, interval_threshold)
        .into_iter()
        .map(|r| (r.start as u64, r.length as u64))
        .collect()
}

/// Coalesces a working-set include/exclude classification into an ordered region list,
/// sorted by `(layer ascending with 0 last, start ascending)`.
pub fn coalesce_working_set(
    include: &[bool],
    layer: &[u32],
    size_threshold: usize,
    interval_threshold: usize,
) -> Vec<(u64, u64)> {
    let mut runs = coalesce_runs(include, layer, size_threshold, interval_threshold);
    runs.sort_by(|a, b| match (a.layer, b.layer) {
        (0, 0) => a.start.cmp(&b.start),
        (0, _) => std::cmp::Ordering::Greater,
        (_, 0) => std::cmp::Ordering::Less,
        (x, y) => x.cmp(&y).then(a.start.cmp(&b.start)),
    });
    runs.into_iter()
        .map(|r| (r.start as u64, r.length as u64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_overlay_scenario_3() {
        let non_zero = vec![true, false, false, true, true, true, false, true];
        let regions = coalesce_overlay(&non_zero, 2, 3);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions.get(&3), Some(&3));
    }

    #[test]
    fn test_coalesce_ws_build_scenario_4() {
        // layer=[2,0,1,0], nonZero=[1,0,1,1], withInactive=false, withZero=false
        // include(i) = layer[i]>0 && nonZero[i] => [true, false, true, false]
        let include = vec![true, false, true, false];
        let layer = vec![2, 0, 1, 0];
        let regions = coalesce_working_set(&include, &layer, 1, 1);
        assert_eq!(regions, vec![(2, 1), (0, 1)]);
    }

    #[test]
    fn test_size_threshold_above_total_pages_emits_nothing() {
        let non_zero = vec![true, true, true];
        let regions = coalesce_overlay(&non_zero, 10, 1);
        assert!(regions.is_empty());
    }

    #[test]
    fn test_interval_threshold_above_total_pages_merges_everything() {
        let non_zero = vec![true, false, true, false, true];
        let regions = coalesce_overlay(&non_zero, 1, 10);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions.get(&0), Some(&5));
    }

    #[test]
    fn test_single_page_image() {
        let non_zero = vec![true];
        let regions = coalesce_overlay(&non_zero, 1, 1);
        assert_eq!(regions.get(&0), Some(&1));
    }

    #[test]
    fn test_coalescer_is_idempotent() {
        let non_zero = vec![true, false, false, true, true, true, false, true, false, true];
        let once = coalesce_overlay(&non_zero, 2, 2);
        let twice = coalesce_overlay(&non_zero, 2, 2);
        assert_eq!(once, twice);
    }

    proptest::proptest! {
        /// Running the coalescer twice over the same (non_zero, thresholds) input always
        /// yields the same regions — §8's "running the region coalescer twice on the same
        /// input yields identical output", checked over arbitrary masks and thresholds
        /// rather than one fixed example.
        #[test]
        fn prop_coalesce_overlay_is_idempotent(
            non_zero in proptest::collection::vec(proptest::bool::ANY, 0..64),
            size_threshold in 1usize..8,
            interval_threshold in 1usize..8,
        ) {
            let once = coalesce_overlay(&non_zero, size_threshold, interval_threshold);
            let twice = coalesce_overlay(&non_zero, size_threshold, interval_threshold);
            proptest::prop_assert_eq!(once, twice);
        }

        /// Emitted regions are always disjoint and page-aligned (within-range), for
        /// arbitrary masks and thresholds (§8's region invariants).
        #[test]
        fn prop_coalesce_overlay_regions_disjoint(
            non_zero in proptest::collection::vec(proptest::bool::ANY, 0..64),
            size_threshold in 1usize..8,
            interval_threshold in 1usize..8,
        ) {
            let regions = coalesce_overlay(&non_zero, size_threshold, interval_threshold);
            let mut sorted: Vec<(u64, u64)> = regions.into_iter().collect();
            sorted.sort();
            let mut prev_end = 0u64;
            for (start, len) in sorted {
                proptest::prop_assert!(start >= prev_end);
                proptest::prop_assert!(start + len <= non_zero.len() as u64);
                prev_end = start + len;
            }
        }
    }

    #[test]
    fn test_empty_input_yields_empty_regions() {
        assert!(coalesce_overlay(&[], 1, 1).is_empty());
        assert!(coalesce_working_set(&[], &[], 1, 1).is_empty());
    }

    #[test]
    fn test_regions_are_disjoint_and_page_aligned() {
        let non_zero = vec![
            true, true, false, false, false, true, true, true, false, true,
        ];
        let regions = coalesce_overlay(&non_zero, 2, 2);
        let mut covered: Vec<(u64, u64)> = regions.into_iter().collect();
        covered.sort();
        let mut prev_end = 0u64;
        for (start, len) in covered {
            assert!(start >= prev_end);
            prev_end = start + len;
        }
    }
}
