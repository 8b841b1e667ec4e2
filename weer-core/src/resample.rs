//! Split/merge passes over the walkers of a single bin.
//!
//! Every pass changes only the number of walkers, never their combined
//! weight. Passes that merge draw the surviving history from `rng`.

use crate::errors::{WeError, WeResult};
use crate::observer::ThresholdViolation;
use crate::walker::{by_weight, merge_walkers, split_walker, Walker};
use rand::Rng;

/// Allowed range of individual walker weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightBounds {
    pub smallest: f64,
    pub largest: f64,
}

impl WeightBounds {
    pub fn new(smallest: f64, largest: f64) -> WeResult<Self> {
        if smallest > largest {
            return Err(WeError::Configuration(format!(
                "smallest allowed weight ({}) is greater than largest allowed weight ({})",
                smallest, largest
            )));
        }
        Ok(Self { smallest, largest })
    }

    pub fn contains(&self, weight: f64) -> bool {
        self.smallest <= weight && weight <= self.largest
    }
}

/// Split every walker heavier than `split_threshold * ideal_weight` into
/// `ceil(weight / ideal_weight)` copies.
pub fn split_by_weight(
    walkers: &mut Vec<Walker>,
    ideal_weight: f64,
    split_threshold: f64,
) -> WeResult<()> {
    if !(ideal_weight > 0.0) {
        return Ok(());
    }

    walkers.sort_by(by_weight);
    let mut result = Vec::with_capacity(walkers.len());
    for walker in walkers.drain(..) {
        if walker.weight > split_threshold * ideal_weight {
            let m = (walker.weight / ideal_weight).ceil() as usize;
            result.extend(split_walker(&walker, m.max(1))?);
        } else {
            result.push(walker);
        }
    }
    *walkers = result;
    Ok(())
}

/// Repeatedly merge the lightest walkers whose cumulative weight does not
/// exceed `merge_cutoff * ideal_weight`, until fewer than two qualify.
pub fn merge_by_weight<R: Rng + ?Sized>(
    walkers: &mut Vec<Walker>,
    ideal_weight: f64,
    merge_cutoff: f64,
    rng: &mut R,
) -> WeResult<()> {
    let cutoff = ideal_weight * merge_cutoff;
    loop {
        walkers.sort_by(by_weight);
        let mut cumulative = 0.0;
        let count = walkers
            .iter()
            .take_while(|w| {
                cumulative += w.weight;
                cumulative <= cutoff
            })
            .count();
        if count < 2 {
            return Ok(());
        }

        let merged = merge_walkers(walkers.drain(..count).collect(), rng)?;
        walkers.push(merged);
    }
}

/// Bring the walkers held by `groups` to exactly `target_count`.
///
/// `groups` must be ordered by priority, heaviest first. While there are too
/// few walkers, the heaviest walker of each group in turn is split in two.
/// While there are too many, the two lightest walkers of each group are
/// merged, starting from the last (lightest) group. Once every group is down
/// to a single walker the remaining merges run over all walkers together.
pub fn adjust_count<R: Rng + ?Sized>(
    groups: &mut Vec<Vec<Walker>>,
    target_count: usize,
    rng: &mut R,
) -> WeResult<()> {
    let mut count: usize = groups.iter().map(Vec::len).sum();
    if count == 0 {
        return Ok(());
    }
    if target_count == 0 {
        return Err(WeError::Configuration(
            "Cannot adjust a non-empty set of walkers to a target count of 0".to_string(),
        ));
    }

    while count < target_count {
        for group in groups.iter_mut().filter(|g| !g.is_empty()) {
            group.sort_by(by_weight);
            if let Some(heaviest) = group.pop() {
                group.extend(split_walker(&heaviest, 2)?);
                count += 1;
            }
            if count == target_count {
                break;
            }
        }
    }

    while count > target_count {
        let mut merged_any = false;
        for group in groups.iter_mut().rev() {
            if group.len() < 2 {
                continue;
            }
            group.sort_by(by_weight);
            let lightest: Vec<Walker> = group.drain(..2).collect();
            group.push(merge_walkers(lightest, rng)?);
            count -= 1;
            merged_any = true;
            if count == target_count {
                break;
            }
        }

        if !merged_any {
            let all: Vec<Walker> = groups.drain(..).flatten().collect();
            groups.push(all);
        }
    }
    Ok(())
}

/// Split walkers heavier than `largest` into `ceil(weight / largest)` copies,
/// heaviest first, without growing the set beyond `max_count` walkers.
///
/// A walker that would exceed the remaining room is split into as many copies
/// as still fit.
pub fn split_by_threshold(
    walkers: &mut Vec<Walker>,
    largest: f64,
    max_count: usize,
) -> WeResult<()> {
    if !(largest > 0.0) {
        return Ok(());
    }

    walkers.sort_by(|a, b| by_weight(b, a));
    let mut room = max_count.saturating_sub(walkers.len());
    let mut result = Vec::with_capacity(walkers.len() + room);
    for walker in walkers.drain(..) {
        if walker.weight > largest && room > 0 {
            let wanted = (walker.weight / largest).ceil();
            let m = if wanted.is_finite() && wanted < (room + 1) as f64 {
                (wanted as usize).max(1)
            } else {
                room + 1
            };
            room -= m - 1;
            result.extend(split_walker(&walker, m)?);
        } else {
            result.push(walker);
        }
    }
    *walkers = result;
    Ok(())
}

/// Merge all walkers lighter than `smallest` into one while at least two qualify.
pub fn merge_by_threshold<R: Rng + ?Sized>(
    walkers: &mut Vec<Walker>,
    smallest: f64,
    rng: &mut R,
) -> WeResult<()> {
    loop {
        walkers.sort_by(by_weight);
        let count = walkers.iter().take_while(|w| w.weight < smallest).count();
        if count < 2 {
            return Ok(());
        }

        let merged = merge_walkers(walkers.drain(..count).collect(), rng)?;
        walkers.push(merged);
    }
}

/// Best-effort weight-bound enforcement for a bin already at its target count.
///
/// Light walkers are merged first, then heavy walkers are split into the room
/// that leaves below `target_count`. The count is then restored to
/// `target_count` with [`adjust_count`], and every walker still outside
/// `bounds` is returned as a violation. The target count always wins over
/// the bounds.
pub fn enforce_thresholds<R: Rng + ?Sized>(
    walkers: &mut Vec<Walker>,
    bounds: WeightBounds,
    target_count: usize,
    bin_index: usize,
    rng: &mut R,
) -> WeResult<Vec<ThresholdViolation>> {
    merge_by_threshold(walkers, bounds.smallest, rng)?;
    split_by_threshold(walkers, bounds.largest, target_count)?;

    if walkers.len() != target_count {
        let mut groups = vec![std::mem::take(walkers)];
        adjust_count(&mut groups, target_count, rng)?;
        *walkers = groups.into_iter().flatten().collect();
    }

    Ok(walkers
        .iter()
        .filter(|w| !bounds.contains(w.weight))
        .map(|w| ThresholdViolation {
            bin_index,
            weight: w.weight,
            parent_id: w.parent_id,
            smallest_allowed_weight: bounds.smallest,
            largest_allowed_weight: bounds.largest,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::total_weight;
    use is_close::is_close;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn walkers(weights: &[f64]) -> Vec<Walker> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                Walker::from_trajectory(w, vec![i as f64])
                    .unwrap()
                    .with_parent(i as i64)
            })
            .collect()
    }

    fn sorted_weights(walkers: &[Walker]) -> Vec<f64> {
        let mut weights: Vec<f64> = walkers.iter().map(|w| w.weight).collect();
        weights.sort_by(f64::total_cmp);
        weights
    }

    #[test]
    fn test_split_by_weight() {
        let mut ws = walkers(&[0.5, 0.1, 0.1, 0.1, 0.2]);
        split_by_weight(&mut ws, 0.2, 2.0).unwrap();

        assert_eq!(ws.len(), 7);
        assert!(is_close!(total_weight(&ws), 1.0));
        let copies: Vec<&Walker> = ws.iter().filter(|w| w.parent_id == 0).collect();
        assert_eq!(copies.len(), 3);
        for c in copies {
            assert!(is_close!(c.weight, 0.5 / 3.0));
        }
    }

    #[test]
    fn test_split_by_weight_below_threshold_is_noop() {
        let mut ws = walkers(&[0.35, 0.25, 0.4]);
        split_by_weight(&mut ws, 0.25, 2.0).unwrap();
        assert_eq!(ws.len(), 3);
    }

    #[test]
    fn test_merge_by_weight_merges_lightest_prefix() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut ws = walkers(&[0.05, 0.6, 0.05, 0.25, 0.05]);
        merge_by_weight(&mut ws, 0.2, 1.0, &mut rng).unwrap();

        assert_eq!(ws.len(), 3);
        assert!(is_close!(total_weight(&ws), 1.0));
        let weights = sorted_weights(&ws);
        assert!(is_close!(weights[0], 0.15));
        assert!(is_close!(weights[1], 0.25));
        assert!(is_close!(weights[2], 0.6));
    }

    #[test]
    fn test_adjust_count_splits_heaviest() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut groups = vec![walkers(&[0.6, 0.4])];
        adjust_count(&mut groups, 4, &mut rng).unwrap();

        let all: Vec<Walker> = groups.into_iter().flatten().collect();
        let weights = sorted_weights(&all);
        assert_eq!(weights.len(), 4);
        assert!(is_close!(weights[0], 0.2));
        assert!(is_close!(weights[1], 0.2));
        assert!(is_close!(weights[2], 0.3));
        assert!(is_close!(weights[3], 0.3));
    }

    #[test]
    fn test_adjust_count_merges_from_lightest_group() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut groups = vec![walkers(&[0.4, 0.1, 0.1]), walkers(&[0.3, 0.1])];
        adjust_count(&mut groups, 3, &mut rng).unwrap();

        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert!(is_close!(groups[1][0].weight, 0.4));
        let all: Vec<Walker> = groups.into_iter().flatten().collect();
        assert!(is_close!(total_weight(&all), 1.0));
    }

    #[test]
    fn test_adjust_count_single_walker_groups() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut groups = vec![walkers(&[0.5]), walkers(&[0.3]), walkers(&[0.2])];
        adjust_count(&mut groups, 1, &mut rng).unwrap();

        let all: Vec<Walker> = groups.into_iter().flatten().collect();
        assert_eq!(all.len(), 1);
        assert!(is_close!(all[0].weight, 1.0));
    }

    #[test]
    fn test_adjust_count_rejects_zero_target() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut groups = vec![walkers(&[1.0])];
        assert!(matches!(
            adjust_count(&mut groups, 0, &mut rng),
            Err(WeError::Configuration(_))
        ));

        let mut empty: Vec<Vec<Walker>> = vec![];
        assert!(adjust_count(&mut empty, 0, &mut rng).is_ok());
    }

    #[test]
    fn test_merge_by_threshold() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut ws = walkers(&[1e-5, 0.5, 1e-5, 1e-5]);
        merge_by_threshold(&mut ws, 1e-3, &mut rng).unwrap();

        assert_eq!(ws.len(), 2);
        assert!(is_close!(sorted_weights(&ws)[0], 3e-5));
    }

    #[test]
    fn test_thresholds_split_heavy_walker_when_count_allows() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut ws = walkers(&[0.3]);
        let bounds = WeightBounds::new(1e-310, 0.1).unwrap();
        let violations = enforce_thresholds(&mut ws, bounds, 3, 0, &mut rng).unwrap();

        assert!(violations.is_empty(), "{:?}", violations);
        assert_eq!(ws.len(), 3);
        assert!(ws.iter().all(|w| w.weight <= 0.1));
    }

    #[test]
    fn test_thresholds_report_when_count_wins() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut ws = walkers(&[0.3]);
        let bounds = WeightBounds::new(1e-310, 0.1).unwrap();
        let violations = enforce_thresholds(&mut ws, bounds, 1, 4, &mut rng).unwrap();

        assert_eq!(ws.len(), 1);
        assert!(is_close!(ws[0].weight, 0.3));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].bin_index, 4);
        assert_eq!(violations[0].parent_id, 0);
    }

    #[test]
    fn test_split_by_threshold_stops_at_max_count() {
        let mut ws = walkers(&[0.2, 0.8]);
        split_by_threshold(&mut ws, 0.1, 5).unwrap();

        assert_eq!(ws.len(), 5);
        assert!(is_close!(total_weight(&ws), 1.0));
        // All the room goes to the heaviest walker
        assert_eq!(ws.iter().filter(|w| w.parent_id == 1).count(), 4);
        assert_eq!(ws.iter().filter(|w| w.parent_id == 0).count(), 1);
    }

    #[test]
    fn test_thresholds_with_tiny_upper_bound() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut ws = walkers(&[1.0]);
        let bounds = WeightBounds::new(1e-310, 1e-5).unwrap();
        let violations = enforce_thresholds(&mut ws, bounds, 4, 0, &mut rng).unwrap();

        assert_eq!(ws.len(), 4);
        for w in &ws {
            assert!(is_close!(w.weight, 0.25));
        }
        assert_eq!(violations.len(), 4);
    }

    #[test]
    fn test_weight_bounds() {
        assert!(WeightBounds::new(0.5, 0.1).is_err());
        let bounds = WeightBounds::new(0.1, 0.5).unwrap();
        assert!(bounds.contains(0.1));
        assert!(bounds.contains(0.5));
        assert!(!bounds.contains(0.05));
        assert!(!bounds.contains(0.6));
    }
}
