//! C5: combination generator — pruned subset-sum enumeration over candidate
//! invoice residuals against a target transaction amount.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::EPSILON;

#[derive(Debug, Clone)]
pub struct Combination {
    pub invoice_ids: Vec<Uuid>,
    pub sum: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchBudget {
    pub max_wallclock: Duration,
    /// Per-size cap on DFS nodes visited, independent of the wall clock.
    pub max_iterations_per_size: u64,
}

impl Default for SearchBudget {
    fn default() -> Self {
        SearchBudget {
            max_wallclock: Duration::from_secs(30),
            max_iterations_per_size: 200_000,
        }
    }
}

/// Enumerates subsets of `candidates` summing to `target` within ε.
/// `candidates` need not be pre-sorted — this function sorts a local copy.
/// Sizes 2 and 3 are always attempted; sizes 4..=max_size are attempted
/// only if fewer than 5 combinations were found in sizes 2-3 and the
/// overall budget has time remaining (§4.5).
pub fn generate_combinations(
    candidates: &[(Uuid, Decimal)],
    target: Decimal,
    max_size: usize,
    workers: usize,
    budget: SearchBudget,
) -> Vec<Combination> {
    let start = Instant::now();
    let deadline = start + budget.max_wallclock;

    let mut sorted: Vec<(Uuid, Decimal)> = candidates.to_vec();
    sorted.sort_by(|a, b| a.1.cmp(&b.1));
    let values: Vec<Decimal> = sorted.iter().map(|(_, v)| v).copied().collect();

    let mut all_results: Vec<Vec<usize>> = Vec::new();

    for size in 2..=max_size.min(3).max(2) {
        if Instant::now() >= deadline {
            break;
        }
        all_results.extend(search_size(&values, target, size, deadline, budget.max_iterations_per_size, workers));
    }

    if all_results.len() < 5 && max_size > 3 {
        for size in 4..=max_size {
            if Instant::now() >= deadline {
                break;
            }
            all_results.extend(search_size(&values, target, size, deadline, budget.max_iterations_per_size, workers));
        }
    }

    dedupe(all_results, &sorted)
}

fn dedupe(raw: Vec<Vec<usize>>, sorted: &[(Uuid, Decimal)]) -> Vec<Combination> {
    let mut seen: HashSet<(Decimal, Vec<Uuid>)> = HashSet::new();
    let mut out = Vec::new();

    for combo in raw {
        let sum: Decimal = combo.iter().map(|&i| sorted[i].1).sum();
        let quantized = crate::numeric::quantize(sum, 2);
        let mut ids: Vec<Uuid> = combo.iter().map(|&i| sorted[i].0).collect();
        ids.sort();
        let key = (quantized, ids.clone());
        if seen.insert(key) {
            out.push(Combination {
                invoice_ids: ids,
                sum,
            });
        }
    }
    out
}

/// Searches all combinations of exactly `size` elements. For size >= 3 with
/// at least 10 candidates, the candidate array is partitioned across
/// `workers` worker-local generators by first-pick index, each producing
/// independent results that are merged (§4.5 "may be parallelized").
fn search_size(
    values: &[Decimal],
    target: Decimal,
    size: usize,
    deadline: Instant,
    max_iterations: u64,
    workers: usize,
) -> Vec<Vec<usize>> {
    let n = values.len();
    if size > n {
        return Vec::new();
    }
    let last_start = n - size;

    if size >= 3 && n >= 10 && workers > 1 {
        let shard_width = (last_start + 1).div_ceil(workers).max(1);
        let shards: Vec<(usize, usize)> = (0..workers)
            .map(|w| {
                let lo = w * shard_width;
                let hi = ((w + 1) * shard_width).min(last_start + 1);
                (lo, hi)
            })
            .filter(|(lo, hi)| lo < hi)
            .collect();

        std::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .into_iter()
                .map(|(lo, hi)| {
                    scope.spawn(move || {
                        let mut results = Vec::new();
                        let mut budget_exceeded = false;
                        let mut iterations = 0u64;
                        for first in lo..hi {
                            if budget_exceeded || Instant::now() >= deadline {
                                break;
                            }
                            let mut chosen = vec![first];
                            dfs(
                                values,
                                target,
                                size,
                                first + 1,
                                values[first],
                                &mut chosen,
                                &mut results,
                                deadline,
                                max_iterations,
                                &mut iterations,
                                &mut budget_exceeded,
                            );
                        }
                        results
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap_or_default()).collect()
        })
    } else {
        let mut results = Vec::new();
        let mut budget_exceeded = false;
        let mut iterations = 0u64;
        let mut chosen = Vec::with_capacity(size);
        dfs(
            values,
            target,
            size,
            0,
            Decimal::ZERO,
            &mut chosen,
            &mut results,
            deadline,
            max_iterations,
            &mut iterations,
            &mut budget_exceeded,
        );
        results
    }
}

#[allow(clippy::too_many_arguments)]
fn dfs(
    values: &[Decimal],
    target: Decimal,
    size: usize,
    start_idx: usize,
    current_sum: Decimal,
    chosen: &mut Vec<usize>,
    results: &mut Vec<Vec<usize>>,
    deadline: Instant,
    max_iterations: u64,
    iterations: &mut u64,
    budget_exceeded: &mut bool,
) {
    if *budget_exceeded {
        return;
    }
    *iterations += 1;
    if *iterations > max_iterations || Instant::now() >= deadline {
        *budget_exceeded = true;
        return;
    }

    let depth = chosen.len();
    let remaining = size - depth;
    if remaining == 0 {
        if (current_sum - target).abs() <= EPSILON {
            results.push(chosen.clone());
        }
        return;
    }

    let n = values.len();
    if start_idx + remaining > n {
        return;
    }

    let lower: Decimal = current_sum + values[start_idx..start_idx + remaining].iter().sum::<Decimal>();
    let upper: Decimal = current_sum + values[n - remaining..].iter().sum::<Decimal>();
    let eps_remaining = EPSILON * Decimal::from(remaining as i64);

    if upper < target - eps_remaining || lower > target + eps_remaining {
        return;
    }

    let last_pick = n - remaining;
    let window = &values[start_idx..=last_pick];
    let cap_offset = window.partition_point(|v| current_sum + *v <= target + eps_remaining);
    let cap = start_idx + cap_offset;

    for j in start_idx..cap {
        if *budget_exceeded {
            return;
        }
        chosen.push(j);
        dfs(
            values,
            target,
            size,
            j + 1,
            current_sum + values[j],
            chosen,
            results,
            deadline,
            max_iterations,
            iterations,
            budget_exceeded,
        );
        chosen.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(amount: i64) -> (Uuid, Decimal) {
        (Uuid::new_v4(), Decimal::new(amount, 2))
    }

    #[test]
    fn finds_size_three_combination_summing_to_target() {
        let candidates = vec![candidate(3000), candidate(4000), candidate(3000), candidate(9999)];
        let results = generate_combinations(
            &candidates,
            Decimal::new(10000, 2),
            5,
            1,
            SearchBudget::default(),
        );
        assert!(results.iter().any(|c| c.invoice_ids.len() == 3));
    }

    #[test]
    fn every_result_sums_within_epsilon() {
        let candidates: Vec<(Uuid, Decimal)> = (1..=12).map(|i| candidate(i * 1000)).collect();
        let results = generate_combinations(
            &candidates,
            Decimal::new(15000, 2),
            4,
            2,
            SearchBudget::default(),
        );
        for combo in &results {
            assert!((combo.sum - Decimal::new(15000, 2)).abs() <= EPSILON);
        }
    }

    #[test]
    fn no_duplicate_sorted_id_tuples() {
        let candidates = vec![candidate(5000), candidate(5000), candidate(5000), candidate(5000)];
        let results = generate_combinations(
            &candidates,
            Decimal::new(10000, 2),
            2,
            1,
            SearchBudget::default(),
        );
        let mut seen = HashSet::new();
        for combo in &results {
            let mut ids = combo.invoice_ids.clone();
            ids.sort();
            assert!(seen.insert(ids));
        }
    }

    #[test]
    fn respects_tight_wallclock_budget() {
        let candidates: Vec<(Uuid, Decimal)> = (1..=40).map(|i| candidate(i * 137)).collect();
        let budget = SearchBudget {
            max_wallclock: Duration::from_nanos(1),
            max_iterations_per_size: 200_000,
        };
        // Should return promptly without panicking even though the budget
        // is effectively zero.
        let _ = generate_combinations(&candidates, Decimal::new(100000, 2), 5, 2, budget);
    }
}
