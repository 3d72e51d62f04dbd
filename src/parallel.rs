//! Parallel decomposition: distributing a thread count across loops.
//!
//! The thread budget T is factored into primes; each prime is assigned to
//! a loop that still has headroom, preferring the currently least-loaded
//! loop so the factors spread evenly. Backtracking over the top
//! alternatives enumerates several distinct strategies per budget.
//! Primes that fit nowhere are dropped, degrading to T_effective < T;
//! such candidates score a load-balance penalty instead of being
//! rejected.

use smallvec::SmallVec;
use std::collections::HashSet;

/// Prime factors of `t` in descending order (largest placed first, which
/// keeps the per-loop factors balanced).
pub(crate) fn prime_factors(mut t: usize) -> SmallVec<[usize; 16]> {
    let mut out: SmallVec<[usize; 16]> = SmallVec::new();
    let mut p = 2;
    while p * p <= t {
        while t % p == 0 {
            out.push(p);
            t /= p;
        }
        p += 1;
    }
    if t > 1 {
        out.push(t);
    }
    out.reverse();
    out
}

/// Fraction of the budget that ends up evenly distributed: the product
/// over parallelised loops of (mean chunk / max chunk), scaled by
/// T_effective / T when primes were dropped.
pub(crate) fn load_balance(n_at_axis: &[usize], avail: &[usize], t: usize) -> f32 {
    let mut balance = 1.0f32;
    let mut t_eff = 1usize;
    for (&n, &u) in n_at_axis.iter().zip(avail.iter()) {
        t_eff *= n;
        if n > 1 {
            let mean = u as f32 / n as f32;
            let max = u.div_ceil(n) as f32;
            balance *= mean / max;
        }
    }
    balance * (t_eff as f32 / t as f32)
}

/// How many alternative target loops each prime explores.
const BRANCH: usize = 2;

/// Progressive relaxation floors for the balance filter.
const BALANCE_FLOORS: [f32; 4] = [0.95, 0.8, 0.5, 0.0];

/// Enumerate parallelisation strategies for budget `t` over loops with
/// per-loop task capacities `avail` (entries of 1 mark loops that must
/// stay sequential). Strategies are deduplicated; at most `limit` are
/// returned, best balance first.
pub(crate) fn enumerate_strategies(t: usize, avail: &[usize], limit: usize) -> Vec<Vec<usize>> {
    if t <= 1 || avail.is_empty() {
        return vec![vec![1; avail.len()]];
    }

    let factors = prime_factors(t);
    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    let mut out: Vec<Vec<usize>> = Vec::new();

    for &floor in &BALANCE_FLOORS {
        let mut cur = vec![1usize; avail.len()];
        assign(&factors, 0, &mut cur, avail, t, floor, limit, &mut seen, &mut out);
        if out.len() >= limit {
            break;
        }
    }
    if out.is_empty() {
        // Nothing parallelisable at all.
        out.push(vec![1; avail.len()]);
    }
    out.sort_by(|a, b| {
        load_balance(b, avail, t)
            .partial_cmp(&load_balance(a, avail, t))
            .unwrap()
    });
    out.truncate(limit);
    out
}

#[allow(clippy::too_many_arguments)]
fn assign(
    factors: &[usize],
    idx: usize,
    cur: &mut Vec<usize>,
    avail: &[usize],
    t: usize,
    floor: f32,
    limit: usize,
    seen: &mut HashSet<Vec<usize>>,
    out: &mut Vec<Vec<usize>>,
) {
    if out.len() >= limit {
        return;
    }
    if idx == factors.len() {
        if load_balance(cur, avail, t) >= floor && seen.insert(cur.clone()) {
            out.push(cur.clone());
        }
        return;
    }

    let p = factors[idx];
    let mut cands: SmallVec<[usize; 8]> = (0..avail.len())
        .filter(|&k| cur[k] * p <= avail[k])
        .collect();
    if cands.is_empty() {
        // Prime does not fit anywhere: drop it (T_effective shrinks).
        assign(factors, idx + 1, cur, avail, t, floor, limit, seen, out);
        return;
    }
    // Least-loaded loop first; capacity breaks ties.
    cands.sort_by_key(|&k| (cur[k], usize::MAX - avail[k]));

    for &k in cands.iter().take(BRANCH) {
        cur[k] *= p;
        assign(factors, idx + 1, cur, avail, t, floor, limit, seen, out);
        cur[k] /= p;
    }
}
