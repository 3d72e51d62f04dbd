//! Plan selection: loop orders, cost heuristics, and measurement.
//!
//! Candidates are (loop order, parallel decomposition) pairs over the
//! fused shape. Orders permute the chain axes (the two kernel axes are
//! consumed by the leaf and always innermost); decompositions come from
//! the prime-factor assignment in [`crate::parallel`]. Every candidate
//! gets a composite heuristic score; the measuring modes then execute the
//! most promising candidates for a bounded number of leaf units and keep
//! the fastest extrapolated wall time.
//!
//! Mode table:
//!
//! | Mode     | Orders retained         | Candidates timed | Budget  |
//! |----------|-------------------------|------------------|---------|
//! | Estimate | top 4 by loop cost      | 0                | —       |
//! | Measure  | top 24                  | 10               | ~25 ms  |
//! | Patient  | all within 1.5× of best | 100              | ~250 ms |
//! | Crazy    | all                     | all viable       | none    |

use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::error::{Result, TransposeError};
use crate::execute::{run_task_capped, task_units};
use crate::micro_kernel::Element;
use crate::parallel::{enumerate_strategies, load_balance};
use crate::plan::{materialize, LeafKind, Plan};
use crate::shape::FusedShape;
use crate::VERBOSE;

/// Plan-selection mode: how much effort `create_plan` spends searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    /// Heuristics only; nothing is timed.
    Estimate,
    /// Time a handful of the best-scored candidates.
    Measure,
    /// Time up to a hundred candidates within the retention factor.
    Patient,
    /// Time every viable candidate, with no time budget.
    Crazy,
}

/// Inner-loop weight decay of the loop-cost heuristic (inner loops count
/// for more, so the weight shrinks walking outward).
const LOOP_WEIGHT_DECAY: f64 = 0.5;
/// Composite score weights.
const W_LOOP: f64 = 1.0;
const W_PAR: f64 = 1.0;

const ESTIMATE_ORDERS: usize = 4;
const MEASURE_ORDERS: usize = 24;
/// Patient keeps every candidate whose composite score is within this
/// factor of the best score; the selected plan is guaranteed to be within
/// the same factor.
pub const PATIENT_SCORE_FACTOR: f64 = 1.5;

const MEASURE_TIMED: usize = 10;
const PATIENT_TIMED: usize = 100;
const MEASURE_BUDGET: Duration = Duration::from_millis(25);
const PATIENT_BUDGET: Duration = Duration::from_millis(250);

/// Per-candidate measurement: leaf units executed per run, runs per
/// candidate (minimum taken, then scaled by total/executed units).
const ESTIMATE_LEAF_CAP: usize = 256;
const ESTIMATE_RUNS: usize = 3;

/// Full order enumeration is bounded; beyond this many chain axes only
/// the greedy stride-sorted order is used.
const MAX_ENUM_AXES: usize = 7;

/// Parallel strategies enumerated per planning call.
const STRATEGY_LIMIT: usize = 16;

/// Below this many elements the fork-join overhead outweighs any split;
/// the plan stays single-task regardless of the requested budget.
const MIN_PARALLEL_ELEMS: usize = 2048;

/// Tile size of the shared-stride-1 fast path. The reference design only
/// supports 1; anything else is rejected rather than guessed at.
pub(crate) const BLOCKING_CONST_STRIDE1: usize = 1;

pub(crate) fn validate_const_stride1_blocking(blocking: usize) -> Result<()> {
    if blocking != 1 {
        return Err(TransposeError::UnsupportedConfiguration(blocking));
    }
    Ok(())
}

/// Decide what the innermost position of the nest does.
///
/// `axis_a` is the source axis with the smallest stride; `axis_b` is the
/// axis the fused permutation puts first in B, i.e. the
/// destination-contiguous one. When perm(0) = 0 they coincide and the
/// plan degenerates to linear copy/scale runs.
pub(crate) fn kernel_kind(shape: &FusedShape) -> Result<LeafKind> {
    let axis_a = min_stride_axis(&shape.lda);
    let axis_b = shape.perm[0];
    if axis_a == axis_b {
        validate_const_stride1_blocking(BLOCKING_CONST_STRIDE1)?;
        Ok(LeafKind::Copy {
            axis: axis_a,
            s_stride: shape.lda[axis_a],
            d_stride: shape.ldb[axis_a],
        })
    } else {
        Ok(LeafKind::Tile {
            axis_a,
            axis_b,
            sa: shape.lda[axis_a],
            sb: shape.ldb[axis_b],
            lda_inner: shape.lda[axis_b],
            ldb_inner: shape.ldb[axis_a],
            unit: shape.lda[axis_a] == 1 && shape.ldb[axis_b] == 1,
        })
    }
}

fn min_stride_axis(strides: &[isize]) -> usize {
    strides
        .iter()
        .enumerate()
        .min_by_key(|(_, s)| s.unsigned_abs())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Loop axes surrounding the leaf, in ascending axis order (the neutral
/// starting order before enumeration).
pub(crate) fn chain_axes(shape: &FusedShape, kind: &LeafKind) -> Vec<usize> {
    let consumed: SmallVec<[usize; 2]> = match *kind {
        LeafKind::Tile { axis_a, axis_b, .. } => SmallVec::from_slice(&[axis_a, axis_b]),
        LeafKind::Copy { axis, .. } => SmallVec::from_slice(&[axis]),
    };
    (0..shape.rank()).filter(|k| !consumed.contains(k)).collect()
}

/// Task capacity per fused axis: how many workers the axis can feed.
/// Kernel-plane axes hand out whole macro tiles; the copy axis stays
/// sequential (its chunks would split the contiguous runs the path
/// exists for).
pub(crate) fn availability(shape: &FusedShape, kind: &LeafKind, block: usize) -> Vec<usize> {
    let mut avail: Vec<usize> = shape.size.iter().copied().collect();
    match *kind {
        LeafKind::Tile { axis_a, axis_b, .. } => {
            avail[axis_a] = shape.size[axis_a].div_ceil(block);
            avail[axis_b] = shape.size[axis_b].div_ceil(block);
        }
        LeafKind::Copy { axis, .. } => {
            avail[axis] = 1;
        }
    }
    avail
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

fn stride_penalty(s: isize) -> f64 {
    let a = s.unsigned_abs();
    if a <= 1 {
        0.0
    } else {
        (a as f64).log2()
    }
}

/// Σ_k f(L_k) · w^k over the full nest (innermost first, w < 1 walking
/// outward). f penalises non-unit strides on both sides, destination
/// twice as hard: scattered writes hurt more than scattered reads.
pub(crate) fn loop_cost(shape: &FusedShape, kind: &LeafKind, chain_order: &[usize]) -> f64 {
    let mut full: SmallVec<[usize; 8]> = SmallVec::from_slice(chain_order);
    match *kind {
        LeafKind::Tile { axis_a, axis_b, .. } => {
            full.push(axis_b);
            full.push(axis_a);
        }
        LeafKind::Copy { axis, .. } => full.push(axis),
    }
    let mut weight = 1.0;
    let mut cost = 0.0;
    for &axis in full.iter().rev() {
        cost += weight * (stride_penalty(shape.lda[axis]) + 2.0 * stride_penalty(shape.ldb[axis]));
        weight *= LOOP_WEIGHT_DECAY;
    }
    cost
}

/// Penalises load imbalance, parallelising short loops, and splitting the
/// destination-contiguous axis (whose chunk seams break the streaming
/// write pattern).
pub(crate) fn parallel_cost(
    kind: &LeafKind,
    n_at_axis: &[usize],
    avail: &[usize],
    t: usize,
) -> f64 {
    let balance = load_balance(n_at_axis, avail, t) as f64;
    let mut cost = 1.0 / balance.max(1e-3) - 1.0;
    for (&n, &u) in n_at_axis.iter().zip(avail.iter()) {
        if n > 1 && u / n < 2 {
            cost += 0.5;
        }
    }
    if let LeafKind::Tile { axis_b, .. } = *kind {
        if n_at_axis[axis_b] > 1 {
            cost += 0.25;
        }
    }
    cost
}

// ---------------------------------------------------------------------------
// Order enumeration
// ---------------------------------------------------------------------------

/// All permutations of `items` (Heap's algorithm), or just the greedy
/// stride-sorted order beyond `MAX_ENUM_AXES`.
fn enumerate_orders(shape: &FusedShape, items: &[usize]) -> Vec<Vec<usize>> {
    if items.len() > MAX_ENUM_AXES {
        let mut order = items.to_vec();
        // Largest combined stride outermost.
        order.sort_by(|&x, &y| {
            let cx = shape.lda[x].unsigned_abs() + shape.ldb[x].unsigned_abs();
            let cy = shape.lda[y].unsigned_abs() + shape.ldb[y].unsigned_abs();
            cy.cmp(&cx)
        });
        return vec![order];
    }
    let mut out = Vec::new();
    let mut v = items.to_vec();
    if v.is_empty() {
        out.push(v);
        return out;
    }
    let n = v.len();
    heap_permute(n, &mut v, &mut out);
    out
}

fn heap_permute(k: usize, v: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    if k <= 1 {
        out.push(v.clone());
        return;
    }
    for i in 0..k {
        heap_permute(k - 1, v, out);
        if k % 2 == 0 {
            v.swap(i, k - 1);
        } else {
            v.swap(0, k - 1);
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate selection
// ---------------------------------------------------------------------------

struct Candidate {
    order: Vec<usize>,
    n_at_axis: Vec<usize>,
    score: f64,
}

/// Build and select the master plan.
///
/// # Safety
/// `a`/`b` must be valid for the full storage footprint of the validated
/// shape; the measuring modes execute candidate plans against them (only
/// when beta = 0, so scribbling on B is harmless).
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn build_plan<T: Element>(
    shape: &FusedShape,
    method: SelectionMethod,
    num_threads: usize,
    strategy_override: Option<usize>,
    alpha: T,
    beta: T,
    a: *const T,
    b: *mut T,
) -> Result<Plan> {
    let kind = kernel_kind(shape)?;
    let block = T::BLOCK;
    let elem_size = std::mem::size_of::<T>();
    let chain = chain_axes(shape, &kind);
    let avail = availability(shape, &kind, block);
    let t = if shape.total < MIN_PARALLEL_ELEMS {
        1
    } else {
        num_threads.max(1)
    };

    let mut orders = enumerate_orders(shape, &chain);
    orders.sort_by(|x, y| {
        loop_cost(shape, &kind, x)
            .partial_cmp(&loop_cost(shape, &kind, y))
            .unwrap()
    });
    let retained = match method {
        SelectionMethod::Estimate => ESTIMATE_ORDERS,
        SelectionMethod::Measure => MEASURE_ORDERS,
        SelectionMethod::Patient | SelectionMethod::Crazy => usize::MAX,
    };
    orders.truncate(retained.min(orders.len()).max(1));
    if method == SelectionMethod::Patient && orders.len() > 1 {
        let best = loop_cost(shape, &kind, &orders[0]);
        orders.retain(|o| loop_cost(shape, &kind, o) <= best * PATIENT_SCORE_FACTOR + 1e-9);
    }

    let strategies = enumerate_strategies(t, &avail, STRATEGY_LIMIT);
    let strategies: Vec<Vec<usize>> = match strategy_override {
        Some(id) if id < strategies.len() => vec![strategies[id].clone()],
        // Out-of-range override falls back to the planner's own choice.
        _ => strategies,
    };

    let mut candidates: Vec<Candidate> = Vec::with_capacity(orders.len() * strategies.len());
    for order in &orders {
        let lc = loop_cost(shape, &kind, order);
        for n in &strategies {
            let score = W_LOOP * lc + W_PAR * parallel_cost(&kind, n, &avail, t);
            candidates.push(Candidate {
                order: order.clone(),
                n_at_axis: n.clone(),
                score,
            });
        }
    }
    candidates.sort_by(|x, y| x.score.partial_cmp(&y.score).unwrap());
    let best_score = candidates[0].score;

    let timed = match method {
        SelectionMethod::Estimate => 0,
        SelectionMethod::Measure => MEASURE_TIMED,
        SelectionMethod::Patient => PATIENT_TIMED,
        SelectionMethod::Crazy => candidates.len(),
    };
    if method == SelectionMethod::Patient {
        candidates.retain(|c| c.score <= best_score * PATIENT_SCORE_FACTOR + 1e-9);
    }

    if timed == 0 || strategy_override.is_some() {
        let best = &candidates[0];
        return Ok(materialize(
            shape, kind, &best.order, &best.n_at_axis, block, best.score, elem_size,
        ));
    }

    match select_by_measurement(
        shape, kind, &candidates, timed, method, alpha, beta, a, b, block, elem_size,
    ) {
        Ok(plan) => Ok(plan),
        Err(TransposeError::MeasurementFailure) => {
            // Local recovery: keep the heuristic winner.
            if VERBOSE {
                eprintln!("[planner] measurement failed; keeping heuristic winner");
            }
            let best = &candidates[0];
            Ok(materialize(
                shape, kind, &best.order, &best.n_at_axis, block, best.score, elem_size,
            ))
        }
        Err(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn select_by_measurement<T: Element>(
    shape: &FusedShape,
    kind: LeafKind,
    candidates: &[Candidate],
    timed: usize,
    method: SelectionMethod,
    alpha: T,
    beta: T,
    a: *const T,
    b: *mut T,
    block: usize,
    elem_size: usize,
) -> Result<Plan> {
    // A timing run executes the candidate with beta = 0; if the caller's
    // beta is non-zero, B's prior contents are inputs and must not be
    // scribbled on. Fall back to the heuristic winner.
    if !beta.is_zero() {
        return Err(TransposeError::MeasurementFailure);
    }
    let budget = match method {
        SelectionMethod::Measure => Some(MEASURE_BUDGET),
        SelectionMethod::Patient => Some(PATIENT_BUDGET),
        _ => None,
    };

    let phase_start = Instant::now();
    let mut best: Option<(f64, Plan)> = None;
    for cand in candidates.iter().take(timed) {
        if let Some(limit) = budget {
            if phase_start.elapsed() > limit && best.is_some() {
                // Budget exhausted: abandon the rest, keep the best so far.
                break;
            }
        }
        let plan = materialize(
            shape, kind, &cand.order, &cand.n_at_axis, block, cand.score, elem_size,
        );
        if let Some(est) = time_plan(a, b, &plan, alpha) {
            if VERBOSE {
                eprintln!(
                    "[planner] order {:?} threads {:?} score {:.3} est {:.3e}s",
                    cand.order, cand.n_at_axis, cand.score, est
                );
            }
            if best.as_ref().map_or(true, |(t0, _)| est < *t0) {
                best = Some((est, plan));
            }
        }
    }
    best.map(|(_, plan)| plan)
        .ok_or(TransposeError::MeasurementFailure)
}

/// Estimate a plan's wall time: execute up to `ESTIMATE_LEAF_CAP` leaf
/// units (split across tasks), take the minimum of `ESTIMATE_RUNS` runs,
/// and scale by the ratio of total to executed units.
///
/// # Safety
/// As [`build_plan`].
unsafe fn time_plan<T: Element>(a: *const T, b: *mut T, plan: &Plan, alpha: T) -> Option<f64> {
    let total: usize = plan.tasks.iter().map(|t| task_units(plan, t)).sum();
    if total == 0 {
        return None;
    }
    let cap = (ESTIMATE_LEAF_CAP / plan.num_tasks().max(1)).max(1);
    let executed: usize = plan
        .tasks
        .iter()
        .map(|t| task_units(plan, t).min(cap))
        .sum();
    if executed == 0 {
        return None;
    }

    let mut best = f64::INFINITY;
    for _ in 0..ESTIMATE_RUNS {
        let t0 = Instant::now();
        for task in &plan.tasks {
            let mut left = cap;
            run_task_capped(a, b, plan, task, alpha, &mut left);
        }
        best = best.min(t0.elapsed().as_secs_f64());
    }
    Some(best * total as f64 / executed as f64)
}
