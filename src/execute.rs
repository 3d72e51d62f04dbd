//! Execution engine: per-task flat odometer walk over the frame chain.
//!
//! Each task walks its compute-node chain with a flat odometer (no
//! recursion: the chain is short but deep recursion costs more than the
//! odometer when many small outer dimensions survive fusion) and invokes
//! the leaf at every position: a 2-D blocked transpose through the
//! macro-kernel, the strided scalar fallback, or the constant-stride-1
//! copy. Workers touch disjoint sub-rectangles of B, so the parallel
//! path needs no synchronisation beyond the fork-join itself.

use smallvec::SmallVec;

use crate::macro_kernel::{const_stride1_copy, macro_kernel, macro_kernel_strided};
use crate::micro_kernel::Element;
use crate::plan::{LeafKind, LeafRange, Plan, Task};

/// A raw pointer wrapper that is `Send` + `Sync`.
///
/// # Safety
/// The caller must guarantee the pointed-to data stays valid for the
/// parallel operation and that concurrent writers touch disjoint regions.
#[cfg(feature = "parallel")]
#[derive(Clone, Copy)]
pub(crate) struct SendPtr<T>(pub(crate) *mut T);

#[cfg(feature = "parallel")]
unsafe impl<T> Send for SendPtr<T> {}
#[cfg(feature = "parallel")]
unsafe impl<T> Sync for SendPtr<T> {}

/// Odometer state over one task's frames.
struct Walk {
    lens: SmallVec<[usize; 8]>,
    lda: SmallVec<[isize; 8]>,
    ldb: SmallVec<[isize; 8]>,
    total: usize,
    src_off: isize,
    dst_off: isize,
}

impl Walk {
    fn new(task: &Task) -> Self {
        let mut lens: SmallVec<[usize; 8]> = SmallVec::new();
        let mut lda: SmallVec<[isize; 8]> = SmallVec::new();
        let mut ldb: SmallVec<[isize; 8]> = SmallVec::new();
        let mut src_off = 0isize;
        let mut dst_off = 0isize;
        // Chains are stored outermost-first; the odometer wants the
        // fastest-moving index first, so reverse.
        for node in task.nodes.iter().rev() {
            let len = node.end.saturating_sub(node.start).div_ceil(node.inc);
            lens.push(len);
            lda.push(node.lda * node.inc as isize);
            ldb.push(node.ldb * node.inc as isize);
            src_off += node.start as isize * node.lda;
            dst_off += node.start as isize * node.ldb;
        }
        let total = if lens.iter().any(|&l| l == 0) {
            0
        } else {
            lens.iter().product::<usize>().max(1)
        };
        Walk {
            lens,
            lda,
            ldb,
            total,
            src_off,
            dst_off,
        }
    }

    /// Advance to the next chain position; returns false when exhausted.
    #[inline]
    fn step(&mut self, idx: &mut [usize]) -> bool {
        for d in 0..self.lens.len() {
            idx[d] += 1;
            if idx[d] < self.lens[d] {
                self.src_off += self.lda[d];
                self.dst_off += self.ldb[d];
                return true;
            }
            self.src_off -= self.lda[d] * (self.lens[d] as isize - 1);
            self.dst_off -= self.ldb[d] * (self.lens[d] as isize - 1);
            idx[d] = 0;
        }
        false
    }
}

/// Run the leaf for the current chain position.
///
/// # Safety
/// `src`/`dst` must be valid for the task's full footprint.
#[inline]
unsafe fn run_leaf<T: Element, const STREAM: bool, const BETA_ZERO: bool>(
    src: *const T,
    dst: *mut T,
    kind: &LeafKind,
    leaf: &LeafRange,
    block: usize,
    alpha: T,
    beta: T,
) {
    match (*kind, *leaf) {
        (
            LeafKind::Tile {
                sa,
                sb,
                lda_inner,
                ldb_inner,
                unit,
                ..
            },
            LeafRange::Tile {
                a_start,
                a_end,
                b_start,
                b_end,
            },
        ) => {
            let mut ib = b_start;
            while ib < b_end {
                let bb = block.min(b_end - ib);
                let mut ia = a_start;
                while ia < a_end {
                    let ba = block.min(a_end - ia);
                    if unit {
                        macro_kernel::<T, STREAM, BETA_ZERO>(
                            src.offset(ia as isize + ib as isize * lda_inner),
                            lda_inner,
                            ba,
                            dst.offset(ib as isize + ia as isize * ldb_inner),
                            ldb_inner,
                            bb,
                            alpha,
                            beta,
                        );
                    } else {
                        macro_kernel_strided::<T, BETA_ZERO>(
                            src.offset(ia as isize * sa + ib as isize * lda_inner),
                            sa,
                            lda_inner,
                            ba,
                            dst.offset(ib as isize * sb + ia as isize * ldb_inner),
                            sb,
                            ldb_inner,
                            bb,
                            alpha,
                            beta,
                        );
                    }
                    ia += block;
                }
                ib += block;
            }
        }
        (
            LeafKind::Copy {
                s_stride, d_stride, ..
            },
            LeafRange::Copy { start, end },
        ) => {
            if start < end {
                const_stride1_copy::<T, BETA_ZERO>(
                    src.offset(start as isize * s_stride),
                    s_stride,
                    dst.offset(start as isize * d_stride),
                    d_stride,
                    end - start,
                    alpha,
                    beta,
                );
            }
        }
        // Plans never mix leaf kinds across tasks.
        _ => unreachable!("leaf range does not match plan kind"),
    }
}

/// Execute one task of the plan.
///
/// # Safety
/// - `src`/`dst` must be valid for every offset the plan derives from the
///   validated shape
/// - no other thread may write the same region of `dst`
pub(crate) unsafe fn run_task<T: Element, const STREAM: bool, const BETA_ZERO: bool>(
    src: *const T,
    dst: *mut T,
    plan: &Plan,
    task: &Task,
    alpha: T,
    beta: T,
) {
    let mut walk = Walk::new(task);
    if walk.total == 0 {
        return;
    }
    let mut idx: SmallVec<[usize; 8]> = SmallVec::from_elem(0, walk.lens.len());
    loop {
        run_leaf::<T, STREAM, BETA_ZERO>(
            src.offset(walk.src_off),
            dst.offset(walk.dst_off),
            &plan.kind,
            &task.leaf,
            plan.block,
            alpha,
            beta,
        );
        if !walk.step(&mut idx) {
            break;
        }
    }
    if STREAM {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
        crate::micro_kernel::avx::store_fence();
    }
}

/// Execute every task of the plan, spawning workers when asked to.
///
/// # Safety
/// As [`run_task`], for all tasks.
pub(crate) unsafe fn run_plan<T: Element, const STREAM: bool, const SPAWN: bool, const BETA_ZERO: bool>(
    src: *const T,
    dst: *mut T,
    plan: &Plan,
    alpha: T,
    beta: T,
) {
    #[cfg(feature = "parallel")]
    if SPAWN && plan.num_tasks() > 1 {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
        let s = SendPtr(src as *mut T);
        let d = SendPtr(dst);
        plan.tasks.par_iter().for_each(|task| {
            // Tasks cover disjoint sub-rectangles of B (plan invariant).
            let s = &s;
            let d = &d;
            unsafe {
                run_task::<T, STREAM, BETA_ZERO>(s.0 as *const T, d.0, plan, task, alpha, beta);
            }
        });
        return;
    }
    for task in &plan.tasks {
        run_task::<T, STREAM, BETA_ZERO>(src, dst, plan, task, alpha, beta);
    }
}

// ---------------------------------------------------------------------------
// Measurement support
// ---------------------------------------------------------------------------

/// Number of leaf work units (macro tiles, or copy runs) a task performs.
pub(crate) fn task_units(plan: &Plan, task: &Task) -> usize {
    let chain: usize = task
        .nodes
        .iter()
        .map(|n| n.end.saturating_sub(n.start).div_ceil(n.inc.max(1)))
        .product();
    let per_leaf = match task.leaf {
        LeafRange::Tile {
            a_start,
            a_end,
            b_start,
            b_end,
        } => {
            (a_end.saturating_sub(a_start)).div_ceil(plan.block).max(1)
                * (b_end.saturating_sub(b_start)).div_ceil(plan.block).max(1)
        }
        LeafRange::Copy { start, end } => usize::from(end > start),
    };
    chain * per_leaf
}

/// Truncated execution for the planner's measurement phase: walk the task
/// like [`run_task`] but stop after `budget` leaf units. Sequential and
/// never streaming; only used when beta = 0.
///
/// # Safety
/// As [`run_task`].
pub(crate) unsafe fn run_task_capped<T: Element>(
    src: *const T,
    dst: *mut T,
    plan: &Plan,
    task: &Task,
    alpha: T,
    budget: &mut usize,
) {
    let mut walk = Walk::new(task);
    if walk.total == 0 || *budget == 0 {
        return;
    }
    let mut idx: SmallVec<[usize; 8]> = SmallVec::from_elem(0, walk.lens.len());
    loop {
        let s = src.offset(walk.src_off);
        let d = dst.offset(walk.dst_off);
        match (plan.kind, task.leaf) {
            (
                LeafKind::Tile {
                    sa,
                    sb,
                    lda_inner,
                    ldb_inner,
                    unit,
                    ..
                },
                LeafRange::Tile {
                    a_start,
                    a_end,
                    b_start,
                    b_end,
                },
            ) => {
                let mut ib = b_start;
                'tiles: while ib < b_end {
                    let bb = plan.block.min(b_end - ib);
                    let mut ia = a_start;
                    while ia < a_end {
                        let ba = plan.block.min(a_end - ia);
                        if unit {
                            macro_kernel::<T, false, true>(
                                s.offset(ia as isize + ib as isize * lda_inner),
                                lda_inner,
                                ba,
                                d.offset(ib as isize + ia as isize * ldb_inner),
                                ldb_inner,
                                bb,
                                alpha,
                                T::zero(),
                            );
                        } else {
                            macro_kernel_strided::<T, true>(
                                s.offset(ia as isize * sa + ib as isize * lda_inner),
                                sa,
                                lda_inner,
                                ba,
                                d.offset(ib as isize * sb + ia as isize * ldb_inner),
                                sb,
                                ldb_inner,
                                bb,
                                alpha,
                                T::zero(),
                            );
                        }
                        *budget -= 1;
                        if *budget == 0 {
                            break 'tiles;
                        }
                        ia += plan.block;
                    }
                    ib += plan.block;
                }
            }
            (
                LeafKind::Copy {
                    s_stride, d_stride, ..
                },
                LeafRange::Copy { start, end },
            ) => {
                if start < end {
                    const_stride1_copy::<T, true>(
                        s.offset(start as isize * s_stride),
                        s_stride,
                        d.offset(start as isize * d_stride),
                        d_stride,
                        end - start,
                        alpha,
                        T::zero(),
                    );
                    *budget -= 1;
                }
            }
            _ => unreachable!("leaf range does not match plan kind"),
        }
        if *budget == 0 || !walk.step(&mut idx) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{materialize, LeafKind};
    use crate::shape::normalize;

    fn dense_shape(size: &[usize], perm: &[usize]) -> crate::shape::FusedShape {
        let outer_b: Vec<usize> = perm.iter().map(|&p| size[p]).collect();
        normalize(size, perm, size, &outer_b)
    }

    fn tile_plan(size: &[usize], perm: &[usize], block: usize) -> Plan {
        let shape = dense_shape(size, perm);
        let axis_a = 0;
        let axis_b = shape.perm[0];
        let kind = LeafKind::Tile {
            axis_a,
            axis_b,
            sa: shape.lda[axis_a],
            sb: shape.ldb[axis_b],
            lda_inner: shape.lda[axis_b],
            ldb_inner: shape.ldb[axis_a],
            unit: shape.lda[axis_a] == 1 && shape.ldb[axis_b] == 1,
        };
        let chain: Vec<usize> = (0..shape.rank())
            .filter(|&k| k != axis_a && k != axis_b)
            .collect();
        let n = vec![1usize; shape.rank()];
        materialize(&shape, kind, &chain, &n, block, 0.0, std::mem::size_of::<f64>())
    }

    #[test]
    fn test_run_plan_2d_transpose() {
        // 5x3, perm (1,0): B[j,i] = A[i,j]
        let a: Vec<f64> = (0..15).map(|x| x as f64).collect();
        let mut b = vec![0.0f64; 15];
        let plan = tile_plan(&[5, 3], &[1, 0], 16);
        unsafe {
            run_plan::<f64, false, false, true>(a.as_ptr(), b.as_mut_ptr(), &plan, 1.0, 0.0);
        }
        for i in 0..5 {
            for j in 0..3 {
                assert_eq!(b[j + i * 3], a[i + j * 5], "mismatch at i={i}, j={j}");
            }
        }
    }

    #[test]
    fn test_run_plan_3d_with_chain() {
        // (4,3,5) perm (2,0,1): fuses axes 0,1 -> 2-D (12,5) transpose
        // with no chain; use perm (1,0,2) halo-free instead to force a
        // chain: B axes (1,0,2).
        let size = [4usize, 3, 5];
        let total = 60usize;
        let a: Vec<f64> = (0..total).map(|x| x as f64).collect();
        let mut b = vec![0.0f64; total];
        let plan = tile_plan(&size, &[1, 0, 2], 16);
        assert!(plan.tasks[0].nodes.len() == 1, "axis 2 should be a chain loop");
        unsafe {
            run_plan::<f64, false, false, true>(a.as_ptr(), b.as_mut_ptr(), &plan, 1.0, 0.0);
        }
        // B[j0,j1,j2] with (j0,j1,j2) = (i1,i0,i2)
        for i0 in 0..4 {
            for i1 in 0..3 {
                for i2 in 0..5 {
                    let a_idx = i0 + i1 * 4 + i2 * 12;
                    let b_idx = i1 + i0 * 3 + i2 * 12;
                    assert_eq!(b[b_idx], a[a_idx]);
                }
            }
        }
    }

    #[test]
    fn test_task_units_counts_tiles() {
        let plan = tile_plan(&[40, 3, 40], &[2, 1, 0], 16);
        let units: usize = plan.tasks.iter().map(|t| task_units(&plan, t)).sum();
        // ceil(40/16)^2 tiles per chain step, 3 chain steps
        assert_eq!(units, 3 * 3 * 3);
    }

    #[test]
    fn test_run_task_capped_respects_budget() {
        let a: Vec<f64> = (0..40 * 3 * 40).map(|x| x as f64).collect();
        let mut b = vec![0.0f64; 40 * 3 * 40];
        let plan = tile_plan(&[40, 3, 40], &[2, 1, 0], 16);
        let mut budget = 5usize;
        unsafe {
            run_task_capped(a.as_ptr(), b.as_mut_ptr(), &plan, &plan.tasks[0], 1.0, &mut budget);
        }
        assert_eq!(budget, 0);
        // A later chunk of B is untouched.
        assert_eq!(b[40 * 3 * 40 - 1], 0.0);
    }
}
