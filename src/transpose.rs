//! The transpose handle: plan once, execute many times.
//!
//! `create_plan` validates the shape, fuses it, and selects the master
//! plan; the returned handle borrows both buffers and can be re-targeted
//! at new buffers of the same shape without re-planning. Scalars may be
//! swapped at any time; the next `execute` call re-selects the kernel
//! specialisation from them.

use crate::error::{Result, TransposeError};
use crate::execute::{run_plan, run_task};
use crate::micro_kernel::Element;
use crate::plan::Plan;
use crate::planner::{build_plan, SelectionMethod};
use crate::shape::{self, FusedShape};

/// A planned transpose `B = alpha * permute(A) + beta * B`.
///
/// Created by [`create_plan`]. Borrows A (read-only) and B (write) for
/// its lifetime, which also rules out overlapping buffers.
pub struct TransposePlan<'a, T: Element> {
    a: &'a [T],
    b: &'a mut [T],
    alpha: T,
    beta: T,
    num_threads: usize,
    method: SelectionMethod,
    strategy_override: Option<usize>,
    shape: FusedShape,
    plan: Plan,
    needed_a: usize,
    needed_b: usize,
}

/// Plan a transpose of the rank-d tensor `a` described by `size` (inner
/// extents, column-major: axis 0 contiguous) into `b`, whose axis j holds
/// A axis `perm[j]`.
///
/// `outer_size_a` / `outer_size_b` give the storage extents when the
/// transposed region is a sub-tensor of a larger allocation; `None` means
/// dense (`size`, resp. `size ∘ perm`). `num_threads = 0` asks for the
/// machine's available parallelism. The measuring selection methods
/// execute candidate plans against the real buffers, so `create_plan` may
/// block for the mode's time budget; when `beta != 0` measurement is
/// skipped (B's prior contents are live inputs) and the heuristic winner
/// is used.
#[allow(clippy::too_many_arguments)]
pub fn create_plan<'a, T: Element>(
    perm: &[usize],
    size: &[usize],
    alpha: T,
    a: &'a [T],
    outer_size_a: Option<&[usize]>,
    beta: T,
    b: &'a mut [T],
    outer_size_b: Option<&[usize]>,
    method: SelectionMethod,
    num_threads: usize,
) -> Result<TransposePlan<'a, T>> {
    let outer_a: Vec<usize> = match outer_size_a {
        Some(o) => o.to_vec(),
        None => size.to_vec(),
    };
    let outer_b: Vec<usize> = match outer_size_b {
        Some(o) => o.to_vec(),
        None => perm.iter().map(|&p| size.get(p).copied().unwrap_or(0)).collect(),
    };
    // A malformed perm would make the dense outer_b default nonsense;
    // verify_parameters re-checks everything on the real arrays.
    shape::verify_parameters(size, perm, &outer_a, &outer_b)?;

    let needed_a = shape::storage_len(&outer_a);
    let needed_b = shape::storage_len(&outer_b);
    if a.len() < needed_a {
        return Err(TransposeError::BufferTooSmall {
            needed: needed_a,
            got: a.len(),
        });
    }
    if b.len() < needed_b {
        return Err(TransposeError::BufferTooSmall {
            needed: needed_b,
            got: b.len(),
        });
    }

    let num_threads = if num_threads == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        num_threads
    };

    let fused = shape::normalize(size, perm, &outer_a, &outer_b);
    // Every offset the plan can derive stays below the validated storage
    // lengths (strides are prefix products of the outer extents and each
    // index is bounded by its inner extent).
    let plan = unsafe {
        build_plan::<T>(
            &fused,
            method,
            num_threads,
            None,
            alpha,
            beta,
            a.as_ptr(),
            b.as_mut_ptr(),
        )?
    };

    Ok(TransposePlan {
        a,
        b,
        alpha,
        beta,
        num_threads,
        method,
        strategy_override: None,
        shape: fused,
        plan,
        needed_a,
        needed_b,
    })
}

impl<'a, T: Element> TransposePlan<'a, T> {
    /// Run the transpose, inferring the streaming-store and beta = 0
    /// specialisations from the stored scalars.
    pub fn execute(&mut self) {
        if self.beta.is_zero() {
            if self.streaming_viable() {
                self.execute_expert::<true, true, true>();
            } else {
                self.execute_expert::<false, true, true>();
            }
        } else {
            self.execute_expert::<false, true, false>();
        }
    }

    /// Explicitly selected specialisation. `STREAM` asks for non-temporal
    /// stores and is honoured only when the plan's destination stride
    /// pattern and the buffer's alignment allow them; `SPAWN` controls
    /// whether workers are spawned (otherwise tasks run sequentially on
    /// the calling thread — see [`TransposePlan::execute_task`] for
    /// callers that drive their own worker set).
    pub fn execute_expert<const STREAM: bool, const SPAWN: bool, const BETA_ZERO: bool>(&mut self) {
        debug_assert!(
            BETA_ZERO == self.beta.is_zero(),
            "BETA_ZERO does not match the stored beta"
        );
        let stream = STREAM && self.streaming_viable();
        let a = self.a.as_ptr();
        let b = self.b.as_mut_ptr();
        // Buffers were validated against the plan's full footprint.
        unsafe {
            if stream {
                run_plan::<T, true, SPAWN, BETA_ZERO>(a, b, &self.plan, self.alpha, self.beta);
            } else {
                run_plan::<T, false, SPAWN, BETA_ZERO>(a, b, &self.plan, self.alpha, self.beta);
            }
        }
    }

    /// Run a single task of the plan on the calling thread. For callers
    /// that are already executing num-tasks-way parallel and dispatch the
    /// task ids themselves. This path never uses streaming stores.
    ///
    /// # Panics
    /// If `task_id >= self.num_tasks()`.
    pub fn execute_task(&mut self, task_id: usize) {
        let task = &self.plan.tasks[task_id];
        let a = self.a.as_ptr();
        let b = self.b.as_mut_ptr();
        unsafe {
            if self.beta.is_zero() {
                run_task::<T, false, true>(a, b, &self.plan, task, self.alpha, self.beta);
            } else {
                run_task::<T, false, false>(a, b, &self.plan, task, self.alpha, self.beta);
            }
        }
    }

    fn streaming_viable(&self) -> bool {
        T::HAS_STREAM_KERNEL
            && self.plan.stream_strides_ok
            && self.alpha.is_one()
            && (self.b.as_ptr() as usize) % 32 == 0
    }

    /// Replace the input buffer without re-planning.
    pub fn set_input(&mut self, a: &'a [T]) -> Result<()> {
        if a.len() < self.needed_a {
            return Err(TransposeError::BufferTooSmall {
                needed: self.needed_a,
                got: a.len(),
            });
        }
        self.a = a;
        Ok(())
    }

    /// Replace the output buffer without re-planning.
    pub fn set_output(&mut self, b: &'a mut [T]) -> Result<()> {
        if b.len() < self.needed_b {
            return Err(TransposeError::BufferTooSmall {
                needed: self.needed_b,
                got: b.len(),
            });
        }
        self.b = b;
        Ok(())
    }

    pub fn alpha(&self) -> T {
        self.alpha
    }

    pub fn beta(&self) -> T {
        self.beta
    }

    /// Replace alpha; the next `execute` re-selects the specialisation.
    pub fn set_alpha(&mut self, alpha: T) {
        self.alpha = alpha;
    }

    /// Replace beta; the next `execute` re-selects the specialisation.
    pub fn set_beta(&mut self, beta: T) {
        self.beta = beta;
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Change the thread budget and re-plan.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.num_threads = if num_threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            num_threads
        };
        self.replan()
    }

    /// Force the id-th enumerated parallelisation strategy and re-plan.
    /// An out-of-range id falls back to the planner's own choice.
    pub fn set_parallel_strategy(&mut self, id: usize) -> Result<()> {
        self.strategy_override = Some(id);
        self.replan()
    }

    fn replan(&mut self) -> Result<()> {
        let plan = unsafe {
            build_plan::<T>(
                &self.shape,
                self.method,
                self.num_threads,
                self.strategy_override,
                self.alpha,
                self.beta,
                self.a.as_ptr(),
                self.b.as_mut_ptr(),
            )?
        };
        self.plan = plan;
        Ok(())
    }

    /// Number of tasks the plan partitions the iteration space into.
    pub fn num_tasks(&self) -> usize {
        self.plan.num_tasks()
    }

    /// Selected loop nest, outermost to innermost, as fused-axis ids.
    pub fn loop_order(&self) -> &[usize] {
        &self.plan.full_order
    }

    /// Parallel factor per loop of [`TransposePlan::loop_order`].
    pub fn threads_at_loop(&self) -> &[usize] {
        &self.plan.threads_at_loop
    }

    /// Composite heuristic score of the selected plan (lower is better).
    pub fn heuristic_score(&self) -> f64 {
        self.plan.score
    }

    /// Diagnostic dump of the selected loop order and parallelisation.
    pub fn print(&self) {
        println!("loop order (outer to inner): {:?}", self.plan.full_order);
        println!("threads per loop:            {:?}", self.plan.threads_at_loop);
        println!(
            "tasks: {}   heuristic score: {:.3}",
            self.plan.num_tasks(),
            self.plan.score
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SelectionMethod::Estimate;

    #[test]
    fn test_create_plan_validates_buffers() {
        let a = vec![0.0f32; 10];
        let mut b = vec![0.0f32; 12];
        let err = create_plan(&[1, 0], &[4, 3], 1.0, &a, None, 0.0, &mut b, None, Estimate, 1);
        assert!(matches!(
            err,
            Err(TransposeError::BufferTooSmall { needed: 12, got: 10 })
        ));
    }

    #[test]
    fn test_create_plan_rejects_bad_perm() {
        let a = vec![0.0f32; 12];
        let mut b = vec![0.0f32; 12];
        let err = create_plan(&[0, 2], &[4, 3], 1.0, &a, None, 0.0, &mut b, None, Estimate, 1);
        assert!(matches!(err, Err(TransposeError::InvalidPermutation(2))));
    }

    #[test]
    fn test_execute_simple_2d() {
        let a: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let mut b = vec![0.0f32; 12];
        let mut plan =
            create_plan(&[1, 0], &[4, 3], 1.0, &a, None, 0.0, &mut b, None, Estimate, 1).unwrap();
        plan.execute();
        for i in 0..4 {
            for j in 0..3 {
                assert_eq!(b[j + i * 3], a[i + j * 4]);
            }
        }
    }

    #[test]
    fn test_retarget_output_without_replanning() {
        let a: Vec<f64> = (0..24).map(|x| x as f64).collect();
        let mut b1 = vec![0.0f64; 24];
        let mut b2 = vec![0.0f64; 24];
        {
            let mut plan =
                create_plan(&[1, 0], &[6, 4], 1.0, &a, None, 0.0, &mut b1, None, Estimate, 1)
                    .unwrap();
            plan.execute();
            plan.set_output(&mut b2).unwrap();
            plan.execute();
        }
        assert_eq!(b1, b2);
    }

    #[test]
    fn test_set_output_revalidates() {
        let a: Vec<f64> = vec![0.0; 24];
        let mut b = vec![0.0f64; 24];
        let mut small = vec![0.0f64; 5];
        let mut plan =
            create_plan(&[1, 0], &[6, 4], 1.0, &a, None, 0.0, &mut b, None, Estimate, 1).unwrap();
        assert!(plan.set_output(&mut small).is_err());
    }

    #[test]
    fn test_scalar_swap_changes_semantics() {
        let a = vec![1.0f64; 4];
        let mut b = vec![10.0f64; 4];
        let mut plan =
            create_plan(&[0, 1], &[2, 2], 1.0, &a, None, 0.0, &mut b, None, Estimate, 1).unwrap();
        plan.execute();

        // same plan, now as an update; b is all 1.0 after the first run
        plan.set_alpha(2.0);
        plan.set_beta(3.0);
        assert_eq!(plan.alpha(), 2.0);
        assert_eq!(plan.beta(), 3.0);
        plan.execute();
        // 2*1 + 3*1 = 5
        assert!(b.iter().all(|&x| x == 5.0));
    }

    #[test]
    fn test_set_num_threads_replans() {
        let a: Vec<f32> = (0..32 * 48).map(|x| x as f32).collect();
        let mut b = vec![0.0f32; 32 * 48];
        let mut plan =
            create_plan(&[1, 0], &[32, 48], 1.0, &a, None, 0.0, &mut b, None, Estimate, 1)
                .unwrap();
        assert_eq!(plan.num_tasks(), 1);
        plan.set_num_threads(2).unwrap();
        assert_eq!(plan.num_threads(), 2);
        assert!(plan.num_tasks() <= 2);
        plan.execute();
        for i in 0..32 {
            for j in 0..48 {
                assert_eq!(b[j + i * 48], a[i + j * 32]);
            }
        }
    }
}
