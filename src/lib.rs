//! Plan-based high-performance out-of-place tensor transposition.
//!
//! Computes `B = alpha * permute(A) + beta * B` for dense column-major
//! tensors of `f32`, `f64`, `Complex<f32>` and `Complex<f64>`, using the
//! techniques of HPTT (High-Performance Tensor Transpose):
//!
//! 1. Bilateral index fusion (merge axes contiguous in both A and B)
//! 2. An in-register W×W micro-kernel transpose (AVX / NEON / scalar)
//! 3. A macro-kernel tiling BLOCK × BLOCK planes, with streaming-store
//!    and beta = 0 specialisations
//! 4. Per-task compute-node chains over the residual outer loop nest
//! 5. A planner that scores loop orders and prime-factor thread
//!    decompositions, optionally ranking candidates by measured time
//!
//! Planning is separate from execution: a plan is created once and can be
//! executed any number of times, including against re-targeted buffers of
//! the same shape.
//!
//! ```
//! use strided_transpose::{create_plan, SelectionMethod};
//!
//! // A is 4 x 3 column-major; B holds the 3 x 4 transpose.
//! let a: Vec<f32> = (0..12).map(|x| x as f32).collect();
//! let mut b = vec![0.0f32; 12];
//! let mut plan = create_plan(
//!     &[1, 0], &[4, 3],
//!     1.0, &a, None,
//!     0.0, &mut b, None,
//!     SelectionMethod::Estimate, 1,
//! ).unwrap();
//! plan.execute();
//! assert_eq!(b[0 + 2 * 3], a[2 + 0 * 4]); // B[0,2] == A[2,0]
//! ```

mod error;
mod execute;
mod macro_kernel;
mod micro_kernel;
mod plan;
mod planner;
mod parallel;
mod shape;
mod transpose;

pub use error::{Result, TransposeError};
pub use micro_kernel::{Element, REGISTER_BITS};
pub use num_complex::{Complex32, Complex64};
pub use planner::{SelectionMethod, PATIENT_SCORE_FACTOR};
pub use transpose::{create_plan, TransposePlan};

/// Planner trace output to stderr. Compile-time only; keep off in
/// production builds.
pub(crate) const VERBOSE: bool = false;
