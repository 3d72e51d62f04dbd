//! Materialised execution plans: per-task compute-node chains.
//!
//! A plan is a loop order over the fused axes plus a per-loop thread
//! count. Materialisation slices every parallelised loop into balanced
//! chunks and emits one task per combination of chunks. Each task owns a
//! chain of loop frames; the chain is arena-owned (a contiguous
//! small-vector, child = next index) so plan construction does not churn
//! the heap and the hot per-task walk stays cache-friendly.

use smallvec::SmallVec;

use crate::shape::FusedShape;

/// One loop frame. The walk is: for `o` in `start, start+inc, .. < end`,
/// advance the A pointer by `o*lda` and the B pointer by `o*ldb`, then
/// recurse into the next frame; past the last frame the leaf runs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ComputeNode {
    pub start: usize,
    pub end: usize,
    pub inc: usize,
    pub lda: isize,
    pub ldb: isize,
}

/// Per-task bounds of the kernel plane (or copy run) at the chain leaf.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LeafRange {
    /// Sub-rectangle of the 2-D kernel plane, in elements; chunk
    /// boundaries are multiples of the macro-tile side.
    Tile {
        a_start: usize,
        a_end: usize,
        b_start: usize,
        b_end: usize,
    },
    /// Slice of the shared stride-1 axis.
    Copy { start: usize, end: usize },
}

/// A worker's share of the iteration space.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub nodes: SmallVec<[ComputeNode; 8]>,
    pub leaf: LeafRange,
}

/// What the innermost position of the nest does, fixed per plan.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LeafKind {
    /// 2-D blocked transpose over the source-contiguous axis `axis_a` and
    /// the destination-contiguous axis `axis_b`. `sa`/`sb` are the
    /// in-plane strides (1 in the common dense case), `lda_inner` is the
    /// A stride along `axis_b` and `ldb_inner` the B stride along
    /// `axis_a`.
    Tile {
        axis_a: usize,
        axis_b: usize,
        sa: isize,
        sb: isize,
        lda_inner: isize,
        ldb_inner: isize,
        /// Both in-plane strides are 1: the vector kernels apply.
        unit: bool,
    },
    /// Source and destination share their smallest-stride axis: linear
    /// copy/scale runs, no in-register transpose.
    Copy {
        axis: usize,
        s_stride: isize,
        d_stride: isize,
    },
}

/// A materialised plan. Owned by the transpose handle and read-only
/// during execution.
#[derive(Debug)]
pub(crate) struct Plan {
    /// Full loop nest, outermost to innermost, as fused A-axis ids (the
    /// kernel axes are the innermost entries).
    pub full_order: Vec<usize>,
    /// Parallel factor per position of `full_order`.
    pub threads_at_loop: Vec<usize>,
    pub kind: LeafKind,
    pub tasks: Vec<Task>,
    /// Composite heuristic score of the selected candidate.
    pub score: f64,
    /// Macro-tile side length for the element type planned for.
    pub block: usize,
    /// Destination stride pattern permits non-temporal stores (subject to
    /// the runtime base-pointer alignment check).
    pub stream_strides_ok: bool,
}

impl Plan {
    pub(crate) fn num_tasks(&self) -> usize {
        self.tasks.len()
    }
}

/// Balanced chunk `[start, end)` of `0..extent` for coordinate `c` of `n`,
/// with chunk boundaries aligned to `unit`.
fn chunk(extent: usize, n: usize, c: usize, unit: usize) -> (usize, usize) {
    let cells = extent.div_ceil(unit);
    let per = cells.div_ceil(n);
    let start = (c * per * unit).min(extent);
    let end = ((c + 1) * per * unit).min(extent);
    (start, end)
}

/// Build the per-task chains for a chosen (order, parallelisation) pair.
///
/// `chain` lists the loop axes outermost-first (excluding the axes the
/// leaf consumes); `n_at_axis` gives the parallel factor of every fused
/// axis (1 = sequential).
pub(crate) fn materialize(
    shape: &FusedShape,
    kind: LeafKind,
    chain: &[usize],
    n_at_axis: &[usize],
    block: usize,
    score: f64,
    elem_size: usize,
) -> Plan {
    let kernel_axes: SmallVec<[usize; 2]> = match kind {
        LeafKind::Tile { axis_a, axis_b, .. } => SmallVec::from_slice(&[axis_b, axis_a]),
        LeafKind::Copy { axis, .. } => SmallVec::from_slice(&[axis]),
    };
    let mut full_order: Vec<usize> = chain.to_vec();
    full_order.extend_from_slice(&kernel_axes);

    let threads_at_loop: Vec<usize> = full_order.iter().map(|&ax| n_at_axis[ax]).collect();
    let num_tasks: usize = threads_at_loop.iter().product();

    let mut tasks = Vec::with_capacity(num_tasks);
    for tid in 0..num_tasks {
        // Decompose the task id into per-loop coordinates, outermost loop
        // most significant.
        let mut coords: SmallVec<[usize; 8]> = SmallVec::with_capacity(full_order.len());
        let mut rem = tid;
        let mut radix_tail: usize = threads_at_loop.iter().product();
        for &n in &threads_at_loop {
            radix_tail /= n;
            coords.push(rem / radix_tail);
            rem %= radix_tail;
        }

        let mut nodes: SmallVec<[ComputeNode; 8]> = SmallVec::with_capacity(chain.len());
        for (pos, &axis) in chain.iter().enumerate() {
            let (start, end) = chunk(shape.size[axis], threads_at_loop[pos], coords[pos], 1);
            nodes.push(ComputeNode {
                start,
                end,
                inc: 1,
                lda: shape.lda[axis],
                ldb: shape.ldb[axis],
            });
        }

        let leaf = match kind {
            LeafKind::Tile { axis_a, axis_b, .. } => {
                let pos_b = chain.len();
                let pos_a = chain.len() + 1;
                let (b_start, b_end) = chunk(
                    shape.size[axis_b],
                    threads_at_loop[pos_b],
                    coords[pos_b],
                    block,
                );
                let (a_start, a_end) = chunk(
                    shape.size[axis_a],
                    threads_at_loop[pos_a],
                    coords[pos_a],
                    block,
                );
                LeafRange::Tile {
                    a_start,
                    a_end,
                    b_start,
                    b_end,
                }
            }
            LeafKind::Copy { axis, .. } => {
                let pos = chain.len();
                let (start, end) = chunk(shape.size[axis], threads_at_loop[pos], coords[pos], 1);
                LeafRange::Copy { start, end }
            }
        };

        tasks.push(Task { nodes, leaf });
    }

    let stream_strides_ok = stream_strides_ok(shape, &kind, chain, elem_size);

    Plan {
        full_order,
        threads_at_loop,
        kind,
        tasks,
        score,
        block,
        stream_strides_ok,
    }
}

/// Non-temporal stores need every destination row start 32-byte aligned.
/// Tile starts along the kernel plane are multiples of the macro tile
/// (whose byte size is a multiple of 32 for the vector types), so the
/// remaining conditions are on the strides: unit in-plane stride, and
/// 32-byte-aligned byte strides for `ldb_inner` and every chain loop.
fn stream_strides_ok(
    shape: &FusedShape,
    kind: &LeafKind,
    chain: &[usize],
    elem_size: usize,
) -> bool {
    match *kind {
        LeafKind::Tile {
            ldb_inner, unit, ..
        } => {
            unit && (ldb_inner.unsigned_abs() * elem_size) % 32 == 0
                && chain
                    .iter()
                    .all(|&ax| (shape.ldb[ax].unsigned_abs() * elem_size) % 32 == 0)
        }
        LeafKind::Copy { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::normalize;

    fn shape_of(size: &[usize], perm: &[usize]) -> FusedShape {
        let outer_b: Vec<usize> = perm.iter().map(|&p| size[p]).collect();
        normalize(size, perm, size, &outer_b)
    }

    fn tile_kind(shape: &FusedShape, axis_a: usize, axis_b: usize) -> LeafKind {
        LeafKind::Tile {
            axis_a,
            axis_b,
            sa: shape.lda[axis_a],
            sb: shape.ldb[axis_b],
            lda_inner: shape.lda[axis_b],
            ldb_inner: shape.ldb[axis_a],
            unit: shape.lda[axis_a] == 1 && shape.ldb[axis_b] == 1,
        }
    }

    #[test]
    fn test_chunk_covers_and_aligns() {
        // 100 cells over 3 workers in units of 16
        let parts: Vec<(usize, usize)> = (0..3).map(|c| chunk(100, 3, c, 16)).collect();
        assert_eq!(parts[0].0, 0);
        assert_eq!(parts[2].1, 100);
        for w in parts.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
        for &(s, _) in &parts {
            assert_eq!(s % 16, 0);
        }
    }

    #[test]
    fn test_chunk_tolerates_excess_workers() {
        // more workers than cells: trailing chunks are empty
        let parts: Vec<(usize, usize)> = (0..4).map(|c| chunk(2, 4, c, 1)).collect();
        assert_eq!(parts[0], (0, 1));
        assert_eq!(parts[1], (1, 2));
        assert!(parts[2].0 >= parts[2].1);
        assert!(parts[3].0 >= parts[3].1);
    }

    #[test]
    fn test_materialize_sequential_single_task() {
        let shape = shape_of(&[8, 5, 7], &[2, 1, 0]);
        let kind = tile_kind(&shape, 0, 2);
        let n = vec![1usize; shape.rank()];
        let plan = materialize(&shape, kind, &[1], &n, 16, 0.0, 8);
        assert_eq!(plan.num_tasks(), 1);
        assert_eq!(plan.tasks[0].nodes.len(), 1);
        assert_eq!(plan.tasks[0].nodes[0].end, 5);
        match plan.tasks[0].leaf {
            LeafRange::Tile {
                a_start,
                a_end,
                b_start,
                b_end,
            } => {
                assert_eq!((a_start, a_end), (0, 8));
                assert_eq!((b_start, b_end), (0, 7));
            }
            _ => panic!("expected tile leaf"),
        }
    }

    #[test]
    fn test_materialize_parallel_covers_disjointly() {
        let shape = shape_of(&[32, 6, 48], &[2, 1, 0]);
        let kind = tile_kind(&shape, 0, 2);
        // 2 ways on the chain axis (1), 3 ways on the b kernel axis (2)
        let mut n = vec![1usize; shape.rank()];
        n[1] = 2;
        n[2] = 3;
        let plan = materialize(&shape, kind, &[1], &n, 16, 0.0, 8);
        assert_eq!(plan.num_tasks(), 6);
        assert_eq!(plan.threads_at_loop, vec![2, 3, 1]);

        // Every (chain, b) cell is covered exactly once.
        let mut hits = vec![0u32; 6 * 48];
        for task in &plan.tasks {
            let node = &task.nodes[0];
            if let LeafRange::Tile {
                b_start, b_end, ..
            } = task.leaf
            {
                for c in node.start..node.end {
                    for b in b_start..b_end {
                        hits[c * 48 + b] += 1;
                    }
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn test_stream_strides() {
        // f64 (elem 8): ldb_inner = 48 -> 384 bytes, chain stride
        // 48*6=288... both multiples of 32 -> streaming pattern ok.
        let shape = shape_of(&[32, 6, 48], &[2, 1, 0]);
        let kind = tile_kind(&shape, 0, 2);
        let n = vec![1usize; shape.rank()];
        let plan = materialize(&shape, kind, &[1], &n, 16, 0.0, 8);
        assert!(plan.stream_strides_ok);

        // f32 with a 20-wide b extent: the chain loop's B stride is
        // 20*4 = 80 bytes, not a multiple of 32, so streaming is off.
        let shape2 = shape_of(&[32, 6, 20], &[2, 1, 0]);
        let kind2 = tile_kind(&shape2, 0, 2);
        let plan2 = materialize(&shape2, kind2, &[1], &n, 32, 0.0, 4);
        assert!(!plan2.stream_strides_ok);
    }
}
