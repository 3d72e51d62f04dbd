//! Parameter validation, index fusion, and leading dimensions.
//!
//! A rank-d source tensor A is stored column-major: axis 0 varies fastest,
//! and the stride of axis k is the prefix product of the outer extents
//! `outer_a[0..k]`. The destination B is indexed in permuted order: B axis
//! j corresponds to A axis `perm[j]`. Fusion merges A-axis pairs that are
//! traversed contiguously on both sides, which shrinks the loop nest the
//! planner has to order and parallelise.

use smallvec::SmallVec;

use crate::error::{Result, TransposeError};

/// Stack-allocated shape scratch; fused rank is almost always <= 8.
pub(crate) type AxisVec<T> = SmallVec<[T; 8]>;

/// Normalised, fused view of one transpose problem.
///
/// All vectors are indexed by *fused A-axis* (0..rank). `ldb[k]` is the
/// stride of B along the B position that A-axis k was permuted to.
#[derive(Debug, Clone)]
pub(crate) struct FusedShape {
    /// Inner extents per fused A-axis.
    pub size: AxisVec<usize>,
    /// Fused permutation: B position j holds A-axis `perm[j]`.
    pub perm: AxisVec<usize>,
    /// A stride per fused A-axis (elements).
    pub lda: AxisVec<isize>,
    /// B stride per fused A-axis (elements).
    pub ldb: AxisVec<isize>,
    /// Total number of elements moved.
    pub total: usize,
}

impl FusedShape {
    pub(crate) fn rank(&self) -> usize {
        self.size.len()
    }
}

/// Validate the raw parameters.
///
/// `outer_a`/`outer_b` have already been defaulted to dense extents by the
/// caller. Failure kinds follow the construction-time error taxonomy.
pub(crate) fn verify_parameters(
    size: &[usize],
    perm: &[usize],
    outer_a: &[usize],
    outer_b: &[usize],
) -> Result<()> {
    let dim = size.len();
    if dim == 0 {
        return Err(TransposeError::InvalidRank);
    }
    if perm.len() != dim || outer_a.len() != dim || outer_b.len() != dim {
        return Err(TransposeError::InvalidPermutation(dim));
    }

    let mut seen = AxisVec::<bool>::from_elem(false, dim);
    for &p in perm {
        if p >= dim || seen[p] {
            return Err(TransposeError::InvalidPermutation(dim));
        }
        seen[p] = true;
    }

    for k in 0..dim {
        if size[k] == 0 {
            return Err(TransposeError::InvalidExtent {
                axis: k,
                size: size[k],
                outer: outer_a[k],
            });
        }
        if outer_a[k] < size[k] {
            return Err(TransposeError::InvalidExtent {
                axis: k,
                size: size[k],
                outer: outer_a[k],
            });
        }
        // B axis k holds A axis perm[k].
        if outer_b[k] < size[perm[k]] {
            return Err(TransposeError::InvalidExtent {
                axis: perm[k],
                size: size[perm[k]],
                outer: outer_b[k],
            });
        }
    }
    Ok(())
}

/// Normalise: compute strides, strip size-1 axes, fuse.
///
/// Must be called on parameters that passed [`verify_parameters`].
pub(crate) fn normalize(
    size: &[usize],
    perm: &[usize],
    outer_a: &[usize],
    outer_b: &[usize],
) -> FusedShape {
    let dim = size.len();

    // Leading dimensions: prefix products of the outer extents. ldb is
    // computed at B positions, then re-indexed by the A axis living there.
    let mut lda_full = AxisVec::<isize>::with_capacity(dim);
    let mut stride = 1isize;
    for k in 0..dim {
        lda_full.push(stride);
        stride *= outer_a[k] as isize;
    }
    let mut ldb_full = AxisVec::<isize>::from_elem(0, dim);
    stride = 1;
    for j in 0..dim {
        ldb_full[perm[j]] = stride;
        stride *= outer_b[j] as isize;
    }

    // Strip size-1 axes. Their outer extents stay encoded in the strides
    // of the surviving axes, so nothing is lost by dropping them.
    let kept: AxisVec<usize> = (0..dim).filter(|&k| size[k] > 1).collect();
    if kept.is_empty() {
        // Degenerate single-element problem.
        return FusedShape {
            size: AxisVec::from_slice(&[1]),
            perm: AxisVec::from_slice(&[0]),
            lda: AxisVec::from_slice(&[1]),
            ldb: AxisVec::from_slice(&[1]),
            total: 1,
        };
    }

    let mut fsize: AxisVec<usize> = kept.iter().map(|&k| size[k]).collect();
    let mut flda: AxisVec<isize> = kept.iter().map(|&k| lda_full[k]).collect();
    let mut fldb: AxisVec<isize> = kept.iter().map(|&k| ldb_full[k]).collect();
    // Re-number the permutation over the kept axes.
    let mut fperm: AxisVec<usize> = perm
        .iter()
        .filter(|&&p| size[p] > 1)
        .map(|&p| kept.iter().position(|&k| k == p).unwrap())
        .collect();

    // Greedy fusion. A-axes p and p+1 merge when they are adjacent in the
    // permutation and dense on both sides; restarting from position 0
    // after each merge gives axis 0 (the contiguous axis of A) first shot,
    // which unlocks the stride-1-on-both-sides fast path most often.
    'outer: loop {
        for i in 0..fperm.len().saturating_sub(1) {
            let p = fperm[i];
            let q = fperm[i + 1];
            if q != p + 1 {
                continue;
            }
            let run = fsize[p] as isize;
            if flda[q] != flda[p] * run || fldb[q] != fldb[p] * run {
                continue;
            }
            fsize[p] *= fsize[q];
            fsize.remove(q);
            flda.remove(q);
            fldb.remove(q);
            fperm.remove(i + 1);
            for entry in fperm.iter_mut() {
                if *entry > p {
                    *entry -= 1;
                }
            }
            continue 'outer;
        }
        break;
    }

    let total = fsize.iter().product();
    FusedShape {
        size: fsize,
        perm: fperm,
        lda: flda,
        ldb: fldb,
        total,
    }
}

/// Number of elements a buffer must hold for the given outer extents.
pub(crate) fn storage_len(outer: &[usize]) -> usize {
    outer.iter().product()
}
