//! Macro-kernel: a BLOCK × BLOCK tile as a grid of micro-kernel calls.
//!
//! Each call handles a tile of up to BLOCK × BLOCK elements (BLOCK =
//! 4 · MICRO). Full MICRO × MICRO sub-tiles go through the vector
//! micro-kernel; ragged edges are finished by scalar loops that preserve
//! the alpha/beta semantics. The i-outer / j-inner grid walk keeps the
//! destination write pattern monotonic within each row band, which is
//! what the streaming-store variant needs.

use crate::micro_kernel::Element;

/// Scalar patch covering rows `i0..i1` × cols `j0..j1` of the tile.
///
/// # Safety
/// `src`/`dst` must be valid for the patch under the given strides.
#[inline]
unsafe fn scalar_patch<T: Element, const BETA_ZERO: bool>(
    src: *const T,
    lda: isize,
    dst: *mut T,
    ldb: isize,
    i0: usize,
    i1: usize,
    j0: usize,
    j1: usize,
    alpha: T,
    beta: T,
) {
    for i in i0 as isize..i1 as isize {
        for j in j0 as isize..j1 as isize {
            let d = dst.offset(j + i * ldb);
            let v = alpha * *src.offset(i + j * lda);
            *d = if BETA_ZERO { v } else { v + beta * *d };
        }
    }
}

/// Transpose-scale a `rows_a × rows_b` tile: for i in 0..rows_a, j in
/// 0..rows_b,
///
/// ```text
/// dst[j + i*ldb] = alpha * src[i + j*lda] (+ beta * dst[j + i*ldb])
/// ```
///
/// `rows_a`/`rows_b` may be anything up to `T::BLOCK`; i must be the
/// source-contiguous direction and j the destination-contiguous one.
///
/// # Safety
/// - `src` readable and `dst` writable for the full tile under the strides
/// - when `STREAM` is set, every destination row must be 32-byte aligned
///   (the planner's streaming gate guarantees this for full tiles)
#[inline]
pub(crate) unsafe fn macro_kernel<T: Element, const STREAM: bool, const BETA_ZERO: bool>(
    src: *const T,
    lda: isize,
    rows_a: usize,
    dst: *mut T,
    ldb: isize,
    rows_b: usize,
    alpha: T,
    beta: T,
) {
    let w = T::MICRO;
    let full_a = rows_a / w;
    let rem_a = rows_a % w;
    let full_b = rows_b / w;
    let rem_b = rows_b % w;

    for ia in 0..full_a {
        let i = (ia * w) as isize;
        for jb in 0..full_b {
            let j = (jb * w) as isize;
            let s = src.offset(i + j * lda);
            let d = dst.offset(j + i * ldb);
            if BETA_ZERO {
                if STREAM {
                    T::micro_stream(s, lda, d, ldb, alpha);
                } else {
                    T::micro_overwrite(s, lda, d, ldb, alpha);
                }
            } else {
                T::micro_update(s, lda, d, ldb, alpha, beta);
            }
        }
        // Ragged columns on the right of this row band.
        if rem_b > 0 {
            scalar_patch::<T, BETA_ZERO>(
                src,
                lda,
                dst,
                ldb,
                ia * w,
                (ia + 1) * w,
                full_b * w,
                rows_b,
                alpha,
                beta,
            );
        }
    }
    // Ragged rows at the bottom, full width.
    if rem_a > 0 {
        scalar_patch::<T, BETA_ZERO>(
            src, lda, dst, ldb, full_a * w, rows_a, 0, rows_b, alpha, beta,
        );
    }
}

/// Fully strided scalar tile for the rare case where neither side of the
/// kernel plane is unit-stride (a size-1 axis with an outer halo consumed
/// the dense run). Element (i, j) lives at `src[i*sa + j*lda]` and
/// `dst[j*sb + i*ldb]`.
///
/// # Safety
/// `src`/`dst` must be valid for the full tile under all four strides.
#[inline]
pub(crate) unsafe fn macro_kernel_strided<T: Element, const BETA_ZERO: bool>(
    src: *const T,
    sa: isize,
    lda: isize,
    rows_a: usize,
    dst: *mut T,
    sb: isize,
    ldb: isize,
    rows_b: usize,
    alpha: T,
    beta: T,
) {
    for i in 0..rows_a as isize {
        for j in 0..rows_b as isize {
            let d = dst.offset(j * sb + i * ldb);
            let v = alpha * *src.offset(i * sa + j * lda);
            *d = if BETA_ZERO { v } else { v + beta * *d };
        }
    }
}

/// Constant-stride-1 leaf: a linear run where source and destination walk
/// the same fused axis. Degenerates to `memcpy` for the plain-copy case.
///
/// # Safety
/// `src`/`dst` must cover `count` elements under the given strides and
/// must not overlap.
#[inline(always)]
pub(crate) unsafe fn const_stride1_copy<T: Element, const BETA_ZERO: bool>(
    src: *const T,
    s_stride: isize,
    dst: *mut T,
    d_stride: isize,
    count: usize,
    alpha: T,
    beta: T,
) {
    if BETA_ZERO && s_stride == 1 && d_stride == 1 {
        if alpha.is_one() {
            std::ptr::copy_nonoverlapping(src, dst, count);
        } else {
            for k in 0..count {
                *dst.add(k) = alpha * *src.add(k);
            }
        }
        return;
    }
    let mut s = src;
    let mut d = dst;
    for _ in 0..count {
        *d = if BETA_ZERO {
            alpha * *s
        } else {
            alpha * *s + beta * *d
        };
        s = s.offset(s_stride);
        d = d.offset(d_stride);
    }
}
