//! Generic scalar micro-kernels.
//!
//! Plain nested loops over a w × w tile. `w` is always the constant
//! `Element::MICRO` at the call sites, so after inlining LLVM sees fixed
//! trip counts and unrolls/vectorises these into straight-line
//! load-store sequences. These are also the reference implementations the
//! vector kernels are tested against.

use super::Element;

/// dst[j + i*ldb] = alpha * src[i + j*lda] + beta * dst[j + i*ldb]
///
/// # Safety
/// `src`/`dst` must cover a full w × w tile under the given strides.
#[inline(always)]
pub(crate) unsafe fn micro_update<T: Element>(
    w: usize,
    src: *const T,
    lda: isize,
    dst: *mut T,
    ldb: isize,
    alpha: T,
    beta: T,
) {
    for i in 0..w as isize {
        for j in 0..w as isize {
            let d = dst.offset(j + i * ldb);
            *d = alpha * *src.offset(i + j * lda) + beta * *d;
        }
    }
}

/// dst[j + i*ldb] = alpha * src[i + j*lda]
///
/// # Safety
/// `src`/`dst` must cover a full w × w tile under the given strides.
#[inline(always)]
pub(crate) unsafe fn micro_overwrite<T: Element>(
    w: usize,
    src: *const T,
    lda: isize,
    dst: *mut T,
    ldb: isize,
    alpha: T,
) {
    for i in 0..w as isize {
        for j in 0..w as isize {
            *dst.offset(j + i * ldb) = alpha * *src.offset(i + j * lda);
        }
    }
}
