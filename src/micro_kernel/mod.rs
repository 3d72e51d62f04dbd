//! Element types and the W×W in-register transpose micro-kernel.
//!
//! The micro-kernel is the innermost building block: a MICRO × MICRO tile
//! transpose where MICRO = REGISTER_BITS / 8 / sizeof(T). On x86_64 the
//! f32/f64 kernels are AVX shuffle networks with an optional non-temporal
//! store variant; on aarch64 they are NEON trn networks. The complex
//! types and every other target go through the scalar kernels, which are
//! written as plain nested loops that LLVM auto-vectorises and which are
//! the functional reference for the vector kernels.

pub(crate) mod scalar;

#[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
pub(crate) mod avx;

#[cfg(target_arch = "aarch64")]
pub(crate) mod neon;

use num_complex::Complex;
use num_traits::{One, Zero};

/// Vector register width the kernels are laid out for.
#[cfg(target_arch = "aarch64")]
pub const REGISTER_BITS: usize = 128;
/// Vector register width the kernels are laid out for.
#[cfg(not(target_arch = "aarch64"))]
pub const REGISTER_BITS: usize = 256;

/// An element type the transpose engine can move.
///
/// Implemented for `f32`, `f64`, `Complex<f32>` and `Complex<f64>`. The
/// three micro-kernel entry points share one contract: for i, j in
/// 0..MICRO,
///
/// ```text
/// dst[j + i*ldb] = alpha * src[i + j*lda]              (overwrite/stream)
/// dst[j + i*ldb] = alpha * src[i + j*lda] + beta * dst[j + i*ldb]
/// ```
///
/// where i runs along the source-contiguous direction and j along the
/// destination-contiguous direction.
pub trait Element:
    Copy
    + Send
    + Sync
    + PartialEq
    + Zero
    + One
    + std::ops::Mul<Output = Self>
    + std::ops::Add<Output = Self>
    + 'static
{
    /// Micro-tile side length (vector lanes).
    const MICRO: usize;

    /// Macro-tile side length.
    const BLOCK: usize = 4 * Self::MICRO;

    /// Whether a non-temporal store kernel exists on this build.
    const HAS_STREAM_KERNEL: bool = false;

    /// beta-update micro-tile.
    ///
    /// # Safety
    /// `src` must be readable and `dst` readable+writable for a full
    /// MICRO × MICRO tile under the given strides.
    unsafe fn micro_update(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
        beta: Self,
    );

    /// beta = 0 overwrite micro-tile.
    ///
    /// # Safety
    /// `src` must be readable and `dst` writable for a full MICRO × MICRO
    /// tile under the given strides.
    unsafe fn micro_overwrite(src: *const Self, lda: isize, dst: *mut Self, ldb: isize, alpha: Self);

    /// beta = 0 overwrite with non-temporal stores. Falls back to the
    /// regular overwrite kernel where no streaming instruction exists.
    ///
    /// # Safety
    /// As [`Element::micro_overwrite`]; additionally every destination row
    /// must be REGISTER_BITS/8-byte aligned when `HAS_STREAM_KERNEL`.
    unsafe fn micro_stream(src: *const Self, lda: isize, dst: *mut Self, ldb: isize, alpha: Self) {
        Self::micro_overwrite(src, lda, dst, ldb, alpha)
    }
}

impl Element for f32 {
    const MICRO: usize = REGISTER_BITS / 8 / std::mem::size_of::<f32>();
    #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
    const HAS_STREAM_KERNEL: bool = true;

    #[inline(always)]
    unsafe fn micro_update(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
        beta: Self,
    ) {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
        return avx::update_f32_8x8(src, lda, dst, ldb, alpha, beta);
        #[cfg(target_arch = "aarch64")]
        return neon::update_f32_4x4(src, lda, dst, ldb, alpha, beta);
        #[allow(unreachable_code)]
        scalar::micro_update(Self::MICRO, src, lda, dst, ldb, alpha, beta)
    }

    #[inline(always)]
    unsafe fn micro_overwrite(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
    ) {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
        return avx::overwrite_f32_8x8(src, lda, dst, ldb, alpha);
        #[cfg(target_arch = "aarch64")]
        return neon::overwrite_f32_4x4(src, lda, dst, ldb, alpha);
        #[allow(unreachable_code)]
        scalar::micro_overwrite(Self::MICRO, src, lda, dst, ldb, alpha)
    }

    #[inline(always)]
    unsafe fn micro_stream(src: *const Self, lda: isize, dst: *mut Self, ldb: isize, alpha: Self) {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
        return avx::stream_f32_8x8(src, lda, dst, ldb, alpha);
        #[allow(unreachable_code)]
        Self::micro_overwrite(src, lda, dst, ldb, alpha)
    }
}

impl Element for f64 {
    const MICRO: usize = REGISTER_BITS / 8 / std::mem::size_of::<f64>();
    #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
    const HAS_STREAM_KERNEL: bool = true;

    #[inline(always)]
    unsafe fn micro_update(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
        beta: Self,
    ) {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
        return avx::update_f64_4x4(src, lda, dst, ldb, alpha, beta);
        #[cfg(target_arch = "aarch64")]
        return neon::update_f64_2x2(src, lda, dst, ldb, alpha, beta);
        #[allow(unreachable_code)]
        scalar::micro_update(Self::MICRO, src, lda, dst, ldb, alpha, beta)
    }

    #[inline(always)]
    unsafe fn micro_overwrite(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
    ) {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
        return avx::overwrite_f64_4x4(src, lda, dst, ldb, alpha);
        #[cfg(target_arch = "aarch64")]
        return neon::overwrite_f64_2x2(src, lda, dst, ldb, alpha);
        #[allow(unreachable_code)]
        scalar::micro_overwrite(Self::MICRO, src, lda, dst, ldb, alpha)
    }

    #[inline(always)]
    unsafe fn micro_stream(src: *const Self, lda: isize, dst: *mut Self, ldb: isize, alpha: Self) {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx"))]
        return avx::stream_f64_4x4(src, lda, dst, ldb, alpha);
        #[allow(unreachable_code)]
        Self::micro_overwrite(src, lda, dst, ldb, alpha)
    }
}

// The complex kernels are scalar on every architecture: a complex lane
// shuffle network would only pay off for alpha = 1, and the blocked loops
// below auto-vectorise the data movement well. MICRO still follows the
// lane geometry so the macro-tile footprint matches the register file.
impl Element for Complex<f32> {
    const MICRO: usize = REGISTER_BITS / 8 / std::mem::size_of::<Complex<f32>>();

    #[inline(always)]
    unsafe fn micro_update(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
        beta: Self,
    ) {
        scalar::micro_update(Self::MICRO, src, lda, dst, ldb, alpha, beta)
    }

    #[inline(always)]
    unsafe fn micro_overwrite(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
    ) {
        scalar::micro_overwrite(Self::MICRO, src, lda, dst, ldb, alpha)
    }
}

impl Element for Complex<f64> {
    // 2 lanes at 256-bit, a single element at 128-bit.
    const MICRO: usize = REGISTER_BITS / 8 / std::mem::size_of::<Complex<f64>>();

    #[inline(always)]
    unsafe fn micro_update(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
        beta: Self,
    ) {
        scalar::micro_update(Self::MICRO, src, lda, dst, ldb, alpha, beta)
    }

    #[inline(always)]
    unsafe fn micro_overwrite(
        src: *const Self,
        lda: isize,
        dst: *mut Self,
        ldb: isize,
        alpha: Self,
    ) {
        scalar::micro_overwrite(Self::MICRO, src, lda, dst, ldb, alpha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micro_geometry() {
        assert_eq!(<f32 as Element>::MICRO * std::mem::size_of::<f32>() * 8, REGISTER_BITS);
        assert_eq!(<f64 as Element>::BLOCK, 4 * <f64 as Element>::MICRO);
        assert!(<Complex<f64> as Element>::MICRO >= 1);
    }

    #[test]
    fn test_micro_update_matches_contract() {
        // Exercise the dispatched kernel (vector where available) against
        // the definition dst[j + i*ldb] = a*src[i + j*lda] + b*dst.
        let w = <f64 as Element>::MICRO;
        let lda = (w + 3) as isize;
        let ldb = (w + 1) as isize;
        let src: Vec<f64> = (0..w * (w + 3)).map(|x| x as f64).collect();
        let mut dst = vec![1.0f64; w * (w + 1)];
        let expect: Vec<f64> = {
            let mut e = dst.clone();
            for i in 0..w {
                for j in 0..w {
                    let t = &mut e[j + i * ldb as usize];
                    *t = 2.0 * src[i + j * lda as usize] + 3.0 * *t;
                }
            }
            e
        };
        unsafe {
            <f64 as Element>::micro_update(src.as_ptr(), lda, dst.as_mut_ptr(), ldb, 2.0, 3.0);
        }
        assert_eq!(dst, expect);
    }

    #[test]
    fn test_micro_overwrite_f32() {
        let w = <f32 as Element>::MICRO;
        let src: Vec<f32> = (0..w * w).map(|x| x as f32).collect();
        let mut dst = vec![-1.0f32; w * w];
        unsafe {
            <f32 as Element>::micro_overwrite(
                src.as_ptr(),
                w as isize,
                dst.as_mut_ptr(),
                w as isize,
                1.0,
            );
        }
        for i in 0..w {
            for j in 0..w {
                assert_eq!(dst[j + i * w], src[i + j * w], "mismatch at i={i}, j={j}");
            }
        }
    }

    #[test]
    fn test_micro_overwrite_complex() {
        let w = <Complex<f32> as Element>::MICRO;
        let src: Vec<Complex<f32>> = (0..w * w)
            .map(|x| Complex::new(x as f32, -(x as f32)))
            .collect();
        let mut dst = vec![Complex::new(0.0, 0.0); w * w];
        let alpha = Complex::new(0.0, 1.0);
        unsafe {
            <Complex<f32> as Element>::micro_overwrite(
                src.as_ptr(),
                w as isize,
                dst.as_mut_ptr(),
                w as isize,
                alpha,
            );
        }
        for i in 0..w {
            for j in 0..w {
                assert_eq!(dst[j + i * w], alpha * src[i + j * w]);
            }
        }
    }
}
