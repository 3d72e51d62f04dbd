//! NEON micro-kernels: 4×4 f32 and 2×2 f64 in-register transposes.
//!
//! 128-bit registers halve the lane count relative to the AVX kernels.
//! aarch64 has no non-temporal vector store worth using here, so the
//! streaming variant falls back to the regular overwrite kernel (see
//! `Element::micro_stream`).

#![allow(clippy::missing_safety_doc)]

use std::arch::aarch64::*;

#[inline(always)]
pub(crate) unsafe fn overwrite_f32_4x4(
    src: *const f32,
    lda: isize,
    dst: *mut f32,
    ldb: isize,
    alpha: f32,
) {
    let r0 = vld1q_f32(src);
    let r1 = vld1q_f32(src.offset(lda));
    let r2 = vld1q_f32(src.offset(2 * lda));
    let r3 = vld1q_f32(src.offset(3 * lda));

    let t01 = vtrnq_f32(r0, r1);
    let t23 = vtrnq_f32(r2, r3);
    let o0 = vcombine_f32(vget_low_f32(t01.0), vget_low_f32(t23.0));
    let o1 = vcombine_f32(vget_low_f32(t01.1), vget_low_f32(t23.1));
    let o2 = vcombine_f32(vget_high_f32(t01.0), vget_high_f32(t23.0));
    let o3 = vcombine_f32(vget_high_f32(t01.1), vget_high_f32(t23.1));

    vst1q_f32(dst, vmulq_n_f32(o0, alpha));
    vst1q_f32(dst.offset(ldb), vmulq_n_f32(o1, alpha));
    vst1q_f32(dst.offset(2 * ldb), vmulq_n_f32(o2, alpha));
    vst1q_f32(dst.offset(3 * ldb), vmulq_n_f32(o3, alpha));
}

#[inline(always)]
pub(crate) unsafe fn update_f32_4x4(
    src: *const f32,
    lda: isize,
    dst: *mut f32,
    ldb: isize,
    alpha: f32,
    beta: f32,
) {
    let r0 = vld1q_f32(src);
    let r1 = vld1q_f32(src.offset(lda));
    let r2 = vld1q_f32(src.offset(2 * lda));
    let r3 = vld1q_f32(src.offset(3 * lda));

    let t01 = vtrnq_f32(r0, r1);
    let t23 = vtrnq_f32(r2, r3);
    let o = [
        vcombine_f32(vget_low_f32(t01.0), vget_low_f32(t23.0)),
        vcombine_f32(vget_low_f32(t01.1), vget_low_f32(t23.1)),
        vcombine_f32(vget_high_f32(t01.0), vget_high_f32(t23.0)),
        vcombine_f32(vget_high_f32(t01.1), vget_high_f32(t23.1)),
    ];

    for (i, out) in o.iter().enumerate() {
        let d = dst.offset(i as isize * ldb);
        let acc = vfmaq_n_f32(vmulq_n_f32(vld1q_f32(d), beta), *out, alpha);
        vst1q_f32(d, acc);
    }
}

#[inline(always)]
pub(crate) unsafe fn overwrite_f64_2x2(
    src: *const f64,
    lda: isize,
    dst: *mut f64,
    ldb: isize,
    alpha: f64,
) {
    let r0 = vld1q_f64(src);
    let r1 = vld1q_f64(src.offset(lda));
    let o0 = vtrn1q_f64(r0, r1);
    let o1 = vtrn2q_f64(r0, r1);
    vst1q_f64(dst, vmulq_n_f64(o0, alpha));
    vst1q_f64(dst.offset(ldb), vmulq_n_f64(o1, alpha));
}

#[inline(always)]
pub(crate) unsafe fn update_f64_2x2(
    src: *const f64,
    lda: isize,
    dst: *mut f64,
    ldb: isize,
    alpha: f64,
    beta: f64,
) {
    let r0 = vld1q_f64(src);
    let r1 = vld1q_f64(src.offset(lda));
    let o0 = vtrn1q_f64(r0, r1);
    let o1 = vtrn2q_f64(r0, r1);
    let d0 = dst;
    let d1 = dst.offset(ldb);
    vst1q_f64(d0, vfmaq_n_f64(vmulq_n_f64(vld1q_f64(d0), beta), o0, alpha));
    vst1q_f64(d1, vfmaq_n_f64(vmulq_n_f64(vld1q_f64(d1), beta), o1, alpha));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::micro_kernel::scalar;

    #[test]
    fn test_neon_f32_matches_scalar() {
        let src: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mut got = vec![0.0f32; 16];
        let mut want = vec![0.0f32; 16];
        unsafe {
            overwrite_f32_4x4(src.as_ptr(), 4, got.as_mut_ptr(), 4, 3.0);
            scalar::micro_overwrite(4, src.as_ptr(), 4, want.as_mut_ptr(), 4, 3.0f32);
        }
        assert_eq!(got, want);
    }

    #[test]
    fn test_neon_f64_update_matches_scalar() {
        let src: Vec<f64> = (0..4).map(|i| i as f64).collect();
        let mut got = vec![5.0f64; 4];
        let mut want = vec![5.0f64; 4];
        unsafe {
            update_f64_2x2(src.as_ptr(), 2, got.as_mut_ptr(), 2, 2.0, -1.0);
            scalar::micro_update(2, src.as_ptr(), 2, want.as_mut_ptr(), 2, 2.0f64, -1.0f64);
        }
        assert_eq!(got, want);
    }
}
