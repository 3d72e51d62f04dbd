//! AVX micro-kernels: 8×8 f32 and 4×4 f64 in-register transposes.
//!
//! The shuffle networks are the classic unpack / shuffle / lane-permute
//! stages: with rows r_j loaded from the source-contiguous direction, the
//! output register o_i holds lane j = r_j[i], which is stored along the
//! destination-contiguous direction. The `stream_*` variants issue
//! non-temporal stores and require every destination row to be 32-byte
//! aligned; the planner only enables them when that holds.

#![allow(clippy::missing_safety_doc)]

use std::arch::x86_64::*;

#[inline(always)]
unsafe fn transpose8_ps(r: [__m256; 8]) -> [__m256; 8] {
    let t0 = _mm256_unpacklo_ps(r[0], r[1]);
    let t1 = _mm256_unpackhi_ps(r[0], r[1]);
    let t2 = _mm256_unpacklo_ps(r[2], r[3]);
    let t3 = _mm256_unpackhi_ps(r[2], r[3]);
    let t4 = _mm256_unpacklo_ps(r[4], r[5]);
    let t5 = _mm256_unpackhi_ps(r[4], r[5]);
    let t6 = _mm256_unpacklo_ps(r[6], r[7]);
    let t7 = _mm256_unpackhi_ps(r[6], r[7]);

    let s0 = _mm256_shuffle_ps::<0x44>(t0, t2);
    let s1 = _mm256_shuffle_ps::<0xEE>(t0, t2);
    let s2 = _mm256_shuffle_ps::<0x44>(t1, t3);
    let s3 = _mm256_shuffle_ps::<0xEE>(t1, t3);
    let s4 = _mm256_shuffle_ps::<0x44>(t4, t6);
    let s5 = _mm256_shuffle_ps::<0xEE>(t4, t6);
    let s6 = _mm256_shuffle_ps::<0x44>(t5, t7);
    let s7 = _mm256_shuffle_ps::<0xEE>(t5, t7);

    [
        _mm256_permute2f128_ps::<0x20>(s0, s4),
        _mm256_permute2f128_ps::<0x20>(s1, s5),
        _mm256_permute2f128_ps::<0x20>(s2, s6),
        _mm256_permute2f128_ps::<0x20>(s3, s7),
        _mm256_permute2f128_ps::<0x31>(s0, s4),
        _mm256_permute2f128_ps::<0x31>(s1, s5),
        _mm256_permute2f128_ps::<0x31>(s2, s6),
        _mm256_permute2f128_ps::<0x31>(s3, s7),
    ]
}

#[inline(always)]
unsafe fn load8_ps(src: *const f32, lda: isize) -> [__m256; 8] {
    let mut r = [_mm256_setzero_ps(); 8];
    for (j, row) in r.iter_mut().enumerate() {
        *row = _mm256_loadu_ps(src.offset(j as isize * lda));
    }
    r
}

#[inline(always)]
pub(crate) unsafe fn overwrite_f32_8x8(
    src: *const f32,
    lda: isize,
    dst: *mut f32,
    ldb: isize,
    alpha: f32,
) {
    let o = transpose8_ps(load8_ps(src, lda));
    let va = _mm256_set1_ps(alpha);
    for (i, out) in o.iter().enumerate() {
        _mm256_storeu_ps(dst.offset(i as isize * ldb), _mm256_mul_ps(va, *out));
    }
}

#[inline(always)]
pub(crate) unsafe fn stream_f32_8x8(
    src: *const f32,
    lda: isize,
    dst: *mut f32,
    ldb: isize,
    alpha: f32,
) {
    let o = transpose8_ps(load8_ps(src, lda));
    let va = _mm256_set1_ps(alpha);
    for (i, out) in o.iter().enumerate() {
        _mm256_stream_ps(dst.offset(i as isize * ldb), _mm256_mul_ps(va, *out));
    }
}

#[inline(always)]
pub(crate) unsafe fn update_f32_8x8(
    src: *const f32,
    lda: isize,
    dst: *mut f32,
    ldb: isize,
    alpha: f32,
    beta: f32,
) {
    let o = transpose8_ps(load8_ps(src, lda));
    let va = _mm256_set1_ps(alpha);
    let vb = _mm256_set1_ps(beta);
    for (i, out) in o.iter().enumerate() {
        let d = dst.offset(i as isize * ldb);
        let acc = _mm256_add_ps(
            _mm256_mul_ps(va, *out),
            _mm256_mul_ps(vb, _mm256_loadu_ps(d)),
        );
        _mm256_storeu_ps(d, acc);
    }
}

#[inline(always)]
unsafe fn transpose4_pd(r: [__m256d; 4]) -> [__m256d; 4] {
    let t0 = _mm256_unpacklo_pd(r[0], r[1]);
    let t1 = _mm256_unpackhi_pd(r[0], r[1]);
    let t2 = _mm256_unpacklo_pd(r[2], r[3]);
    let t3 = _mm256_unpackhi_pd(r[2], r[3]);
    [
        _mm256_permute2f128_pd::<0x20>(t0, t2),
        _mm256_permute2f128_pd::<0x20>(t1, t3),
        _mm256_permute2f128_pd::<0x31>(t0, t2),
        _mm256_permute2f128_pd::<0x31>(t1, t3),
    ]
}

#[inline(always)]
unsafe fn load4_pd(src: *const f64, lda: isize) -> [__m256d; 4] {
    let mut r = [_mm256_setzero_pd(); 4];
    for (j, row) in r.iter_mut().enumerate() {
        *row = _mm256_loadu_pd(src.offset(j as isize * lda));
    }
    r
}

#[inline(always)]
pub(crate) unsafe fn overwrite_f64_4x4(
    src: *const f64,
    lda: isize,
    dst: *mut f64,
    ldb: isize,
    alpha: f64,
) {
    let o = transpose4_pd(load4_pd(src, lda));
    let va = _mm256_set1_pd(alpha);
    for (i, out) in o.iter().enumerate() {
        _mm256_storeu_pd(dst.offset(i as isize * ldb), _mm256_mul_pd(va, *out));
    }
}

#[inline(always)]
pub(crate) unsafe fn stream_f64_4x4(
    src: *const f64,
    lda: isize,
    dst: *mut f64,
    ldb: isize,
    alpha: f64,
) {
    let o = transpose4_pd(load4_pd(src, lda));
    let va = _mm256_set1_pd(alpha);
    for (i, out) in o.iter().enumerate() {
        _mm256_stream_pd(dst.offset(i as isize * ldb), _mm256_mul_pd(va, *out));
    }
}

#[inline(always)]
pub(crate) unsafe fn update_f64_4x4(
    src: *const f64,
    lda: isize,
    dst: *mut f64,
    ldb: isize,
    alpha: f64,
    beta: f64,
) {
    let o = transpose4_pd(load4_pd(src, lda));
    let va = _mm256_set1_pd(alpha);
    let vb = _mm256_set1_pd(beta);
    for (i, out) in o.iter().enumerate() {
        let d = dst.offset(i as isize * ldb);
        let acc = _mm256_add_pd(
            _mm256_mul_pd(va, *out),
            _mm256_mul_pd(vb, _mm256_loadu_pd(d)),
        );
        _mm256_storeu_pd(d, acc);
    }
}

/// Publish non-temporal stores before the fork-join returns.
#[inline(always)]
pub(crate) fn store_fence() {
    unsafe { _mm_sfence() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::micro_kernel::scalar;

    #[test]
    fn test_avx_f32_matches_scalar() {
        let src: Vec<f32> = (0..64).map(|i| i as f32 * 0.5).collect();
        let mut got = vec![0.0f32; 64];
        let mut want = vec![0.0f32; 64];
        unsafe {
            overwrite_f32_8x8(src.as_ptr(), 8, got.as_mut_ptr(), 8, 2.0);
            scalar::micro_overwrite(8, src.as_ptr(), 8, want.as_mut_ptr(), 8, 2.0f32);
        }
        assert_eq!(got, want);
    }

    #[test]
    fn test_avx_f64_update_matches_scalar() {
        let src: Vec<f64> = (0..16).map(|i| i as f64).collect();
        let mut got: Vec<f64> = (0..16).map(|i| -(i as f64)).collect();
        let mut want = got.clone();
        unsafe {
            update_f64_4x4(src.as_ptr(), 4, got.as_mut_ptr(), 4, 1.5, -2.0);
            scalar::micro_update(4, src.as_ptr(), 4, want.as_mut_ptr(), 4, 1.5f64, -2.0f64);
        }
        assert_eq!(got, want);
    }

    #[test]
    fn test_avx_stream_f32() {
        // 32-byte aligned destination so the non-temporal path is legal.
        let src: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let mut aligned = vec![0.0f32; 64 + 8];
        let off = aligned.as_ptr().align_offset(32);
        let dst = unsafe { aligned.as_mut_ptr().add(off) };
        unsafe {
            stream_f32_8x8(src.as_ptr(), 8, dst, 8, 1.0);
            store_fence();
        }
        for i in 0..8 {
            for j in 0..8 {
                let got = unsafe { *dst.add(j + i * 8) };
                assert_eq!(got, src[i + j * 8]);
            }
        }
    }
}
