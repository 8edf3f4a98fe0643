//! Distance kernels with runtime SIMD dispatch
//!
//! Scalar fallbacks are written as plain iterator folds so LLVM can
//! auto-vectorize them; on x86_64 an AVX2+FMA path is selected once at
//! startup when the CPU supports it.

use std::sync::OnceLock;

/// Function table chosen at first use.
struct Dispatch {
    l2: fn(&[f32], &[f32]) -> f32,
    ip: fn(&[f32], &[f32]) -> f32,
}

fn dispatch() -> &'static Dispatch {
    static TABLE: OnceLock<Dispatch> = OnceLock::new();
    TABLE.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return Dispatch {
                    l2: l2_squared_avx2_entry,
                    ip: inner_product_avx2_entry,
                };
            }
        }
        Dispatch {
            l2: l2_squared_scalar,
            ip: inner_product_scalar,
        }
    })
}

/// Squared Euclidean distance between two equal-length vectors.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    (dispatch().l2)(a, b)
}

/// Inner product of two equal-length vectors.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    (dispatch().ip)(a, b)
}

fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn inner_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(target_arch = "x86_64")]
fn l2_squared_avx2_entry(a: &[f32], b: &[f32]) -> f32 {
    // Safety: the dispatch table only selects this entry after AVX2+FMA
    // detection succeeded.
    unsafe { l2_squared_avx2(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn inner_product_avx2_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { inner_product_avx2(a, b) }
}

/// AVX2 squared L2: 8 floats per iteration with FMA accumulation.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;
    let mut acc = _mm256_setzero_ps();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        let diff = _mm256_sub_ps(va, vb);
        acc = _mm256_fmadd_ps(diff, diff, acc);
    }

    let mut sum = horizontal_sum(acc);
    for i in chunks * 8..n {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// AVX2 dot product: 8 floats per iteration with FMA accumulation.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn inner_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;
    let mut acc = _mm256_setzero_ps();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    let mut sum = horizontal_sum(acc);
    for i in chunks * 8..n {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn horizontal_sum(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;
    let hi = _mm256_extractf128_ps(v, 1);
    let lo = _mm256_castps256_ps128(v);
    let sum4 = _mm_add_ps(hi, lo);
    let sum2 = _mm_add_ps(sum4, _mm_movehl_ps(sum4, sum4));
    let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 0b01));
    _mm_cvtss_f32(sum1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_of_identical_vectors_is_zero() {
        let v = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(l2_squared(&v, &v), 0.0);
    }

    #[test]
    fn l2_matches_hand_computation() {
        let a = [0.0, 0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0, 0.0];
        assert_eq!(l2_squared(&a, &b), 1.0);

        let c = [2.0, 0.0, 0.0, 0.0];
        assert_eq!(l2_squared(&a, &c), 4.0);
    }

    #[test]
    fn inner_product_matches_hand_computation() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        assert_eq!(inner_product(&a, &b), 32.0);
    }

    #[test]
    fn dispatch_agrees_with_scalar_on_odd_lengths() {
        // 19 floats exercises both the SIMD body and the scalar tail
        let a: Vec<f32> = (0..19).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..19).map(|i| (18 - i) as f32 * 0.25).collect();

        let l2 = l2_squared(&a, &b);
        let l2_ref = l2_squared_scalar(&a, &b);
        assert!((l2 - l2_ref).abs() < 1e-3, "{} vs {}", l2, l2_ref);

        let ip = inner_product(&a, &b);
        let ip_ref = inner_product_scalar(&a, &b);
        assert!((ip - ip_ref).abs() < 1e-3, "{} vs {}", ip, ip_ref);
    }
}
