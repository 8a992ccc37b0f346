// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Distance Kernels
//!
//! Dot product and squared-L2 kernels with an AVX2+FMA path when the
//! target enables it, and a four-accumulator scalar loop otherwise (which
//! the compiler auto-vectorizes on most targets).
//!
//! All distances are "lower is closer".

use std::fmt;
use std::str::FromStr;

#[cfg(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma"))]
use std::arch::x86_64::{
    __m256, _mm256_fmadd_ps, _mm256_loadu_ps, _mm256_setzero_ps, _mm256_storeu_ps,
    _mm256_sub_ps,
};

use serde::{Deserialize, Serialize};

/// Guards cosine distance against zero-norm vectors
const NORM_EPSILON: f32 = 1e-8;

/// Distance metric configured per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`, in `[0, 2]`
    #[default]
    Cosine,
    /// Euclidean distance
    L2,
}

impl DistanceMetric {
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_distance_f32(a, b),
            DistanceMetric::L2 => euclidean_distance_f32(a, b),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            other => Err(format!("unknown distance metric '{}'", other)),
        }
    }
}

/// Dot product
#[inline]
pub fn dot_product_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma"))]
    {
        // SAFETY: the cfg above guarantees AVX2 and FMA are available
        unsafe { dot_product_avx2(a, b) }
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma")))]
    {
        dot_product_scalar(a, b)
    }
}

/// Squared Euclidean distance
#[inline]
pub fn l2_squared_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma"))]
    {
        // SAFETY: the cfg above guarantees AVX2 and FMA are available
        unsafe { l2_squared_avx2(a, b) }
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma")))]
    {
        l2_squared_scalar(a, b)
    }
}

#[inline]
pub fn l2_norm_f32(a: &[f32]) -> f32 {
    dot_product_f32(a, a).sqrt()
}

#[inline]
pub fn cosine_distance_f32(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product_f32(a, b);
    let norms = l2_norm_f32(a) * l2_norm_f32(b);
    1.0 - dot / (norms + NORM_EPSILON)
}

#[inline]
pub fn euclidean_distance_f32(a: &[f32], b: &[f32]) -> f32 {
    l2_squared_f32(a, b).sqrt()
}

#[allow(dead_code)]
#[inline]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0f32; 4];
    let mut chunks_a = a.chunks_exact(4);
    let mut chunks_b = b.chunks_exact(4);
    for (ca, cb) in chunks_a.by_ref().zip(chunks_b.by_ref()) {
        for lane in 0..4 {
            acc[lane] += ca[lane] * cb[lane];
        }
    }
    let tail: f32 = chunks_a
        .remainder()
        .iter()
        .zip(chunks_b.remainder())
        .map(|(x, y)| x * y)
        .sum();
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
}

#[allow(dead_code)]
#[inline]
fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0f32; 4];
    let mut chunks_a = a.chunks_exact(4);
    let mut chunks_b = b.chunks_exact(4);
    for (ca, cb) in chunks_a.by_ref().zip(chunks_b.by_ref()) {
        for lane in 0..4 {
            let diff = ca[lane] - cb[lane];
            acc[lane] += diff * diff;
        }
    }
    let tail: f32 = chunks_a
        .remainder()
        .iter()
        .zip(chunks_b.remainder())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
}

#[cfg(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma"))]
#[inline]
unsafe fn horizontal_sum(v: __m256) -> f32 {
    let mut lanes = [0f32; 8];
    _mm256_storeu_ps(lanes.as_mut_ptr(), v);
    lanes.iter().sum()
}

#[cfg(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma"))]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let chunks = len / 8;
    let mut sum = _mm256_setzero_ps();

    for i in 0..chunks {
        let idx = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(idx));
        let vb = _mm256_loadu_ps(b.as_ptr().add(idx));
        sum = _mm256_fmadd_ps(va, vb, sum);
    }

    let mut result = horizontal_sum(sum);
    for i in (chunks * 8)..len {
        result += a[i] * b[i];
    }
    result
}

#[cfg(all(target_arch = "x86_64", target_feature = "avx2", target_feature = "fma"))]
#[target_feature(enable = "avx2,fma")]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let chunks = len / 8;
    let mut sum = _mm256_setzero_ps();

    for i in 0..chunks {
        let idx = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(idx));
        let vb = _mm256_loadu_ps(b.as_ptr().add(idx));
        let diff = _mm256_sub_ps(va, vb);
        sum = _mm256_fmadd_ps(diff, diff, sum);
    }

    let mut result = horizontal_sum(sum);
    for i in (chunks * 8)..len {
        let diff = a[i] - b[i];
        result += diff * diff;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_dot_product_matches_naive() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.25).collect();
        let b: Vec<f32> = (0..37).map(|i| 1.0 - i as f32 * 0.1).collect();
        let expected = naive_dot(&a, &b);
        assert!((dot_product_f32(&a, &b) - expected).abs() < 1e-3);
        assert!((dot_product_scalar(&a, &b) - expected).abs() < 1e-3);
    }

    #[test]
    fn test_l2_squared() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.0, 2.0, 1.0, 4.0, 9.0];
        assert!((l2_squared_f32(&a, &b) - 21.0).abs() < 1e-5);
        assert!((euclidean_distance_f32(&a, &b) - 21f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_distance() {
        let a = [1.0, 0.0, 0.0];
        assert!(cosine_distance_f32(&a, &[2.0, 0.0, 0.0]).abs() < 1e-5);
        assert!((cosine_distance_f32(&a, &[0.0, 1.0, 0.0]) - 1.0).abs() < 1e-5);
        assert!((cosine_distance_f32(&a, &[-1.0, 0.0, 0.0]) - 2.0).abs() < 1e-5);
        // Zero vector is maximally unrelated rather than NaN
        assert!((cosine_distance_f32(&a, &[0.0, 0.0, 0.0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("L2".parse::<DistanceMetric>(), Ok(DistanceMetric::L2));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
