//! Vector kernels for the iterative solvers
//!
//! With the `simd` feature the loops run on `wide::f64x4` lanes (SSE/AVX/NEON
//! natively, WASM SIMD in the browser build); otherwise plain iterator code.
//! Tails shorter than one lane are always handled by the scalar path.

#[cfg(feature = "simd")]
use wide::f64x4;

#[cfg(feature = "simd")]
const LANES: usize = 4;

#[cfg(feature = "simd")]
#[inline]
fn lane(chunk: &[f64]) -> f64x4 {
    f64x4::from([chunk[0], chunk[1], chunk[2], chunk[3]])
}

/// sum(a[i] * b[i])
#[cfg(feature = "simd")]
#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let ca = a.chunks_exact(LANES);
    let cb = b.chunks_exact(LANES);
    let tail: f64 = ca.remainder().iter().zip(cb.remainder()).map(|(x, y)| x * y).sum();
    let acc = ca.zip(cb).fold(f64x4::ZERO, |acc, (x, y)| acc + lane(x) * lane(y));
    acc.reduce_add() + tail
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// a += alpha * b
#[cfg(feature = "simd")]
#[inline]
pub fn axpy(a: &mut [f64], alpha: f64, b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    let valpha = f64x4::splat(alpha);
    let mut ca = a.chunks_exact_mut(LANES);
    let mut cb = b.chunks_exact(LANES);
    for (x, y) in (&mut ca).zip(&mut cb) {
        let r = lane(x) + valpha * lane(y);
        x.copy_from_slice(r.as_array_ref());
    }
    for (x, y) in ca.into_remainder().iter_mut().zip(cb.remainder()) {
        *x += alpha * y;
    }
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn axpy(a: &mut [f64], alpha: f64, b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    a.iter_mut().zip(b).for_each(|(x, y)| *x += alpha * y);
}

/// a = b + beta * a
#[cfg(feature = "simd")]
#[inline]
pub fn xpby(a: &mut [f64], b: &[f64], beta: f64) {
    debug_assert_eq!(a.len(), b.len());
    let vbeta = f64x4::splat(beta);
    let mut ca = a.chunks_exact_mut(LANES);
    let mut cb = b.chunks_exact(LANES);
    for (x, y) in (&mut ca).zip(&mut cb) {
        let r = lane(y) + vbeta * lane(x);
        x.copy_from_slice(r.as_array_ref());
    }
    for (x, y) in ca.into_remainder().iter_mut().zip(cb.remainder()) {
        *x = y + beta * *x;
    }
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn xpby(a: &mut [f64], b: &[f64], beta: f64) {
    debug_assert_eq!(a.len(), b.len());
    a.iter_mut().zip(b).for_each(|(x, y)| *x = y + beta * *x);
}

/// a *= s
#[inline]
pub fn scale_inplace(a: &mut [f64], s: f64) {
    a.iter_mut().for_each(|x| *x *= s);
}

/// b - a, e.g. a residual from a prediction
#[inline]
pub fn sub_from(b: &[f64], a: &[f64]) -> Vec<f64> {
    debug_assert_eq!(a.len(), b.len());
    b.iter().zip(a).map(|(y, x)| y - x).collect()
}
