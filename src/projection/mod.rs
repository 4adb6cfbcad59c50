//! Random-projection pre-filter: a fixed orthonormal basis maps embeddings
//! into a small space where squared Euclidean distance cheaply screens
//! candidates before the cosine scan.
use crate::errors::{MemodexError, Result};
use rand::Rng;

/// Number of projection vectors per service.
pub const PROJECTION_K: usize = 8;

/// Default upper bound on squared projection distance for a candidate to be
/// scanned. Generous on purpose: the filter must not reject near neighbors.
pub const DEFAULT_PROJECTION_THRESHOLD: f64 = 2.0;

// A residual this small means the draw was (numerically) inside the span of
// the accepted vectors; redraw instead of normalizing noise.
const MIN_RESIDUAL_NORM: f64 = 1e-6;
const MAX_DRAWS_PER_VECTOR: usize = 32;

/// Generate [`PROJECTION_K`] orthonormal vectors of the given dimensionality
/// via Gram–Schmidt over uniform [-1, 1] draws. Generated once per service
/// and immutable afterwards.
pub fn generate_orthonormal(dimensions: usize) -> Result<Vec<Vec<f32>>> {
    if dimensions < PROJECTION_K {
        return Err(MemodexError::Validation(format!(
            "projection basis needs at least {PROJECTION_K} dimensions, service has {dimensions}"
        )));
    }

    let mut rng = rand::thread_rng();
    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(PROJECTION_K);

    while basis.len() < PROJECTION_K {
        let mut accepted = false;
        for _ in 0..MAX_DRAWS_PER_VECTOR {
            let mut candidate: Vec<f64> =
                (0..dimensions).map(|_| rng.gen_range(-1.0..=1.0)).collect();
            for prior in &basis {
                let dot: f64 = candidate.iter().zip(prior.iter()).map(|(c, p)| c * p).sum();
                for (c, p) in candidate.iter_mut().zip(prior.iter()) {
                    *c -= dot * p;
                }
            }
            let norm = candidate.iter().map(|c| c * c).sum::<f64>().sqrt();
            if norm > MIN_RESIDUAL_NORM {
                for c in &mut candidate {
                    *c /= norm;
                }
                basis.push(candidate);
                accepted = true;
                break;
            }
        }
        if !accepted {
            return Err(MemodexError::Validation(format!(
                "could not draw {PROJECTION_K} independent projection vectors in {dimensions} dimensions"
            )));
        }
    }

    Ok(basis
        .into_iter()
        .map(|v| v.into_iter().map(|c| c as f32).collect())
        .collect())
}

/// Project an embedding onto the basis: the K dot products, accumulated in
/// f64 because these values feed distance arithmetic on the query path.
pub fn project(vector: &[f32], basis: &[Vec<f32>]) -> Result<[f64; PROJECTION_K]> {
    let mut out = [0.0_f64; PROJECTION_K];
    if basis.len() != PROJECTION_K {
        return Err(MemodexError::Validation(format!(
            "projection basis has {} vectors, expected {PROJECTION_K}",
            basis.len()
        )));
    }
    for (slot, axis) in out.iter_mut().zip(basis.iter()) {
        if axis.len() != vector.len() {
            return Err(MemodexError::Validation(format!(
                "projection dimension mismatch: vector {} vs basis {}",
                vector.len(),
                axis.len()
            )));
        }
        *slot = vector
            .iter()
            .zip(axis.iter())
            .map(|(&v, &a)| f64::from(v) * f64::from(a))
            .sum();
    }
    Ok(out)
}

/// Squared Euclidean distance between two projections.
pub fn distance_sq(a: &[f64; PROJECTION_K], b: &[f64; PROJECTION_K]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
