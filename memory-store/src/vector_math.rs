//! Normalization and optimized cosine similarity.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VectorMathError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// L2-normalize `v`, returning the unit vector and the original norm.
/// A zero vector normalizes to a zero vector with norm `0` (no division).
pub fn normalize(v: &[f32]) -> (Vec<f32>, f32) {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return (vec![0.0; v.len()], 0.0);
    }
    (v.iter().map(|x| x / norm).collect(), norm)
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of a pre-normalized query against a document, taking
/// the fastest available path:
/// - document pre-normalized: a pure dot product;
/// - document norm known: dot against the raw embedding divided by the norm;
/// - otherwise: the norm is computed on the fly.
///
/// Zero-norm inputs yield `0.0`.
pub fn cosine_similarity_optimized(
    query_normalized: &[f32],
    query_norm: f32,
    doc_embedding: &[f32],
    doc_norm: Option<f32>,
    doc_normalized: Option<&[f32]>,
) -> Result<f32, VectorMathError> {
    if let Some(doc_normalized) = doc_normalized {
        check_dims(query_normalized, doc_normalized)?;
        if query_norm == 0.0 {
            return Ok(0.0);
        }
        return Ok(dot(query_normalized, doc_normalized));
    }

    check_dims(query_normalized, doc_embedding)?;
    if query_norm == 0.0 {
        return Ok(0.0);
    }
    let norm = match doc_norm {
        Some(n) => n,
        None => l2_norm(doc_embedding),
    };
    if norm == 0.0 {
        return Ok(0.0);
    }
    Ok(dot(query_normalized, doc_embedding) / norm)
}

/// Plain cosine similarity of two raw vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, VectorMathError> {
    check_dims(a, b)?;
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot(a, b) / (norm_a * norm_b))
}

fn check_dims(a: &[f32], b: &[f32]) -> Result<(), VectorMathError> {
    if a.len() != b.len() {
        return Err(VectorMathError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}
