//! Vector math for the knowledge index

/// Euclidean norm.
pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity `dot(a,b) / (|a| * |b|)`.
/// Returns `None` for mismatched dimensions or a zero-magnitude operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        tracing::warn!(
            "cosine_similarity dimension mismatch: a={}, b={}",
            a.len(),
            b.len()
        );
        return None;
    }
    let norm_a = magnitude(a);
    let norm_b = magnitude(b);
    cosine_with_norms(a, norm_a, b, norm_b)
}

/// Same as [`cosine_similarity`] with precomputed magnitudes.
pub fn cosine_with_norms(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> Option<f32> {
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    Some(dot / (norm_a * norm_b))
}
