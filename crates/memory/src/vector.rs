//! Similarity scoring.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity between embedding vectors
//! - Lexical containment scoring, used when embeddings are unavailable

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the lengths differ, either vector is empty, or either has
/// zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Score `text` against `query` without embeddings.
///
/// 1.0 when the whole query phrase occurs in the text; otherwise the
/// fraction of distinct query terms that occur. Case-insensitive.
pub fn lexical_score(query: &str, text: &str) -> f32 {
    let query = normalize_text(&query.to_lowercase());
    if query.is_empty() {
        return 0.0;
    }
    let text = normalize_text(&text.to_lowercase());
    if text.contains(&query) {
        return 1.0;
    }

    let mut terms: Vec<&str> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    terms.sort_unstable();
    terms.dedup();
    if terms.is_empty() {
        return 0.0;
    }
    let hits = terms.iter().filter(|t| text.contains(*t)).count();
    hits as f32 / terms.len() as f32
}

/// Trim and collapse runs of whitespace to one space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
