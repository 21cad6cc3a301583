//! Key expressions: slash-delimited routing paths with `*` and `**` wildcards.
//!
//! `*` matches exactly one chunk and `**` matches zero or more chunks.
//! Wildcards must occupy a whole chunk.

/// Whether `key` is a well-formed key expression.
pub fn is_valid(key: &str) -> bool {
    !key.is_empty()
        && key.split('/').all(|chunk| {
            !chunk.is_empty()
                && !chunk.contains(['#', '?', '$'])
                && (chunk == "*" || chunk == "**" || !chunk.contains('*'))
        })
}

/// Whether the two expressions share at least one concrete key.
pub fn intersects(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split('/').collect();
    let b: Vec<&str> = b.split('/').collect();
    chunks_intersect(&a, &b)
}

fn chunks_intersect(a: &[&str], b: &[&str]) -> bool {
    match (a.split_first(), b.split_first()) {
        (None, None) => true,
        (Some((&"**", rest)), None) => chunks_intersect(rest, b),
        (None, Some((&"**", rest))) => chunks_intersect(a, rest),
        (None, _) | (_, None) => false,
        (Some((&"**", a_rest)), Some((_, b_rest))) => {
            chunks_intersect(a_rest, b) || chunks_intersect(a, b_rest)
        }
        (Some((_, a_rest)), Some((&"**", b_rest))) => {
            chunks_intersect(a, b_rest) || chunks_intersect(a_rest, b)
        }
        (Some((a_head, a_rest)), Some((b_head, b_rest))) => {
            (*a_head == "*" || *b_head == "*" || a_head == b_head)
                && chunks_intersect(a_rest, b_rest)
        }
    }
}
