//! URL-safe identifier normalisation for public maps.

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 50;

/// Normalise an arbitrary display name into a slug: lowercase, `[a-z0-9-]`
/// only, no runs of `-`, no leading/trailing `-`, length within [3, 50].
/// Empty input collapses to `"public-map"`; short results get a `map-`
/// prefix. Idempotent: `slugify(slugify(s)) == slugify(s)`.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true; // suppress a leading '-'
    for ch in input.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        return "public-map".to_string();
    }
    if out.len() < MIN_LEN {
        out = format!("map-{out}");
    }
    if out.len() > MAX_LEN {
        out.truncate(MAX_LEN);
        while out.ends_with('-') {
            out.pop();
        }
    }
    out
}

/// Whether a caller-supplied slug is already in canonical form.
pub fn is_canonical(slug: &str) -> bool {
    slugify(slug) == slug
}
