//! Caption signature handling

/// Build the caption sent with a post
///
/// The caption is trimmed, every occurrence of the signature is removed
/// (ASCII case-insensitive) and the signature is appended after a blank line.
/// An empty caption becomes the signature alone.
pub fn format_caption(caption: &str, signature: Option<&str>) -> String {
    let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
        return caption.trim().to_string();
    };

    let stripped = strip_ignore_ascii_case(caption, signature);
    let body = stripped.trim();

    if body.is_empty() {
        signature.to_string()
    } else {
        format!("{}\n\n{}", body, signature)
    }
}

fn strip_ignore_ascii_case(haystack: &str, needle: &str) -> String {
    let hay = haystack.as_bytes();
    let pat = needle.as_bytes();
    let mut out = Vec::with_capacity(hay.len());

    let mut i = 0;
    while i < hay.len() {
        if hay.len() - i >= pat.len() && hay[i..i + pat.len()].eq_ignore_ascii_case(pat) {
            i += pat.len();
        } else {
            out.push(hay[i]);
            i += 1;
        }
    }

    // Matches start on the first byte of a UTF-8 sequence, so the remaining
    // bytes stay valid.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}
