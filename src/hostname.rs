//! Hostname normalization
//!
//! Every registry lookup and every on-disk artifact is keyed by the
//! normalized form of a hostname, so the rules here decide which requests
//! share a host.

/// Characters that survive normalization unchanged
fn is_legal(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-'
}

/// Strip a trailing `:port` from a host value.
///
/// Only the text after the *last* colon is considered, and only when it is
/// entirely ASCII digits. Anything else (no colon, an empty suffix, a
/// non-numeric suffix such as `example.com:abc`, or a bare bracketed IPv6
/// literal like `[::1]`) is returned unchanged.
pub fn strip_port(raw: &str) -> &str {
    match raw.rfind(':') {
        Some(idx) => {
            let suffix = &raw[idx + 1..];
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                &raw[..idx]
            } else {
                raw
            }
        }
        None => raw,
    }
}

/// Normalize a raw host value into a registry-safe host name.
///
/// The port is stripped, the remainder lowercased, and every character
/// outside `[a-z0-9._-]` is replaced by `_<ordinal>_` where `<ordinal>` is the
/// decimal Unicode scalar value. A name made only of dots has every dot
/// escaped as well. The output only contains legal characters and is never
/// all dots, so normalizing twice yields the same string.
pub fn normalize(raw: &str) -> String {
    let host = strip_port(raw.trim());
    let mut out = String::with_capacity(host.len());

    for c in host.chars().flat_map(char::to_lowercase) {
        if is_legal(c) {
            out.push(c);
        } else {
            push_escaped(&mut out, c);
        }
    }

    // `.` and `..` would name the parent directories of a host's artifacts
    if !out.is_empty() && out.bytes().all(|b| b == b'.') {
        let dots = out.len();
        out.clear();
        for _ in 0..dots {
            push_escaped(&mut out, '.');
        }
    }

    out
}

fn push_escaped(out: &mut String, c: char) {
    out.push('_');
    out.push_str(&u32::from(c).to_string());
    out.push('_');
}

/// Reverse the escape step of [`normalize`] for display purposes.
///
/// Sequences that do not decode to a valid escape (for example an
/// underscore that was already present in the input) are kept verbatim.
pub fn denormalize(normalized: &str) -> String {
    let mut out = String::with_capacity(normalized.len());
    let mut rest = normalized;

    while let Some(start) = rest.find('_') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let decoded = after.find('_').and_then(|end| {
            let digits = &after[..end];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let c = digits.parse::<u32>().ok().and_then(char::from_u32)?;
            // Legal characters are never escaped, so they cannot be tokens
            if is_legal(c) {
                return None;
            }
            Some((c, end))
        });

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &after[end + 1..];
            }
            None => {
                out.push('_');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
