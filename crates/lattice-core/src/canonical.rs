//! Normalizes cell identifiers (and formula bodies) into a form the
//! formula parser can tokenize as plain identifiers, while preserving
//! numeric literals.
//!
//! The algorithm is intentionally dumb and total: case-fold to upper case,
//! hide a fixed set of punctuation characters behind a reversible sentinel,
//! then unhide the sentinel everywhere it sits between the digits of what
//! is clearly a numeric literal (`123.45`, `1.2E10`, ...). Applying it twice
//! reproduces the same output as applying it once, because the escape step
//! re-escapes the dots the restore step unhid, and the restore step unhides
//! them again identically.

/// Characters hidden behind a `_r$<codepoint>$r_` sentinel.
const PUNCTUATION: &[char] = &[
    '.', ',', ':', ';', '[', ']', '{', '}', '#', '?', '@', '\\', '~', '`', '"', '\'',
];

/// Sentinel emitted for a hidden `.`; precomputed since the numeric-literal
/// restore pass only ever needs to find this one.
const DOT_SENTINEL: &str = "_r$46$r_";

/// Canonicalize a cell identifier or formula body.
///
/// Total, deterministic, and idempotent: `canonicalize(canonicalize(s)) ==
/// canonicalize(s)` for every `s`.
pub fn canonicalize(input: &str) -> String {
    let escaped = escape_punctuation(&input.to_uppercase());
    restore_dots_in_numeric_literals(&escaped)
}

fn escape_punctuation(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if PUNCTUATION.contains(&c) {
            out.push_str("_r$");
            out.push_str(&(c as u32).to_string());
            out.push_str("$r_");
        } else {
            out.push(c);
        }
    }
    out
}

fn is_word_or_dollar(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Undo the dot-escape inside numeric literals: a digit run immediately
/// followed by the dot sentinel and then an `[0-9Ee]` run, the whole thing
/// bounded on each side by either a non-identifier character or the edge of
/// the string, gets its literal `.` back.
fn restore_dots_in_numeric_literals(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let sentinel: Vec<char> = DOT_SENTINEL.chars().collect();
    let slen = sentinel.len();

    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if i + slen <= chars.len() && chars[i..i + slen] == sentinel[..] {
            let mut back = i;
            while back > 0 && chars[back - 1].is_ascii_digit() {
                back -= 1;
            }
            let has_digits_before = back < i;
            let boundary_before_ok = back == 0 || !is_word_or_dollar(chars[back - 1]);

            if has_digits_before && boundary_before_ok {
                let mut fwd = i + slen;
                while fwd < chars.len()
                    && (chars[fwd].is_ascii_digit() || chars[fwd] == 'E' || chars[fwd] == 'e')
                {
                    fwd += 1;
                }
                let has_digits_after = fwd > i + slen;
                let boundary_after_ok = fwd == chars.len() || !is_word_or_dollar(chars[fwd]);

                if has_digits_after && boundary_after_ok {
                    out.push('.');
                    i += slen;
                    continue;
                }
            }
        }

        out.push(chars[i]);
        i += 1;
    }
    out
}
