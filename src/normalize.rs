//! Whitespace-tolerant text location.
//!
//! Exact search is always tried first. The fuzzy path collapses every run of
//! whitespace to a single space so text reflowed by a formatter can still be found.
//!
//! A fuzzy match starts at a non-whitespace character, not at the start of its
//! line. A target in the middle of a line therefore leaves the text before it on
//! that line untouched, and a region never begins inside leading indentation.

/// Collapses every whitespace run to one space and trims both ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Byte offset of the first exact occurrence. An empty target never matches.
pub fn find_exact(content: &str, target: &str) -> Option<usize> {
    if target.is_empty() {
        return None;
    }
    content.find(target)
}

/// Locates `target` in `content` ignoring whitespace-run differences.
///
/// Lines are scanned in order and the first position whose collapsed text starts
/// with the normalized target wins. Returns the byte range of the matched region;
/// the end also swallows trailing non-newline whitespace.
pub fn find_fuzzy(content: &str, target: &str) -> Option<(usize, usize)> {
    let wanted = normalize_whitespace(target);
    if wanted.is_empty() {
        return None;
    }
    if !normalize_whitespace(content).contains(&wanted) {
        return None;
    }

    let mut line_start = 0usize;
    for line in content.split('\n') {
        for (offset, ch) in line.char_indices() {
            if ch.is_whitespace() {
                continue;
            }
            let start = line_start + offset;
            if let Some(end) = collapsed_match_end(content, start, &wanted) {
                return Some((start, skip_trailing_inline_whitespace(content, end)));
            }
        }
        line_start += line.len() + 1;
    }

    None
}

/// Walks `content` from `start`, consuming the normalized target one character at a
/// time. A whitespace run in the content stands for exactly one normalized space and
/// only ever matches a space in the target.
fn collapsed_match_end(content: &str, start: usize, wanted: &str) -> Option<usize> {
    let mut expected = wanted.chars().peekable();
    let mut in_run = false;

    for (offset, ch) in content[start..].char_indices() {
        let Some(&next) = expected.peek() else {
            return Some(start + offset);
        };
        if ch.is_whitespace() {
            if in_run {
                continue;
            }
            in_run = true;
            if next != ' ' {
                return None;
            }
            expected.next();
            continue;
        }
        in_run = false;
        if ch != next {
            return None;
        }
        expected.next();
    }

    expected.peek().is_none().then_some(content.len())
}

fn skip_trailing_inline_whitespace(content: &str, mut end: usize) -> usize {
    for ch in content[end..].chars() {
        if !ch.is_whitespace() || ch == '\n' {
            break;
        }
        end += ch.len_utf8();
    }
    end
}
