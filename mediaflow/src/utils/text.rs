//! Bounded text helpers.

/// Returns at most the last `max_chars` characters of `s`.
///
/// External tools put the useful part of their diagnostics at the end, so
/// truncation keeps the tail. Always cuts on a char boundary.
#[must_use]
pub fn tail(s: &str, max_chars: usize) -> &str {
    let total = s.chars().count();
    if total <= max_chars {
        return s;
    }
    let skip = total - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Counts whitespace-separated words.
#[must_use]
pub fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_short_input_untouched() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("", 10), "");
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abcdef", 0), "");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let s = "ééééé";
        assert_eq!(tail(s, 2), "éé");
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("  hello   world\nagain\t"), 3);
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("   "), 0);
    }

}
