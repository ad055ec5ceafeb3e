//! Glob-style key patterns used by `find_keys` and `find_and_get`.
//!
//! Supported syntax, matched against the key with its namespace prefix removed:
//!
//! - `?` matches exactly one character. `?at` matches `Cat`, `cat`, `Bat` or `bat`.
//! - `*` matches any run of characters, including none. `*Law*` matches `Law`,
//!   `GrokLaw` or `Lawyer`.
//! - `[abc]` matches one character listed in the brackets. `[CB]at` matches `Cat`
//!   or `Bat`.
//! - `[a-z]` matches one character in the inclusive range. `Letter[0-9]` matches
//!   `Letter0` up to `Letter9`. A reversed range such as `[z-a]` is the same as `[a-z]`.
//! - `[^abc]` matches one character not listed. `h[^e]llo` matches `hallo` and
//!   `hillo` but not `hello`.
//! - `\` makes the next character literal, both outside and inside brackets.
//!   `\*` matches a literal `*`. A trailing lone `\` matches a literal backslash.
//!
//! `[]` is an empty class and matches nothing. A `[` with no closing `]` is an
//! invalid pattern. Matching is case-sensitive and works on Unicode scalar values.
//!
//! Patterns are translated once into an anchored [`regex::Regex`].

use std::fmt::Write as _;

use regex::Regex;

use crate::error::{SdlError, SdlResult};

/// Regex class that matches no character at all.
const EMPTY_CLASS: &str = r"[^\x{0}-\x{10FFFF}]";

/// A compiled glob pattern.
#[derive(Clone, Debug)]
pub struct Pattern {
    regex: Regex,
    everything: bool,
}

impl Pattern {
    /// Compiles a pattern, failing with `InvalidArgument` on an unterminated class.
    pub fn new(pattern: &str) -> SdlResult<Self> {
        let chars: Vec<char> = pattern.chars().collect();
        let mut re = String::from(r"\A(?s:");
        let mut everything = !chars.is_empty();
        let mut last_was_star = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c != '*' {
                everything = false;
            }
            match c {
                '?' => {
                    re.push('.');
                    i += 1;
                }
                '*' => {
                    if !last_was_star {
                        re.push_str(".*");
                    }
                    i += 1;
                }
                '\\' => {
                    let literal = chars.get(i + 1).copied().unwrap_or('\\');
                    re.push_str(&regex::escape(literal.encode_utf8(&mut [0; 4])));
                    i += 2;
                }
                '[' => i = Self::translate_class(&chars, i + 1, pattern, &mut re)?,
                c => {
                    re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
                    i += 1;
                }
            }
            last_was_star = c == '*';
        }
        re.push_str(r")\z");

        let regex = Regex::new(&re).map_err(|e| {
            SdlError::invalid(format!("pattern {:?} cannot be compiled: {}", pattern, e))
        })?;
        Ok(Self { regex, everything })
    }

    /// Translates a bracket class starting just after `[` and returns the index
    /// following the closing `]`.
    fn translate_class(
        chars: &[char],
        start: usize,
        pattern: &str,
        re: &mut String,
    ) -> SdlResult<usize> {
        let mut i = start;
        let negated = chars.get(i) == Some(&'^');
        if negated {
            i += 1;
        }

        // Every member is written as `\x{..}` so no character needs class escaping
        let mut members = String::new();
        loop {
            let c = match chars.get(i) {
                Some(&']') => break,
                Some(&'\\') => match chars.get(i + 1) {
                    Some(&escaped) => {
                        i += 1;
                        escaped
                    }
                    None => return Err(Self::unterminated(pattern)),
                },
                Some(&c) => c,
                None => return Err(Self::unterminated(pattern)),
            };

            // `x-y` forms a range unless the dash is followed by the closing bracket
            let is_range = chars.get(i + 1) == Some(&'-')
                && matches!(chars.get(i + 2), Some(&e) if e != ']');
            if is_range {
                let (end, consumed) = match chars[i + 2] {
                    '\\' => match chars.get(i + 3) {
                        Some(&escaped) => (escaped, 4),
                        None => return Err(Self::unterminated(pattern)),
                    },
                    end => (end, 3),
                };
                let (lo, hi) = if c <= end { (c, end) } else { (end, c) };
                let _ = write!(members, r"\x{{{:X}}}-\x{{{:X}}}", lo as u32, hi as u32);
                i += consumed;
            } else {
                let _ = write!(members, r"\x{{{:X}}}", c as u32);
                i += 1;
            }
        }

        match (members.is_empty(), negated) {
            (true, false) => re.push_str(EMPTY_CLASS),
            (true, true) => re.push('.'),
            (false, false) => {
                let _ = write!(re, "[{}]", members);
            }
            (false, true) => {
                let _ = write!(re, "[^{}]", members);
            }
        }
        Ok(i + 1)
    }

    fn unterminated(pattern: &str) -> SdlError {
        SdlError::invalid(format!(
            "unterminated character class in pattern {:?}",
            pattern
        ))
    }

    /// Tests whether `text` matches the whole pattern.
    pub fn matches(&self, text: &str) -> bool {
        // A stars-only pattern skips the regex engine
        self.everything || self.regex.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, text: &str) -> bool {
        Pattern::new(pattern).unwrap().matches(text)
    }

    #[test]
    fn test_question_mark() {
        assert!(m("?at", "Cat"));
        assert!(m("?at", "bat"));
        assert!(!m("?at", "at"));
        assert!(!m("?at", "Chat"));
        assert!(m("a?b", "a\nb"));
    }

    #[test]
    fn test_star() {
        assert!(m("*Law*", "Law"));
        assert!(m("*Law*", "GrokLaw"));
        assert!(m("*Law*", "Lawyer"));
        assert!(!m("*Law*", "La"));
        assert!(m("*", ""));
        assert!(m("a*b*c", "aXXbYYc"));
        assert!(!m("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_whole_key_is_matched() {
        assert!(!m("ab", "xaby"));
        assert!(!m("a?", "abc"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(m("a.b", "a.b"));
        assert!(!m("a.b", "axb"));
        assert!(m("(x)+{2}|$", "(x)+{2}|$"));
        assert!(m("[.]", "."));
        assert!(!m("[.]", "x"));
    }

    #[test]
    fn test_class() {
        assert!(m("[CB]at", "Cat"));
        assert!(m("[CB]at", "Bat"));
        assert!(!m("[CB]at", "cat"));
        assert!(m("Letter[0-9]", "Letter0"));
        assert!(m("Letter[0-9]", "Letter9"));
        assert!(!m("Letter[0-9]", "LetterA"));
        assert!(m("[z-a]", "m"));
    }

    #[test]
    fn test_negated_class() {
        assert!(m("h[^e]llo", "hallo"));
        assert!(m("h[^e]llo", "hillo"));
        assert!(!m("h[^e]llo", "hello"));
        assert!(m("[^]", "x"));
    }

    #[test]
    fn test_escapes() {
        assert!(m("a\\*", "a*"));
        assert!(!m("a\\*", "ab"));
        assert!(m("\\?", "?"));
        assert!(m("[\\]]", "]"));
        assert!(m("[a\\-z]", "-"));
        assert!(!m("[a\\-z]", "m"));
        assert!(m("end\\", "end\\"));
    }

    #[test]
    fn test_dash_edges() {
        assert!(m("[a-]", "-"));
        assert!(m("[a-]", "a"));
        assert!(m("[-a]", "-"));
    }

    #[test]
    fn test_empty_class_matches_nothing() {
        assert!(!m("[]", "a"));
        assert!(!m("[]", ""));
    }

    #[test]
    fn test_unterminated_class_is_invalid() {
        let err = Pattern::new("abc[de").unwrap_err();
        assert!(err.is_caller_error());
        assert!(Pattern::new("[a-\\").is_err());
    }

    #[test]
    fn test_unicode() {
        assert!(m("k?y", "käy"));
        assert!(m("[α-ω]", "λ"));
    }

    #[test]
    fn test_stars_only_shortcut() {
        assert!(Pattern::new("*").unwrap().everything);
        assert!(Pattern::new("***").unwrap().everything);
        assert!(!Pattern::new("a*").unwrap().everything);
        assert!(!Pattern::new("").unwrap().everything);
        assert!(m("", ""));
        assert!(!m("", "a"));
    }
}
