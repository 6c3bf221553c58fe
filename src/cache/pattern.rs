//! Glob Pattern Module
//!
//! Anchored glob matching for partition and key scans: `*` matches any run
//! (including none), `?` matches exactly one character, everything else
//! matches itself. UTF-8 input is matched by character; keys that are not
//! valid UTF-8 fall back to matching by byte.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    pattern: Vec<u8>,
    /// Character form of `pattern`, None when it is not valid UTF-8
    chars: Option<Vec<char>>,
}

impl GlobPattern {
    pub fn new(pattern: impl AsRef<[u8]>) -> Self {
        let pattern = pattern.as_ref().to_vec();
        let chars = std::str::from_utf8(&pattern)
            .ok()
            .map(|text| text.chars().collect());
        Self { pattern, chars }
    }

    /// Pattern matching everything.
    pub fn any() -> Self {
        Self::new("*")
    }

    /// Matches the whole of `input`.
    pub fn matches(&self, input: &[u8]) -> bool {
        match (&self.chars, std::str::from_utf8(input)) {
            (Some(pattern), Ok(text)) => {
                let text: Vec<char> = text.chars().collect();
                glob_match(pattern, &text, '*', '?')
            }
            _ => glob_match(&self.pattern, input, b'*', b'?'),
        }
    }
}

/// Greedy scan that remembers the last `star` and backtracks to it on a
/// mismatch, so it runs in O(pattern * input) worst case with no recursion.
fn glob_match<T: Copy + PartialEq>(pattern: &[T], input: &[T], star: T, one: T) -> bool {
    let (mut p, mut i) = (0, 0);
    let mut last_star: Option<(usize, usize)> = None;

    while i < input.len() {
        match pattern.get(p) {
            Some(&c) if c == star => {
                last_star = Some((p, i));
                p += 1;
            }
            Some(&c) if c == one || c == input[i] => {
                p += 1;
                i += 1;
            }
            _ => match last_star {
                Some((star_p, star_i)) => {
                    p = star_p + 1;
                    i = star_i + 1;
                    last_star = Some((star_p, star_i + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == star)
}

impl Default for GlobPattern {
    fn default() -> Self {
        Self::any()
    }
}
