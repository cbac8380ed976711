/// Shell-style pattern matching over whole strings.
///
/// Supported metacharacters are `?`, `*`, `[...]` and `\`. Character classes
/// are complemented by a leading `!` (not `^`), may contain `a-b` ranges and
/// may start with a literal `]`. An opening bracket without a matching close
/// is matched literally. `*` matches any run of characters including `/` --
/// the matcher has no notion of path separators, callers encode path
/// semantics in the candidate string.
///
/// Non-recursive, single pass with one level of backtracking; run time is at
/// most `pattern.len() * candidate.len()`. The worst case is something like
/// `glob_match("*aaaaa", "aaaaaaaaaa")` which re-scans the pattern tail once
/// per candidate position.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pat = pattern.as_bytes();
    let cand = candidate.as_bytes();
    let mut p = 0;
    let mut c = 0;
    // most recent `*`: pattern position after it and the candidate position
    // where its current (shortest-first) expansion ends
    let mut back: Option<(usize, usize)> = None;
    loop {
        let mut matched = false;
        if p == pat.len() {
            if c == cand.len() {
                return true;
            }
        } else {
            match pat[p] {
                b'?' => {
                    // any single character
                    if c < cand.len() {
                        p += 1;
                        c += 1;
                        matched = true;
                    }
                }
                b'*' => {
                    if p + 1 == pat.len() {
                        // trailing `*` swallows the rest
                        return true;
                    }
                    back = Some((p + 1, c));
                    p += 1;
                    matched = true;
                }
                b'[' => match class_match(pat, p + 1, cand.get(c).copied()) {
                    Some((hit, next_p)) => {
                        if hit && c < cand.len() {
                            p = next_p;
                            c += 1;
                            matched = true;
                        }
                    }
                    // unterminated class, `[` is a literal
                    None => {
                        if c < cand.len() && cand[c] == b'[' {
                            p += 1;
                            c += 1;
                            matched = true;
                        }
                    }
                },
                b'\\' if p + 1 < pat.len() => {
                    if c < cand.len() && cand[c] == pat[p + 1] {
                        p += 2;
                        c += 1;
                        matched = true;
                    }
                }
                literal => {
                    if c < cand.len() && cand[c] == literal {
                        p += 1;
                        c += 1;
                        matched = true;
                    }
                }
            }
        }
        if matched {
            continue;
        }
        // mismatch, retry from the last `*` one candidate character later
        match back {
            Some((back_p, back_c)) if back_c < cand.len() => {
                back = Some((back_p, back_c + 1));
                p = back_p;
                c = back_c + 1;
            }
            _ => return false,
        }
    }
}

/// Matches a character class starting just past the `[`. Returns the match
/// result and the pattern index past the closing `]`, or `None` when the
/// class is unterminated and the caller must treat `[` as a literal.
fn class_match(pat: &[u8], start: usize, candidate: Option<u8>) -> Option<(bool, usize)> {
    let mut i = start;
    let inverted = pat.get(i) == Some(&b'!');
    if inverted {
        i += 1;
    }
    let mut matched = false;
    // each span is a single character or an `a-b` range; the first span may
    // begin with a literal `]`
    let mut a = *pat.get(i)?;
    i += 1;
    loop {
        let mut b = a;
        if pat.get(i) == Some(&b'-') && pat.get(i + 1).is_some_and(|&next| next != b']') {
            b = *pat.get(i + 1)?;
            i += 2;
        }
        if let Some(c) = candidate {
            if a <= c && c <= b {
                matched = true;
            }
        }
        a = *pat.get(i)?;
        i += 1;
        if a == b']' {
            break;
        }
    }
    Some((matched != inverted, i))
}

/// Exclusion patterns applied to walked entries.
///
/// Patterns match the full relative path of an entry; directories are
/// matched with a trailing `/` appended so patterns like `build/` prune
/// directories without touching files of the same name.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<String>,
}

impl IgnoreSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether an entry at `rel_path` is excluded. `is_dir` appends the
    /// trailing `/` before matching.
    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        if is_dir {
            let candidate = format!("{rel_path}/");
            self.patterns.iter().any(|p| glob_match(p, &candidate))
        } else {
            self.patterns.iter().any(|p| glob_match(p, rel_path))
        }
    }
}

/// Inclusion patterns for the selection-list walk variant.
#[derive(Debug, Clone, Default)]
pub struct PatternList {
    patterns: Vec<String>,
}

impl PatternList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        self.patterns.iter().any(|p| glob_match(p, rel_path))
    }
}
