//! Field-path filter
//!
//! Removes fields from an object tree before it is serialized to YAML.
//! A path is a chain of segments:
//!
//! - `ident` or `.ident` selects a map key made of plain characters
//! - `[key]`, `["key"]` or `['key']` selects a key that may contain `.`, `:`,
//!   `/` or `*`
//!
//! A `*` inside a bracket is a glob over the keys at that level (`[*]` matches
//! every key). On a sequence, `[*]` matches every element and `[n]` matches
//! element `n`.
//!
//! ```text
//! metadata.managedFields
//! .metadata.annotations[kubectl.kubernetes.io/last-applied-configuration]
//! metadata.labels[app.kubernetes.io/*]
//! spec.template.spec.containers[*].image
//! ```
//!
//! Missing intermediate keys end the walk silently; only the leaf is removed.

use serde_json::Value;
use thiserror::Error;

/// Path parse failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    /// The path is empty
    #[error("empty field path")]
    Empty,
    /// A `[` has no matching `]`
    #[error("unclosed bracket in field path '{0}'")]
    UnclosedBracket(String),
    /// A quoted bracket key has no closing quote
    #[error("unterminated quote in field path '{0}'")]
    UnterminatedQuote(String),
    /// Two dots in a row, or a dot at the end
    #[error("empty segment in field path '{0}'")]
    EmptySegment(String),
}

/// One step of a parsed path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Literal map key
    Key(String),
    /// Bracketed key containing `*`
    Glob(String),
}

impl Segment {
    fn matches_key(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Glob(pattern) => glob_match(pattern, key),
        }
    }

    fn matches_index(&self, index: usize) -> bool {
        match self {
            Self::Key(k) => k.parse::<usize>().is_ok_and(|i| i == index),
            Self::Glob(pattern) => pattern == "*",
        }
    }
}

/// A parsed field path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a path expression
    pub fn parse(path: &str) -> Result<Self, FilterError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(FilterError::Empty);
        }

        let mut segments = Vec::new();
        let mut chars = trimmed.chars().peekable();
        let mut current = String::new();
        let mut after_bracket = false;
        // A leading dot is optional
        if chars.peek() == Some(&'.') {
            chars.next();
        }

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if current.is_empty() && !after_bracket {
                        return Err(FilterError::EmptySegment(path.to_string()));
                    }
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    after_bracket = false;
                    if chars.peek().is_none() {
                        return Err(FilterError::EmptySegment(path.to_string()));
                    }
                }
                '[' => {
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    let key = read_bracket(&mut chars, path)?;
                    segments.push(if key.contains('*') {
                        Segment::Glob(key)
                    } else {
                        Segment::Key(key)
                    });
                    after_bracket = true;
                }
                _ => {
                    current.push(c);
                    after_bracket = false;
                }
            }
        }
        if !current.is_empty() {
            segments.push(Segment::Key(current));
        }
        if segments.is_empty() {
            return Err(FilterError::Empty);
        }
        Ok(Self { segments })
    }

    /// The parsed segments
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Remove every value this path designates from `tree`
    pub fn remove_from(&self, tree: &mut Value) {
        remove_at(tree, &self.segments);
    }
}

fn read_bracket(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    path: &str,
) -> Result<String, FilterError> {
    let quote = match chars.peek() {
        Some(&q) if q == '"' || q == '\'' => {
            chars.next();
            Some(q)
        }
        _ => None,
    };

    let mut key = String::new();
    loop {
        match (chars.next(), quote) {
            (None, Some(_)) => return Err(FilterError::UnterminatedQuote(path.to_string())),
            (None, None) => return Err(FilterError::UnclosedBracket(path.to_string())),
            (Some(c), Some(q)) if c == q => {
                return match chars.next() {
                    Some(']') => Ok(key),
                    _ => Err(FilterError::UnclosedBracket(path.to_string())),
                };
            }
            (Some(']'), None) => return Ok(key),
            (Some(c), _) => key.push(c),
        }
    }
}

fn remove_at(node: &mut Value, segments: &[Segment]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    match node {
        Value::Object(map) => {
            if rest.is_empty() {
                map.retain(|k, _| !head.matches_key(k));
                return;
            }
            for (key, child) in map.iter_mut() {
                if head.matches_key(key) {
                    remove_at(child, rest);
                }
            }
        }
        Value::Array(items) => {
            if rest.is_empty() {
                let mut index = 0;
                items.retain(|_| {
                    let keep = !head.matches_index(index);
                    index += 1;
                    keep
                });
                return;
            }
            for (index, child) in items.iter_mut().enumerate() {
                if head.matches_index(index) {
                    remove_at(child, rest);
                }
            }
        }
        _ => {}
    }
}

/// Glob match where `*` matches any run of characters (including `/` and `.`)
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] != '*' && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Remove every path in `paths` from `tree`.
///
/// Paths that fail to parse are returned so the caller can report them; the
/// remaining paths are still applied.
pub fn remove_fields<S: AsRef<str>>(tree: &mut Value, paths: &[S]) -> Vec<FilterError> {
    let mut errors = Vec::new();
    for path in paths {
        match FieldPath::parse(path.as_ref()) {
            Ok(p) => p.remove_from(tree),
            Err(e) => errors.push(e),
        }
    }
    errors
}

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '-')
}

/// Check a path against the syntax accepted in `excludedFields`:
/// `^([A-Za-z0-9_./:-]*(\[[A-Za-z0-9_*./:-]*\])?)*$`
pub fn is_valid_excluded_field(path: &str) -> bool {
    let mut in_bracket = false;
    for c in path.chars() {
        match (in_bracket, c) {
            (false, '[') => in_bracket = true,
            (true, ']') => in_bracket = false,
            (false, c) if is_plain(c) => {}
            (true, c) if is_plain(c) || c == '*' => {}
            _ => return false,
        }
    }
    !in_bracket
}
