// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::iter::Peekable;
use std::str::Chars;

use regex::Regex;

/// Options applied during compilation of a glob into a matcher.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MatchOptions {
    /// When set, a leading `*` or `?` in a path segment does not match a leading dot, so
    /// hidden files must be named explicitly.
    pub require_literal_leading_dot: bool,
}

///
/// Expand brace alternation before any regex synthesis: `a/{b,c}.rs` becomes `a/b.rs` and
/// `a/c.rs`. Nesting is supported by re-expanding each rebuilt candidate, and `\{`, `\}` and
/// `\,` are literals. An unmatched `{` is treated as a literal brace.
///
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let chars: Vec<char> = pattern.chars().collect();

    let mut open = None;
    let mut escaped = false;
    for (i, c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if *c == '\\' {
            escaped = true;
        } else if *c == '{' {
            open = Some(i);
            break;
        }
    }
    let Some(open) = open else {
        return vec![pattern.to_string()];
    };

    // Scan for the matching close brace, remembering top-level comma positions.
    let mut depth = 1_usize;
    let mut close = None;
    let mut commas = Vec::new();
    let mut escaped = false;
    for (i, c) in chars.iter().enumerate().skip(open + 1) {
        if escaped {
            escaped = false;
            continue;
        }
        match *c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            ',' if depth == 1 => commas.push(i),
            _ => {}
        }
    }
    let Some(close) = close else {
        return vec![pattern.to_string()];
    };

    let prefix: String = chars[..open].iter().collect();
    let suffix: String = chars[close + 1..].iter().collect();
    let mut alternatives = Vec::new();
    let mut start = open + 1;
    for comma in commas {
        alternatives.push(chars[start..comma].iter().collect::<String>());
        start = comma + 1;
    }
    alternatives.push(chars[start..close].iter().collect::<String>());

    let mut out = Vec::new();
    for alternative in alternatives {
        let rebuilt = format!("{prefix}{alternative}{suffix}");
        out.extend(expand_braces(&rebuilt));
    }
    out
}

enum Segment {
    /// A `**` occupying a whole segment: zero or more path segments.
    DoubleStar,
    Single {
        regex: Regex,
        /// Set when the segment contains no wildcards; holds the unescaped name.
        literal: Option<String>,
    },
}

struct Alternative {
    regex: Regex,
    segments: Vec<Segment>,
}

///
/// One glob pattern, compiled to anchored regular expressions over `/`-separated relative
/// paths.
///
/// `*` and `?` never cross a separator. `**` matches zero or more whole segments when it is
/// bounded by separators or the ends of the pattern; embedded in a segment it degrades to two
/// single-segment stars. Character classes, escapes and (already-expanded) brace alternation
/// compile per segment.
///
pub struct PathGlob {
    source: String,
    alternatives: Vec<Alternative>,
}

impl PathGlob {
    pub fn parse(source: &str, options: &MatchOptions) -> Result<PathGlob, String> {
        let mut alternatives = Vec::new();
        for expanded in expand_braces(source) {
            let segments = Self::parse_segments(&expanded, options)?;
            if segments.is_empty() {
                return Err(format!("Pattern {source:?} has no path segments"));
            }
            let regex_src = Self::assemble(&segments, options);
            let regex = Regex::new(&regex_src)
                .map_err(|e| format!("Could not compile {source:?} as a pattern: {e}"))?;
            alternatives.push(Alternative { regex, segments });
        }
        Ok(PathGlob {
            source: source.to_string(),
            alternatives,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Matches a canonical relative path (no leading separator) against the whole pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.alternatives.iter().any(|a| a.regex.is_match(path))
    }

    /// True if some path beneath a directory with the given segments could match. Used for
    /// traversal pruning, so it must err on the side of `true`.
    pub fn could_match_under(&self, dir_segments: &[&str]) -> bool {
        self.alternatives
            .iter()
            .any(|a| could_extend(&a.segments, dir_segments))
    }

    /// The longest leading run of wildcard-free segments, as the prefix index keys directories.
    pub fn static_prefix_segments(&self) -> Vec<Vec<&str>> {
        self.alternatives
            .iter()
            .map(|a| {
                a.segments
                    .iter()
                    .map_while(|s| match s {
                        Segment::Single {
                            literal: Some(name),
                            ..
                        } => Some(name.as_str()),
                        _ => None,
                    })
                    .collect()
            })
            .collect()
    }

    /// True if any alternative contains a whole-segment `**`.
    pub fn has_double_star(&self) -> bool {
        self.alternatives
            .iter()
            .any(|a| a.segments.iter().any(|s| matches!(s, Segment::DoubleStar)))
    }

    fn parse_segments(expanded: &str, options: &MatchOptions) -> Result<Vec<Segment>, String> {
        let mut segments = Vec::new();
        let mut prev_was_doublestar = false;
        for raw in expanded.split('/') {
            // Drop empty components (leading or doubled separators) and `.`.
            if raw.is_empty() || raw == "." {
                continue;
            }
            if raw == "**" {
                // Consecutive doublestars collapse to one.
                if !prev_was_doublestar {
                    segments.push(Segment::DoubleStar);
                }
                prev_was_doublestar = true;
                continue;
            }
            prev_was_doublestar = false;
            let snippet = segment_to_regex(raw, options)?;
            let regex = Regex::new(&format!("^{snippet}$"))
                .map_err(|e| format!("Could not compile segment {raw:?}: {e}"))?;
            segments.push(Segment::Single {
                regex,
                literal: literal_segment(raw),
            });
        }
        Ok(segments)
    }

    fn assemble(segments: &[Segment], options: &MatchOptions) -> String {
        let dot = options.require_literal_leading_dot;
        let mut out = String::from("^");
        let mut need_separator = false;
        let last = segments.len() - 1;
        for (idx, segment) in segments.iter().enumerate() {
            match segment {
                Segment::DoubleStar if idx == last => {
                    if need_separator {
                        // Trailing `a/**`: `a` itself, or anything below it.
                        if dot {
                            out.push_str(r"(?:/[^/.][^/]*)*");
                        } else {
                            out.push_str("(?:/.*)?");
                        }
                    } else if dot {
                        out.push_str(r"(?:[^/.][^/]*(?:/[^/.][^/]*)*)?");
                    } else {
                        out.push_str(".*");
                    }
                    need_separator = false;
                }
                Segment::DoubleStar => {
                    if need_separator {
                        out.push('/');
                    }
                    if dot {
                        out.push_str(r"(?:[^/.][^/]*/)*");
                    } else {
                        out.push_str("(?:[^/]+/)*");
                    }
                    need_separator = false;
                }
                Segment::Single { regex, .. } => {
                    if need_separator {
                        out.push('/');
                    }
                    // The per-segment regex is anchored; strip `^`/`$` for inlining.
                    let src = regex.as_str();
                    out.push_str(&src[1..src.len() - 1]);
                    need_separator = true;
                }
            }
        }
        out.push('$');
        out
    }
}

fn could_extend(segments: &[Segment], dir: &[&str]) -> bool {
    let Some(first) = segments.first() else {
        // Pattern exhausted above the directory: nothing below can match.
        return false;
    };
    match first {
        Segment::DoubleStar => true,
        Segment::Single { regex, .. } => match dir.first() {
            // Directory exhausted: the remaining pattern can extend below it.
            None => true,
            Some(name) => regex.is_match(name) && could_extend(&segments[1..], &dir[1..]),
        },
    }
}

/// Returns the unescaped name if the segment holds no wildcard metacharacters.
fn literal_segment(segment: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' | '?' | '[' => return None,
            '\\' => out.push(chars.next()?),
            c => out.push(c),
        }
    }
    Some(out)
}

fn segment_to_regex(segment: &str, options: &MatchOptions) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = segment.chars().peekable();
    let mut first = true;
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                // `**` not bounded by separators behaves as two single stars, which collapse.
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                if first && options.require_literal_leading_dot {
                    out.push_str(r"(?:[^/.][^/]*)?");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => {
                if first && options.require_literal_leading_dot {
                    out.push_str("[^/.]");
                } else {
                    out.push_str("[^/]");
                }
            }
            '[' => out.push_str(&char_class(&mut chars, segment)?),
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| format!("Trailing escape in pattern segment {segment:?}"))?;
                out.push_str(&regex::escape(&escaped.to_string()));
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        first = false;
    }
    Ok(out)
}

fn char_class(chars: &mut Peekable<Chars>, segment: &str) -> Result<String, String> {
    let mut out = String::from("[");
    if let Some(&next) = chars.peek() {
        if next == '!' || next == '^' {
            chars.next();
            out.push('^');
        }
    }
    let mut first = true;
    loop {
        let Some(c) = chars.next() else {
            return Err(format!("Unterminated character class in {segment:?}"));
        };
        match c {
            ']' if !first => break,
            '\\' => {
                let escaped = chars.next().ok_or_else(|| {
                    format!("Trailing escape in character class in {segment:?}")
                })?;
                push_class_char(&mut out, escaped);
            }
            c => push_class_char(&mut out, c),
        }
        first = false;
    }
    out.push(']');
    Ok(out)
}

fn push_class_char(out: &mut String, c: char) {
    // `-` passes through so ranges keep working; everything with meaning inside a regex
    // class is escaped.
    if matches!(c, '\\' | '^' | ']' | '[' | '&' | '~') {
        out.push('\\');
    }
    out.push(c);
}

#[cfg(test)]
mod inline_tests {
    use super::expand_braces;

    #[test]
    fn nested_braces_expand_recursively() {
        assert_eq!(
            expand_braces("a/{b,c{d,e}}.rs"),
            vec!["a/b.rs", "a/cd.rs", "a/ce.rs"]
        );
    }
}
