// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Structural pattern compiler.
//!
//! Turns a hole pattern such as `foo(:[args])` into a regular expression that
//! over-approximates its matches, so a trigram index can narrow down the files
//! worth handing to the structural matcher.

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};

use crate::error::SearchError;

/// Connector used when pieces may be separated by anything, newlines included.
const ANYTHING: &str = r"(.|\s)*?";

static HOLE_REGEXP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)?~(?s)(.*)$").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// A segment of a structural pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Text outside of any hole, unescaped.
    Literal(String),
    /// The regular expression of a `:[name~regex]` hole, verbatim.
    Regexp(String),
}

/// Split a structural pattern into literal runs and regex holes.
///
/// `open` counts `:[` nesting; `inside` counts brackets that belong to a
/// regex within a hole (`:[x~[a-z]+]`). Holes without a regex produce no term.
/// An unterminated hole is emitted as literal text.
pub fn template_to_terms(pattern: &str) -> Vec<Term> {
    let mut open = 0usize;
    let mut inside = 0usize;
    let mut literal = String::new();
    let mut hole = String::new();
    let mut terms = Vec::new();

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek() == Some(&'[') => {
                chars.next();
                if open > 0 {
                    hole.push_str(":[");
                } else {
                    flush_literal(&mut literal, &mut terms);
                }
                open += 1;
            }
            '\\' if open > 0 => {
                hole.push('\\');
                if let Some(escaped) = chars.next() {
                    hole.push(escaped);
                }
            }
            '[' if open > 0 => {
                inside += 1;
                hole.push('[');
            }
            ']' if open > 0 && inside > 0 => {
                inside -= 1;
                hole.push(']');
            }
            ']' if open > 0 => {
                open -= 1;
                if open > 0 {
                    hole.push(']');
                    continue;
                }
                if let Some(caps) = HOLE_REGEXP.captures(&hole) {
                    if let Some(re) = caps.get(2) {
                        terms.push(Term::Regexp(re.as_str().to_string()));
                    }
                }
                hole.clear();
            }
            _ if open > 0 => hole.push(c),
            _ => literal.push(c),
        }
    }

    if open > 0 {
        literal.push_str(":[");
        literal.push_str(&hole);
    }
    flush_literal(&mut literal, &mut terms);
    terms
}

fn flush_literal(literal: &mut String, terms: &mut Vec<Term>) {
    if !literal.is_empty() {
        terms.push(Term::Literal(std::mem::take(literal)));
    }
}

/// Approximate regular expression for a structural pattern.
///
/// With `short_circuit` the pieces are joined by `.*?`, which does not cross
/// newlines: cheaper, but may miss matches that span lines.
pub fn structural_pat_to_regexp(pattern: &str, short_circuit: bool) -> String {
    let pieces: Vec<String> = template_to_terms(pattern)
        .into_iter()
        .filter_map(|term| match term {
            Term::Literal(lit) if lit.is_empty() => None,
            Term::Literal(lit) => {
                let quoted = regex::escape(&lit);
                Some(
                    WHITESPACE
                        .replace_all(&quoted, NoExpand(r"[\s]+"))
                        .into_owned(),
                )
            }
            Term::Regexp(re) if re.is_empty() => None,
            Term::Regexp(re) => Some(re),
        })
        .collect();

    if pieces.is_empty() {
        return ANYTHING.to_string();
    }
    let sep = if short_circuit {
        ").*?(".to_string()
    } else {
        format!("){}(", ANYTHING)
    };
    format!("({})", pieces.join(&sep))
}

/// Check `re` against the dialect the index engine accepts.
pub fn validate_regexp(re: &str) -> Result<(), SearchError> {
    regex_syntax::ParserBuilder::new()
        .unicode(true)
        .build()
        .parse(re)
        .map(|_| ())
        .map_err(|e| SearchError::invalid_pattern(re, e))
}

/// Compile and validate a structural pattern.
pub fn compile_structural_pattern(pattern: &str, short_circuit: bool) -> Result<String, SearchError> {
    let re = structural_pat_to_regexp(pattern, short_circuit);
    validate_regexp(&re)?;
    Ok(re)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_only_pattern_is_escaped() {
        assert_eq!(structural_pat_to_regexp("a.b", false), r"(a\.b)");
        assert_eq!(
            structural_pat_to_regexp("if  err\n\t!= nil", true),
            r"(if[\s]+err[\s]+!=[\s]+nil)"
        );
    }

    #[test]
    fn single_hole_matches_anything() {
        for p in [":[x]", ":[[x]]", ":[x.]", ":[x\\n]", ":[ x]", ""] {
            assert_eq!(structural_pat_to_regexp(p, false), r"(.|\s)*?", "{p:?}");
            assert_eq!(structural_pat_to_regexp(p, true), r"(.|\s)*?", "{p:?}");
        }
    }

    #[test]
    fn compilation_is_deterministic() {
        let p = "foo(:[a], :[b~\\d+]) { :[body] }";
        for sc in [true, false] {
            assert_eq!(
                structural_pat_to_regexp(p, sc),
                structural_pat_to_regexp(p, sc)
            );
        }
    }

    #[test]
    fn parse_int_example() {
        let re = compile_structural_pattern("ParseInt(:[args]) if err != nil", false).unwrap();
        assert_eq!(
            re,
            r"(ParseInt\()(.|\s)*?(\)[\s]+if[\s]+err[\s]+!=[\s]+nil)"
        );
        let re = compile_structural_pattern("ParseInt(:[args]) if err != nil", true).unwrap();
        assert_eq!(re, r"(ParseInt\().*?(\)[\s]+if[\s]+err[\s]+!=[\s]+nil)");
    }

    #[test]
    fn regex_holes_are_extracted_verbatim() {
        assert_eq!(
            template_to_terms("x :[n~[a-z]+] y"),
            vec![
                Term::Literal("x ".into()),
                Term::Regexp("[a-z]+".into()),
                Term::Literal(" y".into()),
            ]
        );
        assert_eq!(
            template_to_terms(r":[~\]]"),
            vec![Term::Regexp(r"\]".into())]
        );
        assert_eq!(structural_pat_to_regexp("a:[~\\d+]b", true), r"(a).*?(\d+).*?(b)");
    }

    #[test]
    fn colon_without_bracket_is_literal() {
        assert_eq!(
            template_to_terms("a:b:"),
            vec![Term::Literal("a:b:".into())]
        );
    }

    #[test]
    fn unterminated_hole_is_flushed_as_literal() {
        assert_eq!(
            template_to_terms("foo(:[args"),
            vec![Term::Literal("foo(".into()), Term::Literal(":[args".into())]
        );
        assert_eq!(
            structural_pat_to_regexp("foo(:[args", false),
            r"(foo\()(.|\s)*?(:\[args)"
        );
    }

    #[test]
    fn bad_hole_regexp_is_a_query_error() {
        let err = compile_structural_pattern("a :[x~(] b", false).unwrap_err();
        assert!(matches!(err, SearchError::InvalidPattern { .. }));
    }
}
