//! Boolean search-expression compiler.
//!
//! Expressions using parentheses, `|`, `!`, quoted phrases, or wildcards
//! compile into a predicate tree evaluated against the candidate's
//! matchable text (name, or name + newline + path in Everything mode).
//! Compilation is total: malformed input degrades to permissive matchers
//! rather than failing.

use regex::Regex;

#[derive(Debug, Clone)]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Term(Matcher),
    /// Matches everything; the fallback for degenerate expressions.
    True,
}

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Lowercased substring.
    Substring(String),
    /// Wildcard token compiled to a per-line anchored regex.
    Pattern(Regex),
}

impl Predicate {
    /// Evaluate against matchable text (already lowercased by the
    /// caller; the regex side is case-insensitive regardless).
    pub fn matches(&self, text: &str) -> bool {
        match self {
            Predicate::And(a, b) => a.matches(text) && b.matches(text),
            Predicate::Or(a, b) => a.matches(text) || b.matches(text),
            Predicate::Not(inner) => !inner.matches(text),
            Predicate::Term(m) => m.matches(text),
            Predicate::True => true,
        }
    }

    /// Whether any positive (non-negated) term exists. A NOT-only
    /// expression is not a valid candidate seed and matches nothing at
    /// the orchestrator level.
    pub fn has_positive_term(&self) -> bool {
        match self {
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.has_positive_term() || b.has_positive_term()
            }
            Predicate::Not(_) => false,
            Predicate::Term(_) => true,
            Predicate::True => false,
        }
    }
}

impl Matcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Substring(s) => text.contains(s.as_str()),
            Matcher::Pattern(re) => re.is_match(text),
        }
    }
}

/// Compile a wildcard token (`*`, `?`) into a regex anchored to one line
/// of the matchable text.
pub fn wildcard_regex(token: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(token.len() + 12);
    pattern.push_str("(?im)^");
    for ch in token.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            _ => pattern.push_str(&regex::escape(&ch.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

fn term(token: &str) -> Predicate {
    let tok = token.trim();
    if tok.is_empty() {
        return Predicate::True;
    }
    if let Some(phrase) = tok.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Predicate::Term(Matcher::Substring(phrase.to_lowercase()));
    }
    if tok.contains('*') || tok.contains('?') {
        return match wildcard_regex(tok) {
            Some(re) => Predicate::Term(Matcher::Pattern(re)),
            None => Predicate::Term(Matcher::Substring(tok.to_lowercase())),
        };
    }
    Predicate::Term(Matcher::Substring(tok.to_lowercase()))
}

#[derive(Debug, PartialEq)]
enum Tok {
    Word(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(expr: &str) -> Vec<Tok> {
    let mut raw: Vec<Tok> = Vec::new();
    let mut cur = String::new();
    let mut chars = expr.chars().peekable();

    let flush = |cur: &mut String, raw: &mut Vec<Tok>| {
        if !cur.is_empty() {
            raw.push(Tok::Word(std::mem::take(cur)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => flush(&mut cur, &mut raw),
            '(' => {
                flush(&mut cur, &mut raw);
                raw.push(Tok::Open);
            }
            ')' => {
                flush(&mut cur, &mut raw);
                raw.push(Tok::Close);
            }
            '|' => {
                flush(&mut cur, &mut raw);
                raw.push(Tok::Or);
            }
            '!' => {
                flush(&mut cur, &mut raw);
                raw.push(Tok::Not);
            }
            '"' => {
                flush(&mut cur, &mut raw);
                let mut phrase = String::from("\"");
                for pc in chars.by_ref() {
                    phrase.push(pc);
                    if pc == '"' {
                        break;
                    }
                }
                if !phrase.ends_with('"') || phrase.len() < 2 {
                    phrase.push('"');
                }
                raw.push(Tok::Word(phrase));
            }
            _ => cur.push(c),
        }
    }
    flush(&mut cur, &mut raw);

    // Insert the implicit AND between adjacent operands.
    let mut out: Vec<Tok> = Vec::with_capacity(raw.len() * 2);
    let mut prev_operand = false;
    for tok in raw {
        let starts_operand = matches!(tok, Tok::Word(_) | Tok::Open | Tok::Not);
        if prev_operand && starts_operand {
            out.push(Tok::And);
        }
        prev_operand = matches!(tok, Tok::Word(_) | Tok::Close);
        out.push(tok);
    }
    out
}

fn precedence(tok: &Tok) -> u8 {
    match tok {
        Tok::Not => 3,
        Tok::And => 2,
        Tok::Or => 1,
        _ => 0,
    }
}

/// Compile an expression into a predicate. Never fails; degenerate
/// inputs (unbalanced parens, dangling operators) produce permissive
/// trees instead.
pub fn compile(expr: &str) -> Predicate {
    // Shunting-yard to RPN.
    let mut output: Vec<Tok> = Vec::new();
    let mut ops: Vec<Tok> = Vec::new();
    for tok in tokenize(expr) {
        match tok {
            Tok::Word(_) => output.push(tok),
            Tok::And | Tok::Or | Tok::Not => {
                while let Some(top) = ops.last() {
                    if *top != Tok::Open && precedence(top) >= precedence(&tok) {
                        output.push(ops.pop().unwrap_or(Tok::And));
                    } else {
                        break;
                    }
                }
                ops.push(tok);
            }
            Tok::Open => ops.push(tok),
            Tok::Close => {
                while let Some(top) = ops.pop() {
                    if top == Tok::Open {
                        break;
                    }
                    output.push(top);
                }
            }
        }
    }
    while let Some(op) = ops.pop() {
        if op != Tok::Open {
            output.push(op);
        }
    }

    // Fold the RPN into a tree. Underflow (malformed input) degrades to
    // `True` operands.
    let mut stack: Vec<Predicate> = Vec::new();
    for tok in output {
        match tok {
            Tok::Word(w) => stack.push(term(&w)),
            Tok::Not => {
                let a = stack.pop().unwrap_or(Predicate::True);
                stack.push(Predicate::Not(Box::new(a)));
            }
            Tok::And | Tok::Or => {
                let b = stack.pop().unwrap_or(Predicate::True);
                let a = stack.pop().unwrap_or(Predicate::True);
                stack.push(if matches!(tok, Tok::And) {
                    Predicate::And(Box::new(a), Box::new(b))
                } else {
                    Predicate::Or(Box::new(a), Box::new(b))
                });
            }
            _ => {}
        }
    }
    stack.pop().unwrap_or(Predicate::True)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_and_between_words() {
        let p = compile("report 2024");
        assert!(p.matches("annual report 2024.pdf"));
        assert!(!p.matches("annual report 2023.pdf"));
    }

    #[test]
    fn or_and_grouping() {
        let p = compile("(jpg | png) photo");
        assert!(p.matches("photo_001.jpg"));
        assert!(p.matches("photo_002.png"));
        assert!(!p.matches("photo_003.gif"));
        assert!(!p.matches("doc_001.jpg"));
    }

    #[test]
    fn not_binds_tightest() {
        let p = compile("readme !old");
        assert!(p.matches("readme.md"));
        assert!(!p.matches("readme_old.md"));
    }

    #[test]
    fn quoted_phrase_keeps_spaces() {
        let p = compile("\"annual report\"");
        assert!(p.matches("annual report 2024.pdf"));
        assert!(!p.matches("annual_report.pdf"));
    }

    #[test]
    fn wildcards_anchor_to_a_line() {
        let p = compile("*.txt");
        assert!(p.matches("notes.txt"));
        assert!(!p.matches("notes.txt.bak"));
        // Multiline text: the path line can satisfy the anchor too.
        assert!(p.matches("notes.txt.bak\nd:\\work\\notes.txt"));

        let q = compile("ab?.log");
        assert!(q.matches("abc.log"));
        assert!(!q.matches("abcd.log"));
    }

    #[test]
    fn malformed_input_never_panics() {
        for expr in ["", "!", "(((", ")))", "a |", "| b", "!(", "\"unterminated"] {
            let p = compile(expr);
            let _ = p.matches("anything");
        }
    }

    #[test]
    fn unterminated_quote_matches_as_phrase() {
        let p = compile("\"half done");
        assert!(p.matches("half done draft.txt"));
    }

    #[test]
    fn positive_term_detection() {
        assert!(compile("a !b").has_positive_term());
        assert!(!compile("!b").has_positive_term());
        assert!(!compile("!a !b").has_positive_term());
        assert!(compile("a | b").has_positive_term());
    }

    #[test]
    fn case_insensitive_matching() {
        let p = compile("ReadMe");
        assert!(p.matches("readme.md"));
        let w = compile("RE*ME");
        assert!(w.matches("readme"));
    }
}
