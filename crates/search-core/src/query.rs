//! The search-expression parser.
//!
//! One user string in, one `Query` out, always: ill-formed filter values
//! demote their token to a literal keyword, so the parser is total over
//! arbitrary input. Grammar (most specific first):
//!
//! ```text
//! expr      := term ( ' ' term )*
//! term      := filter | '!' atom | atom ('|' atom)*
//! atom      := quoted | wildcarded | bareword | '(' expr ')'
//! filter    := KEY ':' value
//! ```
//!
//! Recognized keys: `ext`, `size`, `dm`/`datemodified`, `path`, `len`,
//! `folder`, `file`, `content`.

use chrono::{Local, NaiveDate, TimeZone};

use crate::predicate::{self, Predicate};

/// Structured predicates extracted from filter tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters {
    /// Lowercased dotted extensions; match any.
    pub ext_any_of: Vec<String>,
    pub size_min: Option<u64>,
    pub size_max: Option<u64>,
    pub mtime_after: Option<f64>,
    pub mtime_before: Option<f64>,
    pub is_dir_only: bool,
    pub is_file_only: bool,
    pub path_contains: Option<String>,
    pub path_len_min: Option<usize>,
    pub path_len_max: Option<usize>,
}

impl QueryFilters {
    pub fn any(&self) -> bool {
        !self.ext_any_of.is_empty()
            || self.size_min.is_some()
            || self.size_max.is_some()
            || self.mtime_after.is_some()
            || self.mtime_before.is_some()
            || self.is_dir_only
            || self.is_file_only
            || self.path_contains.is_some()
            || self.path_len_min.is_some()
            || self.path_len_max.is_some()
    }
}

/// Parsed query.
///
/// The flat keyword lists drive seed selection and simple verification.
/// `predicate` carries the compiled boolean tree whenever the expression
/// used grouping, OR/NOT operators, or wildcards; when present it is the
/// authority on keyword matching and the flat lists only steer seeding.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub keywords_and: Vec<String>,
    pub keywords_or: Vec<String>,
    pub keywords_not: Vec<String>,
    pub wildcard_on: bool,
    pub filters: QueryFilters,
    pub content_probe: Option<String>,
    pub predicate: Option<Predicate>,
}

impl Query {
    /// Whether anything can seed a candidate scan. A query with no
    /// positive term, no filter, and no content phrase matches nothing,
    /// including the NOT-only degenerate case. A `content:` phrase is a
    /// real membership test against the probe, so it counts.
    pub fn has_candidates(&self) -> bool {
        !self.keywords_and.is_empty()
            || !self.keywords_or.is_empty()
            || self.filters.any()
            || self.content_probe.is_some()
            || self
                .predicate
                .as_ref()
                .is_some_and(Predicate::has_positive_term)
    }

    /// Longest wildcard-free AND keyword: the preferred n-gram seed.
    /// `None` sends the orchestrator to a cheaper structured seed or the
    /// capped scan.
    pub fn seed_keyword(&self) -> Option<&str> {
        self.keywords_and
            .iter()
            .filter(|k| !k.contains(['*', '?']))
            .max_by_key(|k| k.chars().count())
            .map(String::as_str)
    }
}

/// Split on whitespace, keeping quoted segments (and `key:"..."` values)
/// intact.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                cur.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

fn strip_quotes(value: &str) -> &str {
    let v = value.strip_prefix('"').unwrap_or(value);
    v.strip_suffix('"').unwrap_or(v)
}

/// `1mb`, `500kb`, `10gb`, bare bytes.
fn parse_size(value: &str) -> Option<u64> {
    let v = value.trim();
    let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    if split == 0 {
        return None;
    }
    let num: u64 = v[..split].parse().ok()?;
    let mult = match &v[split..] {
        "" | "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        _ => return None,
    };
    Some(num * mult)
}

/// `YYYY-MM-DD` at local midnight.
fn parse_date(value: &str) -> Option<f64> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    let local = Local.from_local_datetime(&midnight).single()?;
    Some(local.timestamp() as f64)
}

const DAY: f64 = 86_400.0;

/// Parse a user search string. `now` is the reference time for relative
/// date filters (`dm:7d`, `dm:today`).
pub fn parse_query(input: &str, now: f64) -> Query {
    let mut query = Query::default();
    // Tokens that stay part of the boolean expression.
    let mut expr_tokens: Vec<String> = Vec::new();

    for token in tokenize(input) {
        let token_lower = token.to_lowercase();

        // A malformed filter value demotes the whole token to a literal.
        let demote = |query: &mut Query, expr_tokens: &mut Vec<String>| {
            query.keywords_and.push(token_lower.clone());
            expr_tokens.push(token_lower.clone());
        };

        if let Some(rest) = token_lower.strip_prefix('!') {
            if !rest.is_empty() {
                query
                    .keywords_not
                    .push(strip_quotes(rest).to_string());
                expr_tokens.push(token_lower.clone());
                continue;
            }
        }

        if let Some(value) = token_lower.strip_prefix("ext:") {
            let exts: Vec<&str> = value.split('|').filter(|e| !e.is_empty()).collect();
            if exts.is_empty() {
                demote(&mut query, &mut expr_tokens);
            } else {
                for ext in exts {
                    query.filters.ext_any_of.push(volume_index::normalize_ext(ext));
                }
            }
            continue;
        }

        if let Some(value) = token_lower.strip_prefix("size:") {
            if !parse_size_filter(value, &mut query.filters) {
                // `size:>banana` leaves size unbounded and keeps the
                // token as a literal.
                demote(&mut query, &mut expr_tokens);
            }
            continue;
        }

        if let Some(value) = token_lower
            .strip_prefix("dm:")
            .or_else(|| token_lower.strip_prefix("datemodified:"))
        {
            if !parse_date_filter(value, now, &mut query.filters) {
                demote(&mut query, &mut expr_tokens);
            }
            continue;
        }

        if let Some(value) = token_lower.strip_prefix("len:") {
            let ok = if let Some(n) = value.strip_prefix('>') {
                n.parse::<usize>()
                    .map(|n| query.filters.path_len_min = Some(n))
                    .is_ok()
            } else if let Some(n) = value.strip_prefix('<') {
                n.parse::<usize>()
                    .map(|n| query.filters.path_len_max = Some(n))
                    .is_ok()
            } else {
                false
            };
            if !ok {
                demote(&mut query, &mut expr_tokens);
            }
            continue;
        }

        if let Some(value) = token_lower.strip_prefix("path:") {
            let v = strip_quotes(value);
            if !v.is_empty() {
                query.filters.path_contains = Some(v.to_string());
            }
            continue;
        }

        if let Some(value) = token_lower.strip_prefix("folder:") {
            query.filters.is_dir_only = true;
            if !value.is_empty() {
                query.keywords_and.push(value.to_string());
                expr_tokens.push(value.to_string());
            }
            continue;
        }

        if let Some(value) = token_lower.strip_prefix("file:") {
            query.filters.is_file_only = true;
            if !value.is_empty() {
                query.keywords_and.push(value.to_string());
                expr_tokens.push(value.to_string());
            }
            continue;
        }

        if token_lower.starts_with("content:") {
            // Keep the phrase's original case for the collaborator.
            let v = strip_quotes(&token["content:".len()..]);
            if !v.is_empty() {
                query.content_probe = Some(v.to_string());
            }
            continue;
        }

        // OR alternatives within one bareword token: a|b|c.
        if token_lower.contains('|') && !token_lower.contains(['(', ')']) {
            for alt in token_lower.split('|').filter(|a| !a.is_empty()) {
                query.keywords_or.push(strip_quotes(alt).to_string());
            }
            expr_tokens.push(token_lower.clone());
            continue;
        }

        // Parenthesized or otherwise boolean-shaped tokens only feed the
        // compiled predicate; putting them in the flat AND list would
        // poison seed selection.
        if token_lower.contains(['(', ')', '|']) {
            expr_tokens.push(token_lower.clone());
            continue;
        }

        // Plain keyword (possibly quoted or wildcarded).
        let cleaned = strip_quotes(&token_lower);
        if !cleaned.is_empty() {
            query.keywords_and.push(cleaned.to_string());
        }
        expr_tokens.push(token_lower.clone());
    }

    let expr = expr_tokens.join(" ");
    query.wildcard_on = expr.contains(['*', '?']);
    let boolean = expr.contains(['(', ')', '|', '!']);
    if (query.wildcard_on || boolean) && !expr.is_empty() {
        query.predicate = Some(predicate::compile(&expr));
    }

    query
}

fn parse_size_filter(value: &str, filters: &mut QueryFilters) -> bool {
    if let Some((lo, hi)) = value.split_once("..") {
        match (parse_size(lo), parse_size(hi)) {
            (Some(min), Some(max)) => {
                filters.size_min = Some(min);
                filters.size_max = Some(max);
                true
            }
            _ => false,
        }
    } else if let Some(rest) = value.strip_prefix('>') {
        parse_size(rest).map(|s| filters.size_min = Some(s)).is_some()
    } else if let Some(rest) = value.strip_prefix('<') {
        parse_size(rest).map(|s| filters.size_max = Some(s)).is_some()
    } else {
        false
    }
}

fn parse_date_filter(value: &str, now: f64, filters: &mut QueryFilters) -> bool {
    if let Some((start, end)) = value.split_once("..") {
        match (parse_date(start), parse_date(end)) {
            (Some(after), Some(before)) => {
                filters.mtime_after = Some(after);
                // Inclusive end date.
                filters.mtime_before = Some(before + DAY);
                true
            }
            _ => false,
        }
    } else if value == "today" {
        let midnight = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| Local.from_local_datetime(&dt).single())
            .map(|dt| dt.timestamp() as f64);
        match midnight {
            Some(ts) => {
                filters.mtime_after = Some(ts);
                true
            }
            None => false,
        }
    } else if let Some(days) = value.strip_suffix('d').and_then(|n| n.parse::<u32>().ok()) {
        filters.mtime_after = Some(now - f64::from(days) * DAY);
        true
    } else if let Some(hours) = value.strip_suffix('h').and_then(|n| n.parse::<u32>().ok()) {
        filters.mtime_after = Some(now - f64::from(hours) * 3_600.0);
        true
    } else if let Some(ts) = parse_date(value) {
        filters.mtime_after = Some(ts);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_700_000_000.0;

    #[test]
    fn bare_keywords_are_anded() {
        let q = parse_query("Annual Report", NOW);
        assert_eq!(q.keywords_and, vec!["annual", "report"]);
        assert!(q.keywords_or.is_empty());
        assert!(q.predicate.is_none());
        assert!(!q.wildcard_on);
    }

    #[test]
    fn ext_filter_with_alternatives() {
        let q = parse_query("ext:pdf|docx|txt", NOW);
        assert_eq!(q.filters.ext_any_of, vec![".pdf", ".docx", ".txt"]);
        assert!(q.keywords_and.is_empty());
        assert!(q.has_candidates());
    }

    #[test]
    fn size_filters() {
        let q = parse_query("size:>10mb", NOW);
        assert_eq!(q.filters.size_min, Some(10 << 20));
        assert_eq!(q.filters.size_max, None);

        let q = parse_query("size:<1kb", NOW);
        assert_eq!(q.filters.size_max, Some(1 << 10));

        let q = parse_query("size:10mb..100mb", NOW);
        assert_eq!(q.filters.size_min, Some(10 << 20));
        assert_eq!(q.filters.size_max, Some(100 << 20));
    }

    #[test]
    fn malformed_size_becomes_literal() {
        let q = parse_query("size:>banana", NOW);
        assert_eq!(q.filters.size_min, None);
        assert_eq!(q.filters.size_max, None);
        assert_eq!(q.keywords_and, vec!["size:>banana"]);
    }

    #[test]
    fn relative_dates() {
        let q = parse_query("dm:7d", NOW);
        assert_eq!(q.filters.mtime_after, Some(NOW - 7.0 * 86_400.0));

        let q = parse_query("dm:12h", NOW);
        assert_eq!(q.filters.mtime_after, Some(NOW - 12.0 * 3_600.0));

        let q = parse_query("datemodified:3d", NOW);
        assert!(q.filters.mtime_after.is_some());
    }

    #[test]
    fn absolute_date_range_is_end_inclusive() {
        let q = parse_query("dm:2024-01-01..2024-01-31", NOW);
        let after = q.filters.mtime_after.unwrap();
        let before = q.filters.mtime_before.unwrap();
        // 30 days between the two midnights, plus the inclusive end day.
        assert_eq!(before - after, 31.0 * 86_400.0);
    }

    #[test]
    fn not_terms_and_or_groups() {
        let q = parse_query("readme !old", NOW);
        assert_eq!(q.keywords_and, vec!["readme"]);
        assert_eq!(q.keywords_not, vec!["old"]);
        assert!(q.predicate.is_some());

        let q = parse_query("jpg|png|gif", NOW);
        assert_eq!(q.keywords_or, vec!["jpg", "png", "gif"]);
        assert!(q.keywords_and.is_empty());
    }

    #[test]
    fn folder_and_file_flags() {
        let q = parse_query("folder:build", NOW);
        assert!(q.filters.is_dir_only);
        assert_eq!(q.keywords_and, vec!["build"]);

        let q = parse_query("file:", NOW);
        assert!(q.filters.is_file_only);
        assert!(q.keywords_and.is_empty());
    }

    #[test]
    fn path_and_len_filters() {
        let q = parse_query("path:projects len:>100", NOW);
        assert_eq!(q.filters.path_contains.as_deref(), Some("projects"));
        assert_eq!(q.filters.path_len_min, Some(100));

        let q = parse_query("len:<40", NOW);
        assert_eq!(q.filters.path_len_max, Some(40));

        let q = parse_query("len:huge", NOW);
        assert_eq!(q.keywords_and, vec!["len:huge"]);
    }

    #[test]
    fn content_probe_phrase() {
        let q = parse_query("content:\"Exact Phrase\" notes", NOW);
        assert_eq!(q.content_probe.as_deref(), Some("Exact Phrase"));
        assert_eq!(q.keywords_and, vec!["notes"]);
    }

    #[test]
    fn content_only_query_has_candidates() {
        let q = parse_query("content:needle", NOW);
        assert!(q.keywords_and.is_empty());
        assert!(!q.filters.any());
        assert!(q.has_candidates());
    }

    #[test]
    fn wildcards_turn_the_predicate_on() {
        let q = parse_query("*.txt", NOW);
        assert!(q.wildcard_on);
        assert!(q.predicate.is_some());
        // Wildcard tokens never become the n-gram seed.
        assert_eq!(q.seed_keyword(), None);
    }

    #[test]
    fn quoted_phrase_is_one_keyword() {
        let q = parse_query("\"annual report\" ext:pdf", NOW);
        assert_eq!(q.keywords_and, vec!["annual report"]);
        assert_eq!(q.filters.ext_any_of, vec![".pdf"]);
    }

    #[test]
    fn empty_and_garbage_inputs_are_total() {
        for input in ["", "   ", ":::", "!", "ext:", "size:", "dm:", "(((", "a|"] {
            let _ = parse_query(input, NOW);
        }
        let q = parse_query("", NOW);
        assert!(!q.has_candidates());
    }

    #[test]
    fn not_only_query_has_no_candidates() {
        let q = parse_query("!temp", NOW);
        assert!(!q.has_candidates());
        assert!(q.predicate.as_ref().is_some_and(|p| !p.has_positive_term()));
    }

    #[test]
    fn seed_keyword_prefers_longest_clean_token() {
        let q = parse_query("ab foobarbaz cd", NOW);
        assert_eq!(q.seed_keyword(), Some("foobarbaz"));

        let q = parse_query("draft* report", NOW);
        assert_eq!(q.seed_keyword(), Some("report"));
    }

    #[test]
    fn parenthesized_groups_compile_without_poisoning_seeds() {
        let q = parse_query("(draft|final) report", NOW);
        assert_eq!(q.keywords_and, vec!["report"]);
        assert_eq!(q.seed_keyword(), Some("report"));
        let p = q.predicate.expect("boolean expr compiles");
        assert!(p.matches("final report.docx"));
        assert!(!p.matches("report.docx"));
    }

    #[test]
    fn boolean_only_token_still_has_candidates() {
        let q = parse_query("(draft|final)", NOW);
        assert!(q.keywords_and.is_empty());
        assert!(q.has_candidates());
        assert_eq!(q.seed_keyword(), None);
    }
}
