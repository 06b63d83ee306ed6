//! Structured code strings.
//!
//! A unit code reads `<PREFIX>-C<case>-<VARIANTKEY>-<sequence>`, for example
//! `ORD42-C0003-SKU12-000045`. Printed labels carry the same string as the
//! last path segment of a tracking URL (`https://t.example/q/ORD42-C0003-SKU12-000045`).
//! Master codes read `<PREFIX>-M<case>`.
//!
//! This is the only place that knows the grammar.

use once_cell::sync::Lazy;
use regex::Regex;

static CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<prefix>[A-Za-z0-9_]+(?:-[A-Za-z0-9_]+)*?)-C(?P<case>\d+)-(?P<variant>[A-Za-z0-9_]+)-(?P<seq>\d+)$")
        .expect("valid code regex")
});

static DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid digits regex"));

static TRAILING_DIGITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-(?P<seq>\d+)$").expect("valid trailing digits regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCode {
    pub prefix: String,
    pub case_number: i64,
    pub variant_key: String,
    pub sequence: i64,
}

pub fn format_code(prefix: &str, case_number: i64, variant_key: &str, sequence: i64) -> String {
    format!("{prefix}-C{case_number:04}-{variant_key}-{sequence:06}")
}

pub fn format_master_code(prefix: &str, case_number: i64) -> String {
    format!("{prefix}-M{case_number:04}")
}

/// Strip an optional URL wrapper down to the code segment.
pub fn normalize(input: &str) -> &str {
    let trimmed = input.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
}

/// Parse a raw or URL-embedded unit code.
pub fn parse_code(input: &str) -> Option<ParsedCode> {
    let caps = CODE_RE.captures(normalize(input))?;
    Some(ParsedCode {
        prefix: caps["prefix"].to_string(),
        case_number: caps["case"].parse().ok()?,
        variant_key: caps["variant"].to_string(),
        sequence: caps["seq"].parse().ok()?,
    })
}

/// Turn operator input into a sequence number.
///
/// Accepts a bare number, or the trailing numeric group of a structured code
/// (raw or inside a URL). Anything else is rejected.
pub fn parse_sequence(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    if DIGITS_RE.is_match(trimmed) {
        return trimmed.parse().ok();
    }
    if let Some(parsed) = parse_code(trimmed) {
        return Some(parsed.sequence);
    }
    let segment = normalize(trimmed);
    TRAILING_DIGITS_RE
        .captures(segment)
        .and_then(|caps| caps["seq"].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_then_parse() {
        let code = format_code("ORD42", 3, "SKU12", 45);
        assert_eq!(code, "ORD42-C0003-SKU12-000045");
        let parsed = parse_code(&code).unwrap();
        assert_eq!(
            parsed,
            ParsedCode {
                prefix: "ORD42".into(),
                case_number: 3,
                variant_key: "SKU12".into(),
                sequence: 45,
            }
        );
        assert_eq!(format_master_code("ORD42", 3), "ORD42-M0003");
    }

    #[test]
    fn parses_url_embedded_codes() {
        let parsed = parse_code("https://t.example/q/ACME-2024-C0010-V7-000123?src=label#x").unwrap();
        assert_eq!(parsed.prefix, "ACME-2024");
        assert_eq!(parsed.case_number, 10);
        assert_eq!(parsed.variant_key, "V7");
        assert_eq!(parsed.sequence, 123);
    }

    #[test]
    fn sequence_inputs() {
        assert_eq!(parse_sequence("17"), Some(17));
        assert_eq!(parse_sequence(" 0042 "), Some(42));
        assert_eq!(parse_sequence("ORD42-C0003-SKU12-000045"), Some(45));
        assert_eq!(
            parse_sequence("https://t.example/q/ORD42-C0003-SKU12-000046/"),
            Some(46)
        );
        assert_eq!(parse_sequence("https://t.example/q/LEGACY-000047"), Some(47));
        assert_eq!(parse_sequence("abc"), None);
        assert_eq!(parse_sequence("12a"), None);
        assert_eq!(parse_sequence(""), None);
    }

    #[test]
    fn rejects_non_codes() {
        assert!(parse_code("ORD42-0003-SKU12-000045").is_none());
        assert!(parse_code("hello").is_none());
    }
}
