//! Column resolution for query fragments.
//!
//! Query fragments (`select`, `where`, `groupby`, `having`, `orderby`) refer
//! to logical column names. Section columns (`id`, `uid`, `tags`, `entry`)
//! become `s.`-prefixed references, `data`, `score` and `text` stay as they
//! are, and every other identifier is a path into the `documents.data` JSON
//! payload. Everything that is not an identifier is copied through verbatim.
//!
//! Fragments are trusted text. The lexer rejects statement separators and
//! comments, but it is not a sanitizer: do not pass untrusted input here.

use crate::error::{Error, Result};
use std::collections::HashSet;

/// Columns that live on `sections` and need the `s.` prefix.
pub const SECTION_COLUMNS: [&str; 4] = ["id", "uid", "tags", "entry"];

/// Columns that are unambiguous across the joined tables.
pub const UNPREFIXED_COLUMNS: [&str; 3] = ["data", "score", "text"];

/// Table aliases used by the compiled statement.
const TABLE_ALIASES: [&str; 3] = ["s", "d", "sc"];

const KEYWORDS: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CAST", "COLLATE", "DESC", "DISTINCT",
    "ELSE", "END", "ESCAPE", "EXISTS", "FALSE", "GLOB", "IN", "IS", "ISNULL", "LIKE", "MATCH",
    "NOCASE", "NOT", "NOTNULL", "NULL", "NULLS", "FIRST", "LAST", "OR", "REGEXP", "THEN", "TRUE",
    "WHEN",
];

/// Resolve a logical column name to a SQL expression.
pub fn resolve(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if SECTION_COLUMNS.contains(&lower.as_str()) {
        return format!("s.{}", name);
    }
    if UNPREFIXED_COLUMNS.contains(&lower.as_str()) {
        return name.to_string();
    }
    format!("json_extract(data, '$.{}')", name.replace('\'', "''"))
}

/// Output alias for a selected column, or `None` when the column keeps its own name.
///
/// Compound expressions and non-standard columns always get an explicit alias
/// so the result mapping can recover the caller's column name.
pub fn alias(name: &str, compound: bool) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    let standard = SECTION_COLUMNS.contains(&lower.as_str())
        || UNPREFIXED_COLUMNS.contains(&lower.as_str());
    if standard && !compound {
        return None;
    }
    Some(format!(" AS \"{}\"", name.replace('"', "\"\"")))
}

/// A lexical token of a query fragment.
#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    /// Bare identifier, possibly dotted (`a.b.c`).
    Identifier(&'a str),
    /// `"quoted"` or `[bracketed]` identifier: raw text and unescaped name.
    Quoted(&'a str, String),
    /// String or numeric literal, raw text.
    Literal(&'a str),
    /// Any other single character.
    Symbol(&'a str),
    Space(&'a str),
}

impl<'a> Token<'a> {
    fn raw(&self) -> &'a str {
        match self {
            Token::Identifier(s) | Token::Literal(s) | Token::Symbol(s) | Token::Space(s) => s,
            Token::Quoted(raw, _) => raw,
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Identifier(s) if s.eq_ignore_ascii_case(keyword))
    }

    fn is_any_keyword(&self) -> bool {
        matches!(self, Token::Identifier(s) if KEYWORDS.iter().any(|k| s.eq_ignore_ascii_case(k)))
    }
}

/// Split a fragment into tokens.
fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    let error = |message: &str| Error::QuerySyntax {
        statement: input.to_string(),
        message: message.to_string(),
    };

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                tokens.push(Token::Space(&input[start..pos]));
            }
            b'\'' => {
                pos = scan_quoted(bytes, pos, b'\'')
                    .ok_or_else(|| error("unterminated string literal"))?;
                tokens.push(Token::Literal(&input[start..pos]));
            }
            b'"' => {
                pos = scan_quoted(bytes, pos, b'"')
                    .ok_or_else(|| error("unterminated quoted identifier"))?;
                let name = input[start + 1..pos - 1].replace("\"\"", "\"");
                tokens.push(Token::Quoted(&input[start..pos], name));
            }
            b'[' => {
                let end = input[pos..]
                    .find(']')
                    .ok_or_else(|| error("unterminated bracketed identifier"))?;
                pos += end + 1;
                let name = input[start + 1..pos - 1].to_string();
                tokens.push(Token::Quoted(&input[start..pos], name));
            }
            b';' => return Err(error("statement separators are not allowed")),
            b'-' if bytes.get(pos + 1) == Some(&b'-') => {
                return Err(error("comments are not allowed"))
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                return Err(error("comments are not allowed"))
            }
            _ if c.is_ascii_digit()
                || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) =>
            {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'.')
                {
                    // Exponent sign: 1e-5
                    if (bytes[pos] == b'e' || bytes[pos] == b'E')
                        && matches!(bytes.get(pos + 1), Some(b'+') | Some(b'-'))
                    {
                        pos += 1;
                    }
                    pos += 1;
                }
                tokens.push(Token::Literal(&input[start..pos]));
            }
            _ if c.is_ascii_alphabetic() || c == b'_' || c >= 0x80 => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric()
                        || bytes[pos] == b'_'
                        || bytes[pos] == b'.'
                        || bytes[pos] >= 0x80)
                {
                    pos += 1;
                }
                tokens.push(Token::Identifier(&input[start..pos]));
            }
            _ => {
                pos += 1;
                tokens.push(Token::Symbol(&input[start..pos]));
            }
        }
    }

    Ok(tokens)
}

/// Returns the position just past the closing quote, honoring doubled quotes.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut pos = start + 1;
    while pos < bytes.len() {
        if bytes[pos] == quote {
            if bytes.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return Some(pos + 1);
        }
        pos += 1;
    }
    None
}

/// Translates fragments, leaving output aliases defined in `select` untouched.
#[derive(Debug, Default)]
pub struct Resolver {
    aliases: HashSet<String>,
}

impl Resolver {
    /// Compiles a `select` list and records its output aliases.
    pub fn select(&mut self, select: &str) -> Result<String> {
        let tokens = tokenize(select)?;
        let (quantifier, body) = match trim(&tokens).split_first() {
            Some((first, rest)) if first.is_keyword("DISTINCT") || first.is_keyword("ALL") => {
                (Some(first.raw()), rest)
            }
            _ => (None, trim(&tokens)),
        };

        // First pass: register explicit aliases so later items and clauses can use them
        let items = split_items(body);
        for item in &items {
            if let Some((_, name)) = explicit_alias(item) {
                self.aliases.insert(name.to_ascii_lowercase());
            }
        }

        let mut columns = Vec::with_capacity(items.len());
        for item in items {
            columns.push(self.select_item(item));
        }
        let columns = columns.join(", ");
        Ok(match quantifier {
            Some(quantifier) => format!("{} {}", quantifier, columns),
            None => columns,
        })
    }

    fn select_item(&self, item: &[Token<'_>]) -> String {
        let (expression, explicit) = match explicit_alias(item) {
            Some((expression, name)) => (expression, Some(name)),
            None => (trim(item), None),
        };
        let raw: String = expression.iter().map(Token::raw).collect();

        let column = match expression {
            [Token::Symbol("*")] => return raw,
            // Qualified wildcard, e.g. d.*
            [Token::Identifier(_), Token::Symbol("*")] => return raw,
            [token @ Token::Identifier(name)]
                if !token.is_any_keyword() && !is_table_reference(name) =>
            {
                let suffix = explicit
                    .map(|a| format!(" AS {}", a))
                    .or_else(|| alias(name, false))
                    .unwrap_or_default();
                return format!("{}{}", resolve(name), suffix);
            }
            [Token::Quoted(_, name)] => {
                let suffix = explicit
                    .map(|a| format!(" AS {}", a))
                    .or_else(|| alias(name, false))
                    .unwrap_or_default();
                return format!("{}{}", resolve(name), suffix);
            }
            _ => self.translate_tokens(expression),
        };

        match explicit {
            Some(name) => format!("{} AS {}", column, name),
            None => format!("{}{}", column, alias(&raw, true).unwrap_or_default()),
        }
    }

    /// Translates a `where`/`groupby`/`having`/`orderby` fragment.
    pub fn translate(&self, fragment: &str) -> Result<String> {
        let tokens = tokenize(fragment)?;
        Ok(self.translate_tokens(trim(&tokens)))
    }

    fn translate_tokens(&self, tokens: &[Token<'_>]) -> String {
        let mut output = String::new();
        let mut previous: Option<&Token<'_>> = None;

        for (i, token) in tokens.iter().enumerate() {
            let verbatim = previous.is_some_and(|p| p.is_keyword("AS") || p.is_keyword("COLLATE"));
            match token {
                Token::Identifier(name) if !verbatim && self.is_column(token, name, &tokens[i + 1..]) => {
                    output.push_str(&resolve(name));
                }
                Token::Quoted(_, name)
                    if !verbatim && !self.aliases.contains(&name.to_ascii_lowercase()) =>
                {
                    output.push_str(&resolve(name));
                }
                _ => output.push_str(token.raw()),
            }
            if !matches!(token, Token::Space(_)) {
                previous = Some(token);
            }
        }

        output
    }

    fn is_column(&self, token: &Token<'_>, name: &str, rest: &[Token<'_>]) -> bool {
        if token.is_any_keyword() || self.aliases.contains(&name.to_ascii_lowercase()) {
            return false;
        }

        // Function call
        let next = rest.iter().find(|t| !matches!(t, Token::Space(_)));
        if matches!(next, Some(Token::Symbol("("))) {
            return false;
        }

        !is_table_reference(name)
    }
}

/// Explicit table reference, e.g. `s.id`.
fn is_table_reference(name: &str) -> bool {
    name.split_once('.')
        .is_some_and(|(table, _)| TABLE_ALIASES.iter().any(|a| a.eq_ignore_ascii_case(table)))
}

/// Split tokens on top-level commas.
fn split_items<'t, 'a>(tokens: &'t [Token<'a>]) -> Vec<&'t [Token<'a>]> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Symbol("(") => depth += 1,
            Token::Symbol(")") => depth -= 1,
            Token::Symbol(",") if depth == 0 => {
                items.push(trim(&tokens[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(trim(&tokens[start..]));
    items
}

/// Detects a trailing `AS name` at the top level of a select item.
fn explicit_alias<'t, 'a>(item: &'t [Token<'a>]) -> Option<(&'t [Token<'a>], &'a str)> {
    let significant: Vec<usize> = item
        .iter()
        .enumerate()
        .filter(|(_, t)| !matches!(t, Token::Space(_)))
        .map(|(i, _)| i)
        .collect();
    let &[.., as_pos, name_pos] = significant.as_slice() else {
        return None;
    };
    if !item[as_pos].is_keyword("AS") || as_pos == 0 {
        return None;
    }

    // AS inside CAST(... AS type) is nested and never reaches here at depth 0
    let depth: i32 = item[..as_pos]
        .iter()
        .map(|t| match t {
            Token::Symbol("(") => 1,
            Token::Symbol(")") => -1,
            _ => 0,
        })
        .sum();
    if depth != 0 {
        return None;
    }

    match &item[name_pos] {
        Token::Identifier(_) | Token::Quoted(..) => {
            Some((trim(&item[..as_pos]), item[name_pos].raw()))
        }
        _ => None,
    }
}

fn trim<'t, 'a>(tokens: &'t [Token<'a>]) -> &'t [Token<'a>] {
    let start = tokens
        .iter()
        .position(|t| !matches!(t, Token::Space(_)))
        .unwrap_or(tokens.len());
    let end = tokens
        .iter()
        .rposition(|t| !matches!(t, Token::Space(_)))
        .map_or(start, |p| p + 1);
    &tokens[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_columns() {
        assert_eq!(resolve("id"), "s.id");
        assert_eq!(resolve("Tags"), "s.Tags");
        assert_eq!(resolve("score"), "score");
        assert_eq!(resolve("text"), "text");
        assert_eq!(resolve("author"), "json_extract(data, '$.author')");
        assert_eq!(resolve("meta.lang"), "json_extract(data, '$.meta.lang')");
    }

    #[test]
    fn test_alias_rules() {
        assert_eq!(alias("id", false), None);
        assert_eq!(alias("score", false), None);
        assert_eq!(alias("author", false).as_deref(), Some(" AS \"author\""));
        assert_eq!(alias("score", true).as_deref(), Some(" AS \"score\""));
    }

    #[test]
    fn test_select_standard_and_json_columns() {
        let mut resolver = Resolver::default();
        let sql = resolver.select("id, text, score, author").unwrap();
        assert_eq!(
            sql,
            "s.id, text, score, json_extract(data, '$.author') AS \"author\""
        );
    }

    #[test]
    fn test_select_compound_expression() {
        let mut resolver = Resolver::default();
        let sql = resolver.select("count(*), max(score)").unwrap();
        assert_eq!(
            sql,
            "count(*) AS \"count(*)\", max(score) AS \"max(score)\""
        );
    }

    #[test]
    fn test_select_distinct_keeps_column_names() {
        let mut resolver = Resolver::default();
        assert_eq!(resolver.select("DISTINCT id").unwrap(), "DISTINCT s.id");
        assert_eq!(
            resolver.select("distinct tags, author").unwrap(),
            "distinct s.tags, json_extract(data, '$.author') AS \"author\""
        );
        assert_eq!(
            resolver.select("count(DISTINCT tags)").unwrap(),
            "count(DISTINCT s.tags) AS \"count(DISTINCT tags)\""
        );
    }

    #[test]
    fn test_select_explicit_alias_reused_in_orderby() {
        let mut resolver = Resolver::default();
        let sql = resolver.select("uid, length(text) AS size").unwrap();
        assert_eq!(sql, "s.uid, length(text) AS size");
        assert_eq!(resolver.translate("size DESC").unwrap(), "size DESC");
    }

    #[test]
    fn test_translate_where_clause() {
        let resolver = Resolver::default();
        let sql = resolver
            .translate("id > 2 AND author = 'id' AND text LIKE '%x%'")
            .unwrap();
        assert_eq!(
            sql,
            "s.id > 2 AND json_extract(data, '$.author') = 'id' AND text LIKE '%x%'"
        );
    }

    #[test]
    fn test_translate_keeps_table_references_and_casts() {
        let resolver = Resolver::default();
        let sql = resolver
            .translate("s.id IN (1, 2) AND CAST(score AS REAL) > 0.5e-1")
            .unwrap();
        assert_eq!(sql, "s.id IN (1, 2) AND CAST(score AS REAL) > 0.5e-1");
    }

    #[test]
    fn test_quoted_identifier() {
        let resolver = Resolver::default();
        assert_eq!(
            resolver.translate("\"page count\" >= 3").unwrap(),
            "json_extract(data, '$.page count') >= 3"
        );
    }

    #[test]
    fn test_rejects_separators_and_comments() {
        let resolver = Resolver::default();
        for fragment in ["1; DROP TABLE sections", "id -- x", "id /* x */"] {
            assert!(matches!(
                resolver.translate(fragment),
                Err(Error::QuerySyntax { .. })
            ));
        }
    }

    #[test]
    fn test_unterminated_literal() {
        let resolver = Resolver::default();
        assert!(matches!(
            resolver.translate("text = 'abc"),
            Err(Error::QuerySyntax { .. })
        ));
    }
}
