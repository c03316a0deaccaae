//! Reading and writing the SQL text of schema objects.
//!
//! SQLite keeps the original `CREATE` statement of every table, index,
//! trigger and view in `sqlite_master.sql`. These helpers pull the document
//! fields out of that text and render them back as idempotent `CREATE ...
//! IF NOT EXISTS` statements. Keyword matching is case-insensitive, respects
//! word boundaries and skips quoted text.

use std::collections::HashMap;

use versioned_db_core::{IndexDef, TriggerDef, ViewDef, quote_ident};

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn closing_quote(b: u8) -> Option<u8> {
    match b {
        b'\'' | b'"' | b'`' => Some(b),
        b'[' => Some(b']'),
        _ => None,
    }
}

/// Byte offset of the first standalone `keyword` at or after `from`,
/// outside quoted text.
pub(crate) fn find_keyword(sql: &str, keyword: &str, from: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let kw = keyword.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if let Some(q) = closing_quote(b) {
            quote = Some(q);
            i += 1;
            continue;
        }
        let end = i + kw.len();
        if end <= bytes.len()
            && bytes[i..end].eq_ignore_ascii_case(kw)
            && (i == 0 || !is_ident_byte(bytes[i - 1]))
            && bytes.get(end).is_none_or(|b| !is_ident_byte(*b))
        {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn rfind_keyword(sql: &str, keyword: &str, from: usize) -> Option<usize> {
    let mut last = None;
    let mut pos = from;
    while let Some(found) = find_keyword(sql, keyword, pos) {
        last = Some(found);
        pos = found + keyword.len();
    }
    last
}

fn skip_whitespace(sql: &str, pos: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = pos;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Skips one possibly-quoted, possibly schema-qualified name.
fn skip_name(sql: &str, pos: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = skip_whitespace(sql, pos);
    loop {
        match bytes.get(i).copied().and_then(closing_quote) {
            Some(q) => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == q {
                        if q != b']' && bytes.get(i + 1) == Some(&q) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
            }
            None => {
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
            }
        }
        if bytes.get(i) == Some(&b'.') {
            i += 1;
        } else {
            return i;
        }
    }
}

/// Skips an optional `IF NOT EXISTS`.
fn skip_if_not_exists(sql: &str, pos: usize) -> usize {
    let start = skip_whitespace(sql, pos);
    if find_keyword(sql, "IF", start) == Some(start) {
        if let Some(exists) = find_keyword(sql, "EXISTS", start) {
            return exists + "EXISTS".len();
        }
    }
    pos
}

/// Byte offset of the parenthesis closing the one at `open`.
fn matching_paren(sql: &str, open: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn clean(fragment: &str) -> String {
    fragment
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim()
        .to_string()
}

/// Extracts an index definition from its `CREATE INDEX` text.
pub(crate) fn parse_index(name: &str, sql: &str) -> Option<IndexDef> {
    let index_kw = find_keyword(sql, "INDEX", 0)?;
    let unique = find_keyword(sql, "UNIQUE", 0).is_some_and(|u| u < index_kw);
    let pos = skip_name(sql, skip_if_not_exists(sql, index_kw + "INDEX".len()));
    let on = find_keyword(sql, "ON", pos)?;
    let table_end = skip_name(sql, on + "ON".len());
    let open = table_end + sql[table_end..].find('(')?;
    let close = matching_paren(sql, open)?;
    let condition = find_keyword(sql, "WHERE", close)
        .map(|w| clean(&sql[w + "WHERE".len()..]))
        .filter(|c| !c.is_empty());

    Some(IndexDef {
        name: name.to_string(),
        columns: clean(&sql[open + 1..close]),
        unique,
        condition,
    })
}

/// Renders an index as `CREATE [UNIQUE] INDEX IF NOT EXISTS`.
pub(crate) fn index_sql(table: &str, index: &IndexDef) -> String {
    let mut sql = format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        quote_ident(table),
        index.columns.trim()
    );
    if let Some(condition) = index.condition.as_deref().filter(|c| !c.trim().is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(condition.trim());
    }
    sql.push(';');
    sql
}

/// Extracts a trigger definition from its `CREATE TRIGGER` text.
pub(crate) fn parse_trigger(name: &str, sql: &str) -> Option<TriggerDef> {
    let trigger_kw = find_keyword(sql, "TRIGGER", 0)?;
    let pos = skip_name(sql, skip_if_not_exists(sql, trigger_kw + "TRIGGER".len()));
    let on = find_keyword(sql, "ON", pos)?;
    let timeevent = clean(&sql[pos..on]);
    let table_end = skip_name(sql, on + "ON".len());
    let begin = find_keyword(sql, "BEGIN", table_end)?;
    let end = rfind_keyword(sql, "END", begin)?;

    let head = &sql[table_end..begin];
    let condition = find_keyword(head, "WHEN", 0)
        .map(|w| clean(&head[w + "WHEN".len()..]))
        .filter(|c| !c.is_empty());
    let logic = sql[begin + "BEGIN".len()..end].trim().to_string();

    Some(TriggerDef {
        name: name.to_string(),
        timeevent,
        condition,
        logic,
    })
}

/// Renders a trigger as `CREATE TRIGGER IF NOT EXISTS`.
pub(crate) fn trigger_sql(table: &str, trigger: &TriggerDef) -> String {
    let mut sql = format!(
        "CREATE TRIGGER IF NOT EXISTS {} {} ON {} FOR EACH ROW",
        quote_ident(&trigger.name),
        trigger.timeevent.trim(),
        quote_ident(table)
    );
    if let Some(condition) = trigger.condition.as_deref().filter(|c| !c.trim().is_empty()) {
        sql.push_str(" WHEN ");
        sql.push_str(condition.trim());
    }
    let logic = trigger.logic.trim();
    sql.push_str(" BEGIN ");
    sql.push_str(logic);
    if !logic.ends_with(';') {
        sql.push(';');
    }
    sql.push_str(" END;");
    sql
}

/// Extracts the `SELECT` body from a `CREATE VIEW` statement.
pub(crate) fn parse_view(name: &str, sql: &str) -> Option<ViewDef> {
    let view_kw = find_keyword(sql, "VIEW", 0)?;
    let mut pos = skip_whitespace(sql, skip_name(sql, skip_if_not_exists(sql, view_kw + "VIEW".len())));
    if sql.as_bytes().get(pos) == Some(&b'(') {
        pos = matching_paren(sql, pos)? + 1;
    }
    let as_kw = find_keyword(sql, "AS", pos)?;
    let value = sql[as_kw + "AS".len()..]
        .trim()
        .trim_end_matches(';')
        .trim()
        .to_string();
    Some(ViewDef {
        name: name.to_string(),
        value,
    })
}

/// Renders a view as `CREATE VIEW IF NOT EXISTS`.
pub(crate) fn view_sql(view: &ViewDef) -> String {
    format!(
        "CREATE VIEW IF NOT EXISTS {} AS {};",
        quote_ident(&view.name),
        view.value.trim().trim_end_matches(';')
    )
}

/// Parenthesis depth at byte `pos`, outside quoted text.
fn depth_at(sql: &str, pos: usize) -> usize {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for &b in &sql.as_bytes()[..pos] {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ => quote = closing_quote(b),
        }
    }
    depth
}

/// Like [`find_keyword`], but skips matches nested inside parentheses.
fn find_top_keyword(sql: &str, keyword: &str, from: usize) -> Option<usize> {
    let mut pos = from;
    while let Some(found) = find_keyword(sql, keyword, pos) {
        if depth_at(sql, found) == 0 {
            return Some(found);
        }
        pos = found + keyword.len();
    }
    None
}

/// Splits a definition list at commas that are not nested or quoted.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut start = 0;
    for (i, &b) in body.as_bytes().iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(body[start..i].trim());
                start = i + 1;
            }
            _ => quote = closing_quote(b),
        }
    }
    parts.push(body[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn unquote(name: &str) -> String {
    let name = name.trim();
    let bytes = name.as_bytes();
    match bytes.first().copied().and_then(closing_quote) {
        Some(q) if bytes.len() >= 2 && bytes[bytes.len() - 1] == q => {
            let inner = &name[1..name.len() - 1];
            if q == b']' {
                inner.to_string()
            } else {
                let single = char::from(q).to_string();
                inner.replace(&single.repeat(2), &single)
            }
        }
        _ => name.to_string(),
    }
}

/// Parenthesised group starting at the first non-blank byte after `pos`.
fn group_after(sql: &str, pos: usize) -> Option<(usize, usize)> {
    let open = skip_whitespace(sql, pos);
    if sql.as_bytes().get(open) != Some(&b'(') {
        return None;
    }
    Some((open, matching_paren(sql, open)?))
}

/// `COLLATE`, `CHECK` and generated-column clauses of one column
/// definition, in the order they were written.
fn column_clauses(def: &str, from: usize) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    if let Some(at) = find_top_keyword(def, "COLLATE", from) {
        let end = skip_name(def, at + "COLLATE".len());
        found.push((at, clean(&def[at..end])));
    }

    let mut pos = from;
    while let Some(at) = find_top_keyword(def, "CHECK", pos) {
        let Some((open, close)) = group_after(def, at + "CHECK".len()) else {
            break;
        };
        found.push((at, format!("CHECK {}", &def[open..=close])));
        pos = close + 1;
    }

    if let Some(as_kw) = find_top_keyword(def, "AS", from) {
        if let Some((open, close)) = group_after(def, as_kw + "AS".len()) {
            let mut clause = format!("GENERATED ALWAYS AS {}", &def[open..=close]);
            let next = skip_whitespace(def, close + 1);
            for storage in ["STORED", "VIRTUAL"] {
                if find_keyword(def, storage, next) == Some(next) {
                    clause.push(' ');
                    clause.push_str(storage);
                }
            }
            let start = find_top_keyword(def, "GENERATED", from)
                .filter(|g| *g < as_kw)
                .unwrap_or(as_kw);
            found.push((start, clause));
        }
    }

    found.sort_by_key(|(at, _)| *at);
    found.into_iter().map(|(_, clause)| clause).collect()
}

/// Parts of a `CREATE TABLE` statement that the table-info pragmas do not
/// report.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TableClauses {
    /// Extra column constraints keyed by lower-cased column name.
    pub columns: HashMap<String, Vec<String>>,
    /// Table-level `CHECK` constraints, with their `CONSTRAINT` name if any.
    pub checks: Vec<String>,
    /// Options after the column list, such as `WITHOUT ROWID` or `STRICT`.
    pub options: Vec<String>,
}

/// Extracts [`TableClauses`] from a `CREATE TABLE` statement.
///
/// Returns `None` for virtual tables and `CREATE TABLE ... AS SELECT`.
pub(crate) fn parse_table(sql: &str) -> Option<TableClauses> {
    let table_kw = find_keyword(sql, "TABLE", 0)?;
    if find_keyword(sql, "VIRTUAL", 0).is_some_and(|v| v < table_kw) {
        return None;
    }
    let name_end = skip_name(sql, skip_if_not_exists(sql, table_kw + "TABLE".len()));
    let (open, close) = group_after(sql, name_end)?;

    let mut clauses = TableClauses::default();
    for part in split_top_level(&sql[open + 1..close]) {
        let mut head = 0;
        if find_keyword(part, "CONSTRAINT", 0) == Some(0) {
            head = skip_whitespace(part, skip_name(part, "CONSTRAINT".len()));
        }
        let starts_with = |kw: &str| find_keyword(part, kw, head) == Some(head);
        if starts_with("CHECK") {
            clauses.checks.push(part.to_string());
            continue;
        }
        if head > 0 || ["PRIMARY", "UNIQUE", "FOREIGN"].into_iter().any(starts_with) {
            continue;
        }

        let name_end = skip_name(part, 0);
        let extra = column_clauses(part, name_end);
        if !extra.is_empty() {
            clauses
                .columns
                .insert(unquote(&part[..name_end]).to_ascii_lowercase(), extra);
        }
    }

    clauses.options = sql[close + 1..]
        .split(',')
        .map(clean)
        .filter(|o| !o.is_empty())
        .collect();
    Some(clauses)
}

/// Returns `true` if `body` refers to `table` by name.
pub(crate) fn mentions(body: &str, table: &str) -> bool {
    find_keyword(body, table, 0).is_some()
        || body
            .to_ascii_lowercase()
            .contains(&quote_ident(table).to_ascii_lowercase())
}

/// Renders a `PRAGMA table_info` default as a `DEFAULT` constraint.
///
/// Literals are kept as written; anything else is wrapped in parentheses
/// so expressions survive the round trip.
pub(crate) fn default_clause(value: &str) -> String {
    let v = value.trim();
    let upper = v.to_ascii_uppercase();
    let literal = v.starts_with('(')
        || v.starts_with('\'')
        || v.parse::<f64>().is_ok()
        || (upper.starts_with("X'") && v.ends_with('\''))
        || matches!(
            upper.as_str(),
            "NULL" | "TRUE" | "FALSE" | "CURRENT_TIME" | "CURRENT_DATE" | "CURRENT_TIMESTAMP"
        );
    if literal {
        format!("DEFAULT {v}")
    } else {
        format!("DEFAULT ({v})")
    }
}
