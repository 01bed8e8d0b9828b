//! Minimal `CREATE TABLE` text handling for table rebuilds.
//!
//! Only the top-level structure is parsed: the body is split on commas that
//! sit outside parentheses and quotes. Column and constraint definitions are
//! otherwise carried through verbatim.

use roster_kernel_core::{KernelError, KernelResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableDefinition {
    /// Text up to, not including, the opening parenthesis.
    pub head: String,
    /// Column and table-constraint definitions, trimmed.
    pub items: Vec<String>,
    /// Text after the closing parenthesis, e.g. ` STRICT`.
    pub tail: String,
}

impl TableDefinition {
    /// Render as `CREATE TABLE <name> (...)<tail>`.
    pub fn render(&self, quoted_name: &str) -> String {
        format!("CREATE TABLE {quoted_name} (\n  {}\n){}", self.items.join(",\n  "), self.tail)
    }
}

pub(crate) fn split_definitions(sql: &str) -> KernelResult<TableDefinition> {
    let malformed = || KernelError::storage(format!("cannot parse table definition: {sql}"));

    let mut depth = 0_usize;
    let mut quote: Option<char> = None;
    let mut open = None;
    let mut close = None;
    let mut boundaries = Vec::new();

    for (index, ch) in sql.char_indices() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '[' => quote = Some(']'),
            '(' => {
                if depth == 0 && open.is_none() {
                    open = Some(index);
                }
                depth += 1;
            }
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(malformed)?;
                if depth == 0 && close.is_none() {
                    close = Some(index);
                }
            }
            ',' if depth == 1 && close.is_none() => boundaries.push(index),
            _ => {}
        }
    }

    let (Some(open), Some(close)) = (open, close) else {
        return Err(malformed());
    };

    let mut items = Vec::with_capacity(boundaries.len() + 1);
    let mut start = open + 1;
    for boundary in boundaries.into_iter().chain(std::iter::once(close)) {
        let item = sql[start..boundary].trim();
        if item.is_empty() {
            return Err(malformed());
        }
        items.push(item.to_string());
        start = boundary + 1;
    }

    Ok(TableDefinition {
        head: sql[..open].trim_end().to_string(),
        items,
        tail: sql[close + 1..].to_string(),
    })
}

/// Split one definition into words, quoted names and parenthesised groups.
pub(crate) fn tokenize(item: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0_usize;
    let mut quote: Option<char> = None;

    for ch in item.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                current.push(ch);
                quote = Some(ch);
            }
            '[' => {
                current.push(ch);
                quote = Some(']');
            }
            '(' => {
                if depth == 0 && !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                depth += 1;
                current.push(ch);
            }
            ')' => {
                current.push(ch);
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Strip surrounding quotes from a single identifier token.
pub(crate) fn unquote(token: &str) -> &str {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if matches!((first, last), (b'"', b'"') | (b'`', b'`') | (b'[', b']') | (b'\'', b'\'')) {
            return &token[1..token.len() - 1];
        }
    }
    token
}

fn is_keyword(token: &str, keyword: &str) -> bool {
    token.eq_ignore_ascii_case(keyword)
}

/// Column name when `item` is a column definition rather than a table constraint.
pub(crate) fn column_name(item: &str) -> Option<String> {
    let tokens = tokenize(item);
    let first = tokens.first()?;
    let table_constraint = ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"]
        .iter()
        .any(|keyword| is_keyword(first, keyword));
    if table_constraint {
        None
    } else {
        Some(unquote(first).to_string())
    }
}

/// Source columns of a table-level `FOREIGN KEY (...)` definition.
pub(crate) fn table_foreign_key_columns(item: &str) -> Option<Vec<String>> {
    let tokens = tokenize(item);
    let mut index = 0;
    if tokens.first().is_some_and(|t| is_keyword(t, "CONSTRAINT")) {
        index = 2;
    }
    if !(tokens.get(index).is_some_and(|t| is_keyword(t, "FOREIGN"))
        && tokens.get(index + 1).is_some_and(|t| is_keyword(t, "KEY")))
    {
        return None;
    }
    let group = tokens.get(index + 2)?;
    let inner = group.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner.split(',').map(|name| unquote(name.trim()).to_string()).collect())
}

/// Remove the inline `[CONSTRAINT name] REFERENCES ...` clause from a
/// column definition. Returns `None` when the column has no such clause.
pub(crate) fn strip_inline_reference(item: &str) -> Option<String> {
    let tokens = tokenize(item);
    let references = tokens.iter().position(|t| is_keyword(t, "REFERENCES"))?;

    let start = if references >= 2 && is_keyword(&tokens[references - 2], "CONSTRAINT") {
        references - 2
    } else {
        references
    };

    // REFERENCES <table> [(<columns>)]
    let mut end = references + 2;
    if tokens.get(end).is_some_and(|t| t.starts_with('(')) {
        end += 1;
    }
    loop {
        let Some(token) = tokens.get(end) else { break };
        if is_keyword(token, "ON") {
            // ON DELETE|UPDATE <action>
            let action = tokens.get(end + 2).map(String::as_str).unwrap_or_default();
            end += if is_keyword(action, "SET") || is_keyword(action, "NO") { 4 } else { 3 };
        } else if is_keyword(token, "MATCH") {
            end += 2;
        } else if is_keyword(token, "NOT")
            && tokens.get(end + 1).is_some_and(|t| is_keyword(t, "DEFERRABLE"))
        {
            end += 2;
        } else if is_keyword(token, "DEFERRABLE") {
            end += 1;
        } else if is_keyword(token, "INITIALLY") {
            end += 2;
        } else {
            break;
        }
    }

    let end = end.min(tokens.len());
    let kept: Vec<&str> = tokens[..start]
        .iter()
        .chain(tokens[end..].iter())
        .map(String::as_str)
        .collect();
    Some(kept.join(" "))
}
