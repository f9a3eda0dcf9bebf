//! Statement classification and filter extraction.
//!
//! [`HeuristicClassifier`] is a best-effort static text match, not a SQL
//! parser. It looks at the leading keywords of the first statement and is
//! unreliable for semicolon-separated batches, CTEs (`WITH ...` is reported
//! as [`StatementKind::Other`]), multi-table statements and filters whose
//! subqueries reference other tables. Callers that need exact answers plug
//! in their own [`StatementClassifier`].

use crate::{segment_name, Classification, StatementKind};

pub trait StatementClassifier: Send + Sync {
    fn classify(&self, sql: &str) -> Classification;

    /// The filter condition of an UPDATE/DELETE, verbatim, without the
    /// `WHERE` keyword and without trailing `ORDER BY`/`LIMIT`/`RETURNING`.
    fn where_clause(&self, sql: &str) -> Option<FilterClause>;
}

/// A `WHERE` condition lifted out of a statement, ready to be replayed in a
/// snapshot query against the same table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterClause {
    /// The condition with every parameter reference rewritten as an
    /// anonymous `?`.
    pub condition: String,
    /// The alias the statement gives its target table, as written.
    pub table_alias: Option<String>,
    /// For each `?` in `condition`, in order, the zero-based index of the
    /// statement parameter it binds.
    pub parameters: Vec<usize>,
}

/// Keyword-prefix classifier for common SQL dialects.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl StatementClassifier for HeuristicClassifier {
    fn classify(&self, sql: &str) -> Classification {
        let tokens = tokenize(sql);
        let (statement, multi_statement) = first_statement(&tokens);
        let mut cursor = Cursor::new(sql, &statement);
        let (kind, target_table) = classify_statement(&mut cursor);

        Classification {
            kind,
            target_table: if multi_statement { None } else { target_table },
            multi_statement,
        }
    }

    fn where_clause(&self, sql: &str) -> Option<FilterClause> {
        scan_where_clause(sql)
    }
}

/// Extracts the top-level `WHERE` condition of the first statement.
///
/// Parameters are numbered the way SQLite binds them: `?` takes the next
/// index, `?NNN` takes index `NNN`, and `:name`, `@name` and `$name` share
/// one index per distinct name, assigned on first use.
#[must_use]
pub fn scan_where_clause(sql: &str) -> Option<FilterClause> {
    let tokens = tokenize(sql);
    let (statement, _) = first_statement(&tokens);
    let statement_end = tokens
        .iter()
        .find(|token| token.depth == 0 && token.kind == TokenKind::Punct(';'))
        .map_or(sql.len(), |token| token.start);

    let where_index = statement
        .iter()
        .position(|token| is_keyword(sql, token, "WHERE"))?;
    let after_where = statement[where_index].end;

    let rest = &statement[where_index + 1..];
    let before_tail = rest
        .iter()
        .enumerate()
        .find(|(index, token)| {
            is_keyword(sql, token, "LIMIT")
                || is_keyword(sql, token, "RETURNING")
                || (is_keyword(sql, token, "ORDER")
                    && rest
                        .get(index + 1)
                        .is_some_and(|next| is_keyword(sql, next, "BY")))
        })
        .map_or(statement_end, |(_, token)| token.start);

    let raw = &sql[after_where..before_tail];
    let start = after_where + (raw.len() - raw.trim_start().len());
    let end = after_where + raw.trim_end().len();
    if start >= end {
        return None;
    }

    let mut condition = String::new();
    let mut parameters = Vec::new();
    let mut copied = start;
    for placeholder in bind_placeholders(sql, &tokens)
        .into_iter()
        .filter(|placeholder| placeholder.start >= start && placeholder.start < end)
    {
        condition.push_str(&sql[copied..placeholder.start]);
        condition.push('?');
        parameters.push(placeholder.index);
        copied = placeholder.end;
    }
    condition.push_str(&sql[copied..end]);

    let mut cursor = Cursor::new(sql, &statement);
    let table_alias = match cursor.next_word_upper().as_deref() {
        Some("DELETE") => delete_target(&mut cursor).and_then(|target| target.alias),
        Some("UPDATE") => update_target(&mut cursor).and_then(|target| target.alias),
        _ => None,
    };

    Some(FilterClause {
        condition,
        table_alias,
        parameters,
    })
}

/// One parameter reference in the statement text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placeholder {
    start: usize,
    end: usize,
    index: usize,
}

fn bind_placeholders(sql: &str, tokens: &[Token]) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut named: Vec<(&str, usize)> = Vec::new();
    let mut highest = 0_usize;

    for (position, token) in tokens.iter().enumerate() {
        let text = &sql[token.start..token.end];
        let attached = tokens
            .get(position + 1)
            .filter(|next| next.start == token.end && next.kind == TokenKind::Word);
        let after_colon = position
            .checked_sub(1)
            .and_then(|previous| tokens.get(previous))
            .is_some_and(|previous| {
                previous.end == token.start && previous.kind == TokenKind::Punct(':')
            });

        let (end, name) = match token.kind {
            TokenKind::Punct('?') => match attached {
                Some(next) if sql[next.start..next.end].bytes().all(|b| b.is_ascii_digit()) => {
                    let Ok(number) = sql[next.start..next.end].parse::<usize>() else {
                        continue;
                    };
                    if number == 0 {
                        continue;
                    }
                    highest = highest.max(number);
                    found.push(Placeholder {
                        start: token.start,
                        end: next.end,
                        index: number - 1,
                    });
                    continue;
                }
                _ => {
                    highest += 1;
                    found.push(Placeholder {
                        start: token.start,
                        end: token.end,
                        index: highest - 1,
                    });
                    continue;
                }
            },
            TokenKind::Punct(':') if !after_colon => match attached {
                Some(next) => (next.end, &sql[token.start..next.end]),
                None => continue,
            },
            TokenKind::Punct('@') => match attached {
                Some(next) => (next.end, &sql[token.start..next.end]),
                None => continue,
            },
            TokenKind::Word if text.len() > 1 && text.starts_with('$') => (token.end, text),
            _ => continue,
        };

        let index = match named.iter().find(|(seen, _)| *seen == name) {
            Some((_, index)) => *index,
            None => {
                highest += 1;
                named.push((name, highest - 1));
                highest - 1
            }
        };
        found.push(Placeholder {
            start: token.start,
            end,
            index,
        });
    }

    found
}

fn classify_statement(cursor: &mut Cursor<'_>) -> (StatementKind, Option<String>) {
    let Some(leading) = cursor.next_word_upper() else {
        return (StatementKind::Other, None);
    };

    match leading.as_str() {
        "DELETE" => (
            StatementKind::Delete,
            delete_target(cursor).map(|target| target.name),
        ),
        "TRUNCATE" => {
            cursor.eat_keyword("TABLE");
            (StatementKind::Delete, cursor.single_table())
        }
        "UPDATE" => (
            StatementKind::Update,
            update_target(cursor).map(|target| target.name),
        ),
        "ALTER" => {
            if !cursor.eat_keyword("TABLE") {
                return (StatementKind::Other, None);
            }
            cursor.eat_keyword("ONLY");
            cursor.eat_sequence(&["IF", "EXISTS"]);
            (StatementKind::Update, cursor.identifier())
        }
        "INSERT" => {
            cursor.eat_modifiers(&["LOW_PRIORITY", "DELAYED", "HIGH_PRIORITY", "IGNORE"]);
            cursor.eat_or_conflict_clause();
            if !cursor.eat_keyword("INTO") {
                return (StatementKind::Insert, None);
            }
            (StatementKind::Insert, cursor.identifier())
        }
        "CREATE" => classify_create(cursor),
        "DROP" => {
            cursor.eat_modifiers(&["TEMPORARY", "TEMP"]);
            if !cursor.eat_keyword("TABLE") {
                return (StatementKind::Other, None);
            }
            cursor.eat_sequence(&["IF", "EXISTS"]);
            (StatementKind::DropTable, cursor.single_table())
        }
        _ => (StatementKind::Other, None),
    }
}

fn classify_create(cursor: &mut Cursor<'_>) -> (StatementKind, Option<String>) {
    cursor.eat_sequence(&["OR", "REPLACE"]);
    cursor.eat_modifiers(&["TEMPORARY", "TEMP", "UNIQUE"]);

    if cursor.eat_keyword("TABLE") {
        cursor.eat_sequence(&["IF", "NOT", "EXISTS"]);
        return (StatementKind::CreateTable, cursor.identifier());
    }

    if cursor.eat_keyword("INDEX") || cursor.eat_keyword("DATABASE") || cursor.eat_keyword("SCHEMA")
    {
        return (StatementKind::Insert, None);
    }

    (StatementKind::Other, None)
}

/// The single table an UPDATE/DELETE writes to.
struct TableRef {
    name: String,
    alias: Option<String>,
}

fn delete_target(cursor: &mut Cursor<'_>) -> Option<TableRef> {
    cursor.eat_modifiers(&["LOW_PRIORITY", "QUICK", "IGNORE"]);
    // `DELETE t1 FROM t1 JOIN ...` and friends name several tables.
    if !cursor.eat_keyword("FROM") {
        return None;
    }

    let name = cursor.identifier()?;
    if cursor.peek_punct(',') || cursor.peek_keyword("USING") || cursor.peek_join() {
        return None;
    }
    let alias = cursor.skip_alias(&["WHERE", "ORDER", "LIMIT", "RETURNING"]);
    if cursor.peek_punct(',') || cursor.peek_keyword("USING") || cursor.peek_join() {
        return None;
    }
    Some(TableRef { name, alias })
}

fn update_target(cursor: &mut Cursor<'_>) -> Option<TableRef> {
    cursor.eat_modifiers(&["LOW_PRIORITY", "IGNORE"]);
    cursor.eat_or_conflict_clause();

    let name = cursor.identifier()?;
    let alias = cursor.skip_alias(&["SET"]);
    if cursor.peek_keyword("SET") {
        Some(TableRef { name, alias })
    } else {
        None
    }
}

fn is_keyword(sql: &str, token: &Token, keyword: &str) -> bool {
    token.kind == TokenKind::Word && sql[token.start..token.end].eq_ignore_ascii_case(keyword)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    QuotedIdent,
    Literal,
    Punct(char),
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
    depth: u32,
}

/// Splits SQL into words, quoted identifiers, string literals and single
/// punctuation bytes, skipping whitespace and comments. Non-ASCII bytes are
/// word bytes, so every token boundary is a char boundary.
fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut depth = 0_u32;
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        match byte {
            _ if byte.is_ascii_whitespace() => index += 1,
            b'-' if bytes.get(index + 1) == Some(&b'-') => {
                index = skip_line(bytes, index);
            }
            b'#' => index = skip_line(bytes, index),
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                index = find_subslice(bytes, index + 2, b"*/").map_or(bytes.len(), |end| end + 2);
            }
            b'\'' => {
                let end = skip_quoted(bytes, index, b'\'');
                tokens.push(Token {
                    kind: TokenKind::Literal,
                    start: index,
                    end,
                    depth,
                });
                index = end;
            }
            b'"' | b'`' => {
                let end = skip_quoted(bytes, index, byte);
                tokens.push(Token {
                    kind: TokenKind::QuotedIdent,
                    start: index,
                    end,
                    depth,
                });
                index = end;
            }
            b'[' => {
                let end = bytes[index..]
                    .iter()
                    .position(|candidate| *candidate == b']')
                    .map_or(bytes.len(), |offset| index + offset + 1);
                tokens.push(Token {
                    kind: TokenKind::QuotedIdent,
                    start: index,
                    end,
                    depth,
                });
                index = end;
            }
            b'(' => {
                tokens.push(Token {
                    kind: TokenKind::Punct('('),
                    start: index,
                    end: index + 1,
                    depth,
                });
                depth += 1;
                index += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                tokens.push(Token {
                    kind: TokenKind::Punct(')'),
                    start: index,
                    end: index + 1,
                    depth,
                });
                index += 1;
            }
            _ if is_word_byte(byte) => {
                let end = bytes[index..]
                    .iter()
                    .position(|candidate| !is_word_byte(*candidate))
                    .map_or(bytes.len(), |offset| index + offset);
                tokens.push(Token {
                    kind: TokenKind::Word,
                    start: index,
                    end,
                    depth,
                });
                index = end;
            }
            _ => {
                tokens.push(Token {
                    kind: TokenKind::Punct(char::from(byte)),
                    start: index,
                    end: index + 1,
                    depth,
                });
                index += 1;
            }
        }
    }

    tokens
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$' || byte >= 0x80
}

fn skip_line(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|candidate| *candidate == b'\n')
        .map_or(bytes.len(), |offset| from + offset + 1)
}

/// Returns the index just past the closing `quote`; a doubled quote is an
/// escaped quote character.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut index = open + 1;
    while index < bytes.len() {
        if bytes[index] == quote {
            if bytes.get(index + 1) == Some(&quote) {
                index += 2;
                continue;
            }
            return index + 1;
        }
        index += 1;
    }
    bytes.len()
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

/// Top-level tokens of the first statement, and whether anything follows it.
fn first_statement(tokens: &[Token]) -> (Vec<Token>, bool) {
    let top_level = tokens.iter().filter(|token| token.depth == 0);
    let mut statement = Vec::new();
    let mut terminated = false;
    let mut multi_statement = false;

    for token in top_level {
        if terminated {
            if token.kind != TokenKind::Punct(';') {
                multi_statement = true;
                break;
            }
            continue;
        }
        if token.kind == TokenKind::Punct(';') {
            terminated = true;
            continue;
        }
        statement.push(*token);
    }

    (statement, multi_statement)
}

struct Cursor<'a> {
    sql: &'a str,
    tokens: &'a [Token],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(sql: &'a str, tokens: &'a [Token]) -> Self {
        Self {
            sql,
            tokens,
            position: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn text(&self, token: &Token) -> &'a str {
        &self.sql[token.start..token.end]
    }

    fn next_word_upper(&mut self) -> Option<String> {
        let token = *self.peek()?;
        if token.kind != TokenKind::Word {
            return None;
        }
        self.position += 1;
        Some(self.text(&token).to_ascii_uppercase())
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek()
            .is_some_and(|token| is_keyword(self.sql, token, keyword))
    }

    fn peek_punct(&self, punct: char) -> bool {
        self.peek()
            .is_some_and(|token| token.kind == TokenKind::Punct(punct))
    }

    fn peek_join(&self) -> bool {
        ["JOIN", "INNER", "LEFT", "RIGHT", "CROSS", "NATURAL", "STRAIGHT_JOIN"]
            .iter()
            .any(|keyword| self.peek_keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn eat_sequence(&mut self, keywords: &[&str]) -> bool {
        let matches = keywords.iter().enumerate().all(|(offset, keyword)| {
            self.tokens
                .get(self.position + offset)
                .is_some_and(|token| is_keyword(self.sql, token, keyword))
        });
        if matches {
            self.position += keywords.len();
        }
        matches
    }

    fn eat_modifiers(&mut self, modifiers: &[&str]) {
        while modifiers.iter().any(|modifier| self.eat_keyword(modifier)) {}
    }

    /// SQLite's `OR REPLACE` / `OR IGNORE` / ... conflict clause.
    fn eat_or_conflict_clause(&mut self) {
        if self.peek_keyword("OR")
            && self
                .tokens
                .get(self.position + 1)
                .is_some_and(|token| token.kind == TokenKind::Word)
        {
            self.position += 2;
        }
    }

    /// Consumes `AS alias` or a bare alias unless the next word is one of
    /// `stop_words`, returning the alias as written.
    fn skip_alias(&mut self, stop_words: &[&str]) -> Option<String> {
        if self.eat_keyword("AS") {
            let token = *self.peek()?;
            self.position += 1;
            return Some(self.text(&token).to_string());
        }
        let token = *self.peek()?;
        if token.kind == TokenKind::Word
            && !stop_words
                .iter()
                .any(|keyword| is_keyword(self.sql, &token, keyword))
            && !self.peek_join()
            && !self.peek_keyword("USING")
        {
            self.position += 1;
            return Some(self.text(&token).to_string());
        }
        None
    }

    fn identifier_segment(&mut self) -> Option<String> {
        let token = *self.peek()?;
        let text = self.text(&token);
        let segment = match token.kind {
            TokenKind::Word => text.to_string(),
            TokenKind::QuotedIdent => unquote(text),
            TokenKind::Literal | TokenKind::Punct(_) => return None,
        };
        self.position += 1;
        Some(segment)
    }

    /// A possibly schema-qualified table name with quoting removed. A
    /// segment that itself holds a `.` stays quoted (see [`segment_name`]).
    fn identifier(&mut self) -> Option<String> {
        let mut name = segment_name(&self.identifier_segment()?);
        while self.peek_punct('.') {
            self.position += 1;
            let segment = self.identifier_segment()?;
            name.push('.');
            name.push_str(&segment_name(&segment));
        }
        Some(name)
    }

    /// An identifier that must not be followed by a list of further tables.
    fn single_table(&mut self) -> Option<String> {
        let table = self.identifier()?;
        if self.peek_punct(',') {
            None
        } else {
            Some(table)
        }
    }
}

fn unquote(text: &str) -> String {
    let mut chars = text.chars();
    let (open, close) = match chars.next() {
        Some('[') => ('[', ']'),
        Some(quote @ ('"' | '`')) => (quote, quote),
        _ => return text.to_string(),
    };
    let inner = text
        .strip_prefix(open)
        .and_then(|rest| rest.strip_suffix(close))
        .unwrap_or(&text[open.len_utf8()..]);
    if open == close {
        inner.replace(&format!("{close}{close}"), &close.to_string())
    } else {
        inner.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classify(sql: &str) -> Classification {
        HeuristicClassifier.classify(sql)
    }

    fn condition(sql: &str) -> Option<String> {
        scan_where_clause(sql).map(|clause| clause.condition)
    }

    fn assert_classified(sql: &str, kind: StatementKind, table: Option<&str>) {
        let classification = classify(sql);
        assert_eq!(classification.kind, kind, "kind for {sql}");
        assert_eq!(
            classification.target_table.as_deref(),
            table,
            "target for {sql}"
        );
    }

    #[test]
    fn delete_like_statements() {
        assert_classified("DELETE FROM users WHERE id = 1", StatementKind::Delete, Some("users"));
        assert_classified("delete from `users`", StatementKind::Delete, Some("users"));
        assert_classified("TRUNCATE TABLE logs", StatementKind::Delete, Some("logs"));
        assert_classified("truncate logs", StatementKind::Delete, Some("logs"));
        assert_classified(
            "DELETE LOW_PRIORITY FROM main.users WHERE id = 1",
            StatementKind::Delete,
            Some("main.users"),
        );
    }

    #[test]
    fn multi_table_deletes_have_no_target() {
        assert_classified(
            "DELETE t1 FROM t1 JOIN t2 ON t1.id = t2.id",
            StatementKind::Delete,
            None,
        );
        assert_classified("DELETE FROM a, b WHERE a.id = b.id", StatementKind::Delete, None);
        assert_classified(
            "DELETE FROM a USING a, b WHERE a.id = b.id",
            StatementKind::Delete,
            None,
        );
    }

    #[test]
    fn update_like_statements() {
        assert_classified("UPDATE users SET name = 'b' WHERE id = 5", StatementKind::Update, Some("users"));
        assert_classified("UPDATE \"Users\" u SET name = 'b'", StatementKind::Update, Some("Users"));
        assert_classified("UPDATE OR IGNORE users SET a = 1", StatementKind::Update, Some("users"));
        assert_classified("UPDATE a, b SET a.x = b.x", StatementKind::Update, None);
        assert_classified(
            "UPDATE a JOIN b ON a.id = b.id SET a.x = b.x",
            StatementKind::Update,
            None,
        );
        assert_classified(
            "ALTER TABLE users ADD COLUMN email TEXT",
            StatementKind::Update,
            Some("users"),
        );
        assert_classified("ALTER TABLE users DROP COLUMN email", StatementKind::Update, Some("users"));
    }

    #[test]
    fn insert_and_create_statements() {
        assert_classified("INSERT INTO t (name) VALUES ('a')", StatementKind::Insert, Some("t"));
        assert_classified("insert ignore into [t] values (1)", StatementKind::Insert, Some("t"));
        assert_classified("INSERT OR REPLACE INTO t VALUES (1)", StatementKind::Insert, Some("t"));
        assert_classified(
            "CREATE TABLE IF NOT EXISTS audit (id INTEGER PRIMARY KEY)",
            StatementKind::CreateTable,
            Some("audit"),
        );
        assert_classified("CREATE TEMP TABLE scratch (x)", StatementKind::CreateTable, Some("scratch"));
        assert_classified("CREATE INDEX idx_name ON t(name)", StatementKind::Insert, None);
        assert_classified("CREATE UNIQUE INDEX idx ON t(name)", StatementKind::Insert, None);
        assert_classified("CREATE DATABASE shop", StatementKind::Insert, None);
        assert_classified("CREATE VIEW v AS SELECT 1", StatementKind::Other, None);
    }

    #[test]
    fn drop_statements() {
        assert_classified("DROP TABLE users", StatementKind::DropTable, Some("users"));
        assert_classified("drop table if exists `users`", StatementKind::DropTable, Some("users"));
        assert_classified("DROP TABLE a, b", StatementKind::DropTable, None);
        assert_classified("DROP INDEX idx", StatementKind::Other, None);
    }

    #[test]
    fn reads_and_procedural_sql_are_other() {
        assert_classified("SELECT * FROM users", StatementKind::Other, None);
        assert_classified(
            "WITH doomed AS (SELECT id FROM t) DELETE FROM t WHERE id IN doomed",
            StatementKind::Other,
            None,
        );
        assert_classified("", StatementKind::Other, None);
        assert_classified("   -- nothing here\n", StatementKind::Other, None);
    }

    #[test]
    fn leading_comments_are_ignored() {
        assert_classified(
            "/* audit */ -- note\n  DELETE FROM users",
            StatementKind::Delete,
            Some("users"),
        );
    }

    #[test]
    fn batches_keep_first_kind_but_drop_target() {
        let classification = classify("DELETE FROM a; DROP TABLE b");
        assert_eq!(classification.kind, StatementKind::Delete);
        assert!(classification.multi_statement);
        assert_eq!(classification.target_table, None);

        let trailing = classify("DELETE FROM a;");
        assert!(!trailing.multi_statement);
        assert_eq!(trailing.target_table.as_deref(), Some("a"));
    }

    #[test]
    fn where_clause_stops_at_order_limit_and_returning() {
        assert_eq!(
            condition("DELETE FROM t WHERE id > 3 ORDER BY id LIMIT 2").as_deref(),
            Some("id > 3")
        );
        assert_eq!(
            condition("UPDATE t SET a = 1 WHERE name = 'x' RETURNING id").as_deref(),
            Some("name = 'x'")
        );
        assert_eq!(
            condition("DELETE FROM t WHERE id = 1;").as_deref(),
            Some("id = 1")
        );
        assert_eq!(condition("DELETE FROM t"), None);
        assert_eq!(condition("DELETE FROM t WHERE "), None);
    }

    #[test]
    fn where_clause_ignores_keywords_in_literals_and_subqueries() {
        assert_eq!(
            condition("DELETE FROM t WHERE note = 'limit where' AND id = 1").as_deref(),
            Some("note = 'limit where' AND id = 1")
        );
        assert_eq!(
            condition(
                "DELETE FROM t WHERE id IN (SELECT id FROM s ORDER BY id LIMIT 1) LIMIT 5"
            )
            .as_deref(),
            Some("id IN (SELECT id FROM s ORDER BY id LIMIT 1)")
        );
        assert_eq!(
            condition("UPDATE t SET a = (SELECT b FROM s WHERE s.k = 1) WHERE id = 2")
                .as_deref(),
            Some("id = 2")
        );
    }

    #[test]
    fn where_clause_maps_positional_placeholders() {
        let clause = scan_where_clause(
            "UPDATE t SET a = ?, b = '?' WHERE id = ? AND k IN (?, ?) LIMIT ?",
        );
        assert_eq!(
            clause,
            Some(FilterClause {
                condition: "id = ? AND k IN (?, ?)".to_string(),
                table_alias: None,
                parameters: vec![1, 2, 3],
            })
        );
    }

    #[test]
    fn numbered_placeholders_keep_their_statement_index() {
        let clause = scan_where_clause("UPDATE users SET name = ?1 WHERE id = ?2 OR parent = ?2");
        assert_eq!(
            clause,
            Some(FilterClause {
                condition: "id = ? OR parent = ?".to_string(),
                table_alias: None,
                parameters: vec![1, 1],
            })
        );

        let mixed = scan_where_clause("DELETE FROM t WHERE a = ?3 AND b = ?");
        assert_eq!(mixed.map(|clause| clause.parameters), Some(vec![2, 3]));
    }

    #[test]
    fn named_placeholders_share_one_index_per_name() {
        let clause = scan_where_clause(
            "UPDATE t SET a = :value, b = @other WHERE id = :id AND (a <> :value OR tag = $tag)",
        );
        assert_eq!(
            clause,
            Some(FilterClause {
                condition: "id = ? AND (a <> ? OR tag = ?)".to_string(),
                table_alias: None,
                parameters: vec![2, 0, 3],
            })
        );
    }

    #[test]
    fn casts_are_not_placeholders() {
        let clause = scan_where_clause("DELETE FROM t WHERE created::date = ? AND note = ':x'");
        assert_eq!(
            clause,
            Some(FilterClause {
                condition: "created::date = ? AND note = ':x'".to_string(),
                table_alias: None,
                parameters: vec![0],
            })
        );
    }

    #[test]
    fn where_clause_reports_the_target_alias() {
        let aliased = scan_where_clause("UPDATE users AS u SET name = 'x' WHERE u.id = 1");
        assert_eq!(
            aliased.and_then(|clause| clause.table_alias).as_deref(),
            Some("u")
        );

        let bare = scan_where_clause("DELETE FROM users u WHERE u.id = 1");
        assert_eq!(bare.and_then(|clause| clause.table_alias).as_deref(), Some("u"));

        let plain = scan_where_clause("DELETE FROM users WHERE id = 1");
        assert_eq!(plain.and_then(|clause| clause.table_alias), None);
    }

    #[test]
    fn dotted_quoted_names_stay_one_segment() {
        assert_classified(
            "DELETE FROM \"my.table\" WHERE id = 1",
            StatementKind::Delete,
            Some("\"my.table\""),
        );
        assert_classified(
            "UPDATE main.[odd.name] SET a = 1",
            StatementKind::Update,
            Some("main.\"odd.name\""),
        );
    }

    #[test]
    fn unquote_handles_each_quote_style() {
        assert_eq!(unquote("\"a\"\"b\""), "a\"b");
        assert_eq!(unquote("`t`"), "t");
        assert_eq!(unquote("[my table]"), "my table");
        assert_eq!(unquote("\"open"), "open");
    }

    fn recase(keyword: &str, upper: bool) -> String {
        if upper {
            keyword.to_ascii_uppercase()
        } else {
            keyword.to_ascii_lowercase()
        }
    }

    proptest! {
        #[test]
        fn prop_classification_ignores_case_and_spacing(
            table in "t_[a-z0-9_]{0,10}",
            template in 0usize..5,
            upper in any::<bool>(),
            gap in 1usize..4,
        ) {
            let space = " ".repeat(gap);
            let (sql, expected) = match template {
                0 => (
                    format!("{}{space}{}{space}{table} WHERE id = 1", recase("delete", upper), recase("from", upper)),
                    StatementKind::Delete,
                ),
                1 => (
                    format!("{}{space}{table}{space}{} a = 1", recase("update", upper), recase("set", upper)),
                    StatementKind::Update,
                ),
                2 => (
                    format!("{}{space}{}{space}{table} (a) VALUES (1)", recase("insert", upper), recase("into", upper)),
                    StatementKind::Insert,
                ),
                3 => (
                    format!("{}{space}{}{space}{table} (id INTEGER)", recase("create", upper), recase("table", upper)),
                    StatementKind::CreateTable,
                ),
                _ => (
                    format!("{}{space}{}{space}{table}", recase("drop", upper), recase("table", upper)),
                    StatementKind::DropTable,
                ),
            };

            let classification = classify(&sql);
            prop_assert_eq!(classification.kind, expected);
            prop_assert_eq!(classification.target_table, Some(table));
        }
    }
}
