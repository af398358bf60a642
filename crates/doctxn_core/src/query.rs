//! Statements routed through an attempt.
//!
//! A small key-addressed statement language. Every statement names the keys it
//! touches, so execution is a sequence of ordinary attempt operations and
//! inherits their staging, conflict detection and isolation.
//!
//! ```text
//! SELECT * FROM <keyspace> USE KEYS <keys>
//! INSERT INTO <keyspace> (KEY, VALUE) VALUES (<key>, <value>)[, ...]
//! UPSERT INTO <keyspace> (KEY, VALUE) VALUES (<key>, <value>)[, ...]
//! UPDATE <keyspace> USE KEYS <keys> SET <path> = <value>[, ...]
//! DELETE FROM <keyspace> USE KEYS <keys>
//! ```
//!
//! A keyspace is `collection` or `scope.collection`, either part optionally
//! back-quoted. Keys and values are JSON literals or positional parameters
//! `$1`..`$n`; `<keys>` is a single key or an array of keys.

use crate::attempt::AttemptContext;
use crate::error::{TxnError, TxnResult};
use doctxn_store::{CollectionRef, DocumentStore};
use serde_json::{Map, Value};

/// Options for [`AttemptContext::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Values bound to `$1`, `$2`, ...
    pub parameters: Vec<Value>,
    /// Rejects statements that modify documents.
    pub read_only: bool,
}

impl QueryOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional parameter.
    pub fn with_parameter(mut self, value: Value) -> Self {
        self.parameters.push(value);
        self
    }

    /// Sets all positional parameters.
    pub fn with_parameters(mut self, values: Vec<Value>) -> Self {
        self.parameters = values;
        self
    }

    /// Marks the query read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Result of a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Documents returned by a SELECT, in key order of the statement.
    pub rows: Vec<Value>,
    /// Number of documents staged.
    pub mutation_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Select {
        keyspace: CollectionRef,
        keys: Vec<String>,
    },
    Insert {
        keyspace: CollectionRef,
        rows: Vec<(String, Value)>,
        upsert: bool,
    },
    Update {
        keyspace: CollectionRef,
        keys: Vec<String>,
        assignments: Vec<(Vec<String>, Value)>,
    },
    Delete {
        keyspace: CollectionRef,
        keys: Vec<String>,
    },
}

impl Statement {
    fn is_mutating(&self) -> bool {
        !matches!(self, Statement::Select { .. })
    }
}

/// Parses and runs a statement inside an attempt.
pub(crate) fn execute<S: DocumentStore + ?Sized>(
    ctx: &mut AttemptContext<'_, S>,
    statement: &str,
    options: &QueryOptions,
) -> TxnResult<QueryResult> {
    let parsed = parse(statement, &options.parameters)?;
    if options.read_only && parsed.is_mutating() {
        return Err(TxnError::query("statement modifies documents in a read-only query"));
    }

    let mut result = QueryResult::default();
    match parsed {
        Statement::Select { keyspace, keys } => {
            for key in keys {
                if let Some(doc) = ctx.get_optional(&keyspace, &key)? {
                    result.rows.push(doc.content);
                }
            }
        }
        Statement::Insert {
            keyspace,
            rows,
            upsert,
        } => {
            for (key, value) in rows {
                if upsert && ctx.exists(&keyspace, &key)? {
                    ctx.replace(&keyspace, &key, value)?;
                } else {
                    ctx.insert(&keyspace, &key, value)?;
                }
                result.mutation_count += 1;
            }
        }
        Statement::Update {
            keyspace,
            keys,
            assignments,
        } => {
            for key in keys {
                let Some(doc) = ctx.get_optional(&keyspace, &key)? else {
                    continue;
                };
                let mut content = doc.content;
                for (path, value) in &assignments {
                    set_path(&mut content, path, value.clone())?;
                }
                ctx.replace(&keyspace, &key, content)?;
                result.mutation_count += 1;
            }
        }
        Statement::Delete { keyspace, keys } => {
            for key in keys {
                if ctx.exists(&keyspace, &key)? {
                    ctx.remove(&keyspace, &key)?;
                    result.mutation_count += 1;
                }
            }
        }
    }
    Ok(result)
}

/// Assigns `value` at a dotted path, creating intermediate objects.
fn set_path(target: &mut Value, path: &[String], value: Value) -> TxnResult<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(TxnError::query("empty field path"));
    };
    let mut current = target;
    for part in parents {
        let object = current
            .as_object_mut()
            .ok_or_else(|| TxnError::query(format!("cannot set field {part} on a non-object")))?;
        current = object
            .entry(part.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let object = current
        .as_object_mut()
        .ok_or_else(|| TxnError::query(format!("cannot set field {last} on a non-object")))?;
    object.insert(last.clone(), value);
    Ok(())
}

fn parse(statement: &str, params: &[Value]) -> TxnResult<Statement> {
    let mut p = Parser::new(statement, params);
    let parsed = match p.keyword()?.as_str() {
        "SELECT" => {
            p.expect_symbol('*')?;
            p.expect_keyword("FROM")?;
            let keyspace = p.keyspace()?;
            let keys = p.use_keys()?;
            Statement::Select { keyspace, keys }
        }
        kw @ ("INSERT" | "UPSERT") => {
            p.expect_keyword("INTO")?;
            let keyspace = p.keyspace()?;
            p.expect_symbol('(')?;
            p.expect_keyword("KEY")?;
            p.expect_symbol(',')?;
            p.expect_keyword("VALUE")?;
            p.expect_symbol(')')?;
            p.expect_keyword("VALUES")?;
            let mut rows = Vec::new();
            loop {
                p.expect_symbol('(')?;
                let key = p.key()?;
                p.expect_symbol(',')?;
                let value = p.value()?;
                p.expect_symbol(')')?;
                rows.push((key, value));
                if !p.eat_symbol(',') {
                    break;
                }
            }
            Statement::Insert {
                keyspace,
                rows,
                upsert: kw == "UPSERT",
            }
        }
        "UPDATE" => {
            let keyspace = p.keyspace()?;
            let keys = p.use_keys()?;
            p.expect_keyword("SET")?;
            let mut assignments = Vec::new();
            loop {
                let path = p.path()?;
                p.expect_symbol('=')?;
                let value = p.value()?;
                assignments.push((path, value));
                if !p.eat_symbol(',') {
                    break;
                }
            }
            Statement::Update {
                keyspace,
                keys,
                assignments,
            }
        }
        "DELETE" => {
            p.expect_keyword("FROM")?;
            let keyspace = p.keyspace()?;
            let keys = p.use_keys()?;
            Statement::Delete { keyspace, keys }
        }
        other => return Err(TxnError::query(format!("unsupported statement {other}"))),
    };
    p.finish()?;
    Ok(parsed)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    params: &'a [Value],
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, params: &'a [Value]) -> Self {
        Self {
            input,
            pos: 0,
            params,
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.rest().chars().next()
    }

    fn error(&self, expected: &str) -> TxnError {
        TxnError::query(format!("expected {expected} at offset {}", self.pos))
    }

    fn word(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    fn keyword(&mut self) -> TxnResult<String> {
        self.word()
            .map(str::to_ascii_uppercase)
            .ok_or_else(|| self.error("keyword"))
    }

    fn expect_keyword(&mut self, expected: &str) -> TxnResult<()> {
        let start = self.pos;
        match self.word() {
            Some(w) if w.eq_ignore_ascii_case(expected) => Ok(()),
            _ => {
                self.pos = start;
                Err(self.error(expected))
            }
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(symbol) {
            self.pos += symbol.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> TxnResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.error(&format!("'{symbol}'")))
        }
    }

    /// A bare or back-quoted identifier.
    fn identifier(&mut self) -> TxnResult<String> {
        if self.eat_symbol('`') {
            let rest = self.rest();
            let end = rest.find('`').ok_or_else(|| self.error("closing '`'"))?;
            self.pos += end + 1;
            return Ok(rest[..end].to_string());
        }
        self.word()
            .map(str::to_string)
            .ok_or_else(|| self.error("identifier"))
    }

    fn keyspace(&mut self) -> TxnResult<CollectionRef> {
        let first = self.identifier()?;
        if self.eat_symbol('.') {
            let second = self.identifier()?;
            Ok(CollectionRef::new(first, second))
        } else {
            Ok(CollectionRef::in_default_scope(first))
        }
    }

    fn path(&mut self) -> TxnResult<Vec<String>> {
        let mut parts = vec![self.identifier()?];
        while self.eat_symbol('.') {
            parts.push(self.identifier()?);
        }
        Ok(parts)
    }

    fn use_keys(&mut self) -> TxnResult<Vec<String>> {
        self.expect_keyword("USE")?;
        self.expect_keyword("KEYS")?;
        match self.value()? {
            Value::String(key) => Ok(vec![key]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(key) => Ok(key),
                    other => Err(TxnError::query(format!("key must be a string, got {other}"))),
                })
                .collect(),
            other => Err(TxnError::query(format!("keys must be a string or array, got {other}"))),
        }
    }

    fn key(&mut self) -> TxnResult<String> {
        match self.value()? {
            Value::String(key) => Ok(key),
            other => Err(TxnError::query(format!("key must be a string, got {other}"))),
        }
    }

    /// A JSON literal or a `$n` parameter.
    fn value(&mut self) -> TxnResult<Value> {
        match self.peek() {
            Some('$') => {
                self.pos += 1;
                let digits = self.word().ok_or_else(|| self.error("parameter number"))?;
                let index: usize = digits
                    .parse()
                    .map_err(|_| TxnError::query(format!("invalid parameter ${digits}")))?;
                index
                    .checked_sub(1)
                    .and_then(|i| self.params.get(i))
                    .cloned()
                    .ok_or_else(|| TxnError::query(format!("parameter ${index} is not bound")))
            }
            Some('{' | '[' | '"') => {
                // Self-delimiting literals
                let mut stream =
                    serde_json::Deserializer::from_str(self.rest()).into_iter::<Value>();
                let value = stream
                    .next()
                    .ok_or_else(|| self.error("value"))?
                    .map_err(|e| TxnError::query(format!("invalid literal: {e}")))?;
                self.pos += stream.byte_offset();
                Ok(value)
            }
            Some(_) => {
                let rest = self.rest();
                let len = rest
                    .find(|c: char| c.is_whitespace() || matches!(c, ',' | ')'))
                    .unwrap_or(rest.len());
                let literal = &rest[..len];
                let value = serde_json::from_str(literal)
                    .map_err(|_| TxnError::query(format!("invalid literal {literal}")))?;
                self.pos += len;
                Ok(value)
            }
            None => Err(self.error("value")),
        }
    }

    fn finish(&mut self) -> TxnResult<()> {
        self.eat_symbol(';');
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.error("end of statement")),
        }
    }
}
