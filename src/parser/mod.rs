//! Pipeline DSL compiler front end: lexer, AST, and recursive-descent parser.
//!
//! The parser turns raw pipeline text into a [`ast::Pipeline`]. Embedded
//! SELECT text is captured verbatim (the SQL engine parses it downstream),
//! and conditional blocks nest arbitrarily.

pub mod ast;
pub mod lexer;

use std::path::Path;

use serde_json::Value;

use crate::errors::{Result, SqlFlowError};
use ast::{
    Branch, ConditionalBlock, CreateTableAs, Export, Include, Load, LoadMode, Pipeline, Set,
    SourceDefinition, Statement,
};
use lexer::{line_snippet, Lexer, Token, TokenKind};

/// Keywords that terminate a branch body inside a conditional block.
const BRANCH_TERMINATORS: &[&str] = &["ELSEIF", "ELSE", "ENDIF", "END"];

/// Parse pipeline text into an AST. `name` is the pipeline name used in
/// plans and watermark keys, usually the file stem.
pub fn parse(src: &str, name: &str) -> Result<Pipeline> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
    };
    let statements = parser.parse_statements(&[])?;
    Ok(Pipeline {
        name: name.to_string(),
        statements,
    })
}

/// Parse a pipeline file; the pipeline is named after the file stem.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Pipeline> {
    let path = path.as_ref();
    let src = std::fs::read_to_string(path)?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pipeline")
        .to_string();
    parse(&src, &name)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn cur(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.cur().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at_eof(&self) -> bool {
        matches!(self.cur().kind, TokenKind::Eof)
    }

    fn expected(&self, expected: impl Into<String>) -> SqlFlowError {
        let tok = self.cur();
        SqlFlowError::Parse {
            line: tok.line,
            column: tok.column,
            expected: expected.into(),
            found: tok.describe(),
            snippet: line_snippet(self.src, tok.line),
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<Token> {
        if self.cur().is_keyword(kw) {
            Ok(self.advance())
        } else {
            Err(self.expected(format!("'{kw}'")))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match &self.cur().kind {
            TokenKind::Ident(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.expected(what)),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String> {
        match &self.cur().kind {
            TokenKind::Str(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.expected(what)),
        }
    }

    fn expect_json(&mut self, what: &str) -> Result<Value> {
        match &self.cur().kind {
            TokenKind::Json(raw) => {
                let tok = self.cur().clone();
                let value: Value = serde_json::from_str(raw).map_err(|e| SqlFlowError::Parse {
                    line: tok.line,
                    column: tok.column,
                    expected: "a valid JSON object".to_string(),
                    found: e.to_string(),
                    snippet: line_snippet(self.src, tok.line),
                })?;
                self.advance();
                Ok(value)
            }
            _ => Err(self.expected(what)),
        }
    }

    fn expect_semicolon(&mut self) -> Result<()> {
        match self.cur().kind {
            TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            _ => Err(self.expected("';'")),
        }
    }

    /// Statements carrying trailing SQL may also end at EOF or at a
    /// conditional keyword.
    fn expect_statement_end(&mut self) -> Result<()> {
        match &self.cur().kind {
            TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            TokenKind::Ident(s)
                if BRANCH_TERMINATORS.iter().any(|kw| s.eq_ignore_ascii_case(kw)) =>
            {
                Ok(())
            }
            _ => Err(self.expected("';'")),
        }
    }

    fn parse_statements(&mut self, terminators: &[&str]) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            if self.at_eof() || self.cur().is_any_keyword(terminators) {
                return Ok(statements);
            }
            statements.push(self.parse_statement()?);
        }
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        let tok = self.cur().clone();
        match &tok.kind {
            TokenKind::Ident(kw) if kw.eq_ignore_ascii_case("SOURCE") => self.parse_source(),
            TokenKind::Ident(kw) if kw.eq_ignore_ascii_case("LOAD") => self.parse_load(),
            TokenKind::Ident(kw) if kw.eq_ignore_ascii_case("CREATE") => self.parse_create(),
            TokenKind::Ident(kw) if kw.eq_ignore_ascii_case("EXPORT") => self.parse_export(),
            TokenKind::Ident(kw) if kw.eq_ignore_ascii_case("SET") => self.parse_set(),
            TokenKind::Ident(kw) if kw.eq_ignore_ascii_case("INCLUDE") => self.parse_include(),
            TokenKind::Ident(kw) if kw.eq_ignore_ascii_case("IF") => self.parse_conditional(),
            TokenKind::Ident(kw)
                if ["ELSEIF", "ELSE", "ENDIF", "THEN"]
                    .iter()
                    .any(|c| kw.eq_ignore_ascii_case(c)) =>
            {
                Err(self.expected(format!(
                    "a statement; '{}' is only valid inside an IF block",
                    kw.to_uppercase()
                )))
            }
            _ => Err(self.expected(
                "a statement keyword (SOURCE, LOAD, CREATE, EXPORT, SET, INCLUDE, IF)",
            )),
        }
    }

    fn parse_source(&mut self) -> Result<Statement> {
        let line = self.cur().line;
        self.advance();
        let name = self.expect_ident("source name")?;
        self.expect_keyword("TYPE")?;
        let connector_type = self.expect_ident("connector type")?;
        self.expect_keyword("PARAMS")?;
        let params = self.expect_json("PARAMS JSON object")?;
        self.expect_semicolon()?;
        Ok(Statement::Source(SourceDefinition {
            name,
            connector_type,
            params,
            line,
        }))
    }

    fn parse_load(&mut self) -> Result<Statement> {
        let line = self.cur().line;
        self.advance();
        let target_table = self.expect_ident("target table name")?;
        self.expect_keyword("FROM")?;
        let source_name = self.expect_ident("source name")?;

        let mut mode = LoadMode::Replace;
        let mut merge_keys = Vec::new();
        if self.cur().is_keyword("MODE") {
            self.advance();
            let mode_kw = self.expect_ident("REPLACE, APPEND, or MERGE")?;
            mode = match mode_kw.to_uppercase().as_str() {
                "REPLACE" => LoadMode::Replace,
                "APPEND" => LoadMode::Append,
                "MERGE" => LoadMode::Merge,
                _ => return Err(self.expected("REPLACE, APPEND, or MERGE")),
            };
            if self.cur().is_keyword("KEYS") || self.cur().is_keyword("KEY") {
                if mode != LoadMode::Merge {
                    return Err(self.expected("';' (KEYS is only valid with MODE MERGE)"));
                }
                self.advance();
                merge_keys = self.parse_key_list()?;
            } else if mode == LoadMode::Merge {
                return Err(self.expected("KEYS (...) after MODE MERGE"));
            }
        }
        self.expect_semicolon()?;
        Ok(Statement::Load(Load {
            target_table,
            source_name,
            mode,
            merge_keys,
            line,
        }))
    }

    fn parse_key_list(&mut self) -> Result<Vec<String>> {
        if !matches!(self.cur().kind, TokenKind::LParen) {
            return Err(self.expected("'(' to open the key list"));
        }
        self.advance();
        let mut keys = vec![self.expect_ident("key column name")?];
        loop {
            match self.cur().kind {
                TokenKind::Comma => {
                    self.advance();
                    keys.push(self.expect_ident("key column name")?);
                }
                TokenKind::RParen => {
                    self.advance();
                    return Ok(keys);
                }
                _ => return Err(self.expected("',' or ')' in key list")),
            }
        }
    }

    fn parse_create(&mut self) -> Result<Statement> {
        let line = self.cur().line;
        self.advance();
        self.expect_keyword("TABLE")?;
        let table = self.expect_ident("table name")?;
        self.expect_keyword("AS")?;
        let sql = self.capture_sql(false)?;
        self.expect_statement_end()?;
        Ok(Statement::CreateTableAs(CreateTableAs { table, sql, line }))
    }

    fn parse_export(&mut self) -> Result<Statement> {
        let line = self.cur().line;
        self.advance();
        let sql = self.capture_sql(true)?;
        self.expect_keyword("TO")?;
        let target = self.expect_string("destination string after TO")?;
        self.expect_keyword("TYPE")?;
        let connector_type = self.expect_ident("destination connector type")?;
        let options = if self.cur().is_keyword("OPTIONS") {
            self.advance();
            self.expect_json("OPTIONS JSON object")?
        } else {
            Value::Object(serde_json::Map::new())
        };
        self.expect_statement_end()?;
        Ok(Statement::Export(Export {
            sql,
            target,
            connector_type,
            options,
            line,
        }))
    }

    fn parse_set(&mut self) -> Result<Statement> {
        let line = self.cur().line;
        self.advance();
        let name = self.expect_ident("variable name")?;
        if !matches!(self.cur().kind, TokenKind::Assign) {
            return Err(self.expected("'='"));
        }
        self.advance();
        let value = match &self.cur().kind {
            TokenKind::Str(s) => {
                let v = s.clone();
                self.advance();
                v
            }
            TokenKind::Number(n) => {
                let v = n.clone();
                self.advance();
                v
            }
            _ => return Err(self.expected("a string or number value")),
        };
        self.expect_semicolon()?;
        Ok(Statement::Set(Set { name, value, line }))
    }

    fn parse_include(&mut self) -> Result<Statement> {
        let line = self.cur().line;
        self.advance();
        let path = self.expect_string("include path string")?;
        let alias = if self.cur().is_keyword("AS") {
            self.advance();
            Some(self.expect_ident("include alias")?)
        } else {
            None
        };
        self.expect_semicolon()?;
        Ok(Statement::Include(Include { path, alias, line }))
    }

    fn parse_conditional(&mut self) -> Result<Statement> {
        let line = self.cur().line;
        self.advance();
        let condition = self.capture_condition()?;
        self.expect_keyword("THEN")?;
        let branch_line = line;
        let steps = self.parse_statements(BRANCH_TERMINATORS)?;
        let mut branches = vec![Branch {
            condition,
            steps,
            line: branch_line,
        }];
        let mut else_steps = Vec::new();

        loop {
            if self.at_eof() {
                return Err(self.expected("'ENDIF' to close the conditional block"));
            }
            // ELSE IF spelled as two tokens folds into an ELSEIF branch.
            if self.cur().is_keyword("ELSEIF")
                || (self.cur().is_keyword("ELSE") && self.peek_next_is_keyword("IF"))
            {
                let branch_line = self.cur().line;
                if self.cur().is_keyword("ELSE") {
                    self.advance();
                }
                self.advance();
                let condition = self.capture_condition()?;
                self.expect_keyword("THEN")?;
                let steps = self.parse_statements(BRANCH_TERMINATORS)?;
                branches.push(Branch {
                    condition,
                    steps,
                    line: branch_line,
                });
            } else if self.cur().is_keyword("ELSE") {
                self.advance();
                else_steps = self.parse_statements(&["ENDIF", "END"])?;
            } else if self.cur().is_keyword("ENDIF") {
                self.advance();
                break;
            } else if self.cur().is_keyword("END") {
                self.advance();
                self.expect_keyword("IF")?;
                break;
            } else {
                return Err(self.expected("'ELSEIF', 'ELSE', or 'ENDIF'"));
            }
        }
        // The closing semicolon after ENDIF is conventional but optional.
        if matches!(self.cur().kind, TokenKind::Semicolon) {
            self.advance();
        }
        Ok(Statement::Conditional(ConditionalBlock {
            branches,
            else_steps,
            line,
        }))
    }

    fn peek_next_is_keyword(&self, kw: &str) -> bool {
        self.tokens
            .get(self.pos + 1)
            .map(|t| t.is_keyword(kw))
            .unwrap_or(false)
    }

    /// Capture condition text verbatim up to the THEN keyword.
    fn capture_condition(&mut self) -> Result<String> {
        let start = self.cur().start;
        let mut depth = 0usize;
        loop {
            match &self.cur().kind {
                TokenKind::Eof | TokenKind::Semicolon => {
                    return Err(self.expected("'THEN' after the IF condition"))
                }
                TokenKind::LParen => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RParen => {
                    depth = depth.saturating_sub(1);
                    self.advance();
                }
                TokenKind::Ident(s) if depth == 0 && s.eq_ignore_ascii_case("THEN") => {
                    let end = self.cur().start;
                    let text = self.src[start..end].trim().to_string();
                    if text.is_empty() {
                        return Err(self.expected("a condition expression before THEN"));
                    }
                    return Ok(text);
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Capture SELECT text verbatim until a top-level terminator: `;`,
    /// `TO` (when `stop_at_to`), a conditional keyword, or end of input.
    /// The terminator token is left for the caller.
    fn capture_sql(&mut self, stop_at_to: bool) -> Result<String> {
        let start = self.cur().start;
        let mut depth = 0usize;
        loop {
            match &self.cur().kind {
                TokenKind::Eof => break,
                TokenKind::Semicolon if depth == 0 => break,
                TokenKind::LParen => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RParen => {
                    depth = depth.saturating_sub(1);
                    self.advance();
                }
                TokenKind::Ident(s)
                    if depth == 0 && stop_at_to && s.eq_ignore_ascii_case("TO") =>
                {
                    break
                }
                TokenKind::Ident(s)
                    if depth == 0
                        && ["ELSEIF", "ELSE", "ENDIF"]
                            .iter()
                            .any(|kw| s.eq_ignore_ascii_case(kw)) =>
                {
                    break
                }
                _ => {
                    self.advance();
                }
            }
        }
        let end = self.cur().start;
        let sql = self.src[start..end].trim().to_string();
        if sql.is_empty() {
            return Err(self.expected("SQL SELECT text"));
        }
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_statement() {
        let p = parse(
            r#"SOURCE orders TYPE CSV PARAMS {"path": "data/orders.csv", "has_header": true};"#,
            "t",
        )
        .unwrap();
        match &p.statements[0] {
            Statement::Source(s) => {
                assert_eq!(s.name, "orders");
                assert_eq!(s.connector_type, "CSV");
                assert_eq!(s.params["path"], "data/orders.csv");
                assert_eq!(s.line, 1);
            }
            other => panic!("expected source, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_load_defaults_to_replace() {
        let p = parse("LOAD orders_raw FROM orders;", "t").unwrap();
        match &p.statements[0] {
            Statement::Load(l) => {
                assert_eq!(l.mode, LoadMode::Replace);
                assert!(l.merge_keys.is_empty());
            }
            other => panic!("expected load, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_merge_requires_keys() {
        let err = parse("LOAD t FROM s MODE MERGE;", "t").unwrap_err();
        assert!(err.to_string().contains("KEYS"));
    }

    #[test]
    fn test_parse_merge_with_composite_keys() {
        let p = parse("LOAD prices FROM feed MODE MERGE KEYS (product_id, region);", "t").unwrap();
        match &p.statements[0] {
            Statement::Load(l) => {
                assert_eq!(l.mode, LoadMode::Merge);
                assert_eq!(l.merge_keys, vec!["product_id", "region"]);
            }
            other => panic!("expected load, got {other:?}"),
        }
    }

    #[test]
    fn test_sql_captured_verbatim() {
        let p = parse(
            "CREATE TABLE totals AS SELECT customer_id, SUM(amount) AS total FROM orders_raw GROUP BY customer_id;",
            "t",
        )
        .unwrap();
        match &p.statements[0] {
            Statement::CreateTableAs(c) => {
                assert_eq!(c.table, "totals");
                assert!(c.sql.starts_with("SELECT customer_id"));
                assert!(c.sql.ends_with("GROUP BY customer_id"));
            }
            other => panic!("expected transform, got {other:?}"),
        }
    }

    #[test]
    fn test_export_stops_at_top_level_to() {
        let p = parse(
            r#"EXPORT SELECT * FROM totals TO 'out/totals.csv' TYPE CSV OPTIONS {"header": true};"#,
            "t",
        )
        .unwrap();
        match &p.statements[0] {
            Statement::Export(e) => {
                assert_eq!(e.sql, "SELECT * FROM totals");
                assert_eq!(e.target, "out/totals.csv");
                assert_eq!(e.connector_type, "CSV");
                assert_eq!(e.options["header"], true);
            }
            other => panic!("expected export, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_conditionals() {
        let src = r#"
IF env == 'prod' THEN
    IF region == 'eu' THEN
        SET bucket = 'eu-data';
    ELSE
        SET bucket = 'us-data';
    ENDIF;
ELSEIF env == 'dev' THEN
    SET bucket = 'dev-data';
ENDIF;
"#;
        let p = parse(src, "t").unwrap();
        match &p.statements[0] {
            Statement::Conditional(block) => {
                assert_eq!(block.branches.len(), 2);
                assert_eq!(block.branches[0].condition, "env == 'prod'");
                assert!(matches!(
                    block.branches[0].steps[0],
                    Statement::Conditional(_)
                ));
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }

    #[test]
    fn test_else_if_two_words() {
        let src = "IF a == '1' THEN SET x = 'a'; ELSE IF a == '2' THEN SET x = 'b'; END IF";
        let p = parse(src, "t").unwrap();
        match &p.statements[0] {
            Statement::Conditional(block) => {
                assert_eq!(block.branches.len(), 2);
                assert!(block.else_steps.is_empty());
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }

    #[test]
    fn test_conditional_keyword_outside_block() {
        let err = parse("ENDIF;", "t").unwrap_err();
        assert!(err.to_string().contains("only valid inside an IF block"));
    }

    #[test]
    fn test_unexpected_token_reports_line_and_column() {
        let err = parse("LOAD orders_raw INTO orders;", "t").unwrap_err();
        match err {
            SqlFlowError::Parse { line, found, .. } => {
                assert_eq!(line, 1);
                assert!(found.contains("INTO"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_render_roundtrip() {
        let src = r#"
SET env = 'prod';
SOURCE orders TYPE CSV PARAMS {"path": "data/orders.csv"};
LOAD orders_raw FROM orders MODE APPEND;
IF env == 'prod' THEN
CREATE TABLE totals AS SELECT * FROM orders_raw;
ELSE
CREATE TABLE totals AS SELECT * FROM orders_raw LIMIT 10;
ENDIF;
EXPORT SELECT * FROM totals TO 'out.csv' TYPE CSV OPTIONS {"header": true};
"#;
        let first = parse(src, "t").unwrap();
        let rendered = first.to_string();
        let second = parse(&rendered, "t").unwrap();
        // Line numbers differ between renderings; compare the shape.
        assert_eq!(first.statements.len(), second.statements.len());
        let renormalized = parse(&second.to_string(), "t").unwrap();
        assert_eq!(second, renormalized);
    }
}
