//! Typed AST for the pipeline DSL.
//!
//! Every node carries the 1-based source line it started on. `Display`
//! renders a node back to canonical DSL text, so parse → render → parse is
//! identity up to whitespace and comments.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadMode {
    Replace,
    Append,
    Merge,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Replace => f.write_str("REPLACE"),
            LoadMode::Append => f.write_str("APPEND"),
            LoadMode::Merge => f.write_str("MERGE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceDefinition {
    pub name: String,
    pub connector_type: String,
    pub params: Value,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Load {
    pub target_table: String,
    pub source_name: String,
    pub mode: LoadMode,
    pub merge_keys: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableAs {
    pub table: String,
    pub sql: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub sql: String,
    pub target: String,
    pub connector_type: String,
    pub options: Value,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Set {
    pub name: String,
    pub value: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub path: String,
    pub alias: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: String,
    pub steps: Vec<Statement>,
    pub line: usize,
}

/// `IF ... THEN ... (ELSEIF ... THEN ...)* (ELSE ...)? ENDIF`
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBlock {
    pub branches: Vec<Branch>,
    pub else_steps: Vec<Statement>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Source(SourceDefinition),
    Load(Load),
    CreateTableAs(CreateTableAs),
    Export(Export),
    Set(Set),
    Include(Include),
    Conditional(ConditionalBlock),
}

impl Statement {
    pub fn line(&self) -> usize {
        match self {
            Statement::Source(s) => s.line,
            Statement::Load(s) => s.line,
            Statement::CreateTableAs(s) => s.line,
            Statement::Export(s) => s.line,
            Statement::Set(s) => s.line,
            Statement::Include(s) => s.line,
            Statement::Conditional(s) => s.line,
        }
    }
}

fn escape_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Source(s) => write!(
                f,
                "SOURCE {} TYPE {} PARAMS {};",
                s.name, s.connector_type, s.params
            ),
            Statement::Load(s) => {
                write!(
                    f,
                    "LOAD {} FROM {} MODE {}",
                    s.target_table, s.source_name, s.mode
                )?;
                if !s.merge_keys.is_empty() {
                    write!(f, " KEYS ({})", s.merge_keys.join(", "))?;
                }
                f.write_str(";")
            }
            Statement::CreateTableAs(s) => {
                write!(f, "CREATE TABLE {} AS {};", s.table, s.sql)
            }
            Statement::Export(s) => write!(
                f,
                "EXPORT {} TO '{}' TYPE {} OPTIONS {};",
                s.sql,
                escape_str(&s.target),
                s.connector_type,
                s.options
            ),
            Statement::Set(s) => {
                write!(f, "SET {} = '{}';", s.name, escape_str(&s.value))
            }
            Statement::Include(s) => {
                write!(f, "INCLUDE '{}'", escape_str(&s.path))?;
                if let Some(alias) = &s.alias {
                    write!(f, " AS {alias}")?;
                }
                f.write_str(";")
            }
            Statement::Conditional(block) => {
                for (i, branch) in block.branches.iter().enumerate() {
                    if i == 0 {
                        writeln!(f, "IF {} THEN", branch.condition)?;
                    } else {
                        writeln!(f, "ELSEIF {} THEN", branch.condition)?;
                    }
                    for step in &branch.steps {
                        writeln!(f, "{step}")?;
                    }
                }
                if !block.else_steps.is_empty() {
                    writeln!(f, "ELSE")?;
                    for step in &block.else_steps {
                        writeln!(f, "{step}")?;
                    }
                }
                f.write_str("ENDIF;")
            }
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            writeln!(f, "{stmt}")?;
        }
        Ok(())
    }
}
