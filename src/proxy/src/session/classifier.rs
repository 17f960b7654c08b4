//! SQL classification. The external SQL parser is out of scope (`spec.md`
//! §1/§6) — this module provides the tagged-variant contract callers depend
//! on and a minimal default implementation good enough to run the proxy
//! end-to-end without a real parser.
//!
//! Re-architected per the REDESIGN FLAG in `spec.md` §9: the original used
//! runtime type discrimination on a parsed-SQL value (`stmt.SQL.(parser.ISelect)`
//! in `original_source/proxy/conn_stmt.go`). Here it is a closed tagged enum
//! and every caller (router, preparable-filter) is a pattern match over it.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    Select { locked: bool },
    Insert,
    Update,
    Delete,
    Replace,
    ShowDatabases,
    Ddl,
    Other,
}

impl Statement {
    /// Preparable per `spec.md` §4.6 step 1: only DML plus DDL-as-no-op.
    pub fn is_preparable(&self) -> bool {
        matches!(
            self,
            Statement::Select { .. }
                | Statement::Insert
                | Statement::Update
                | Statement::Delete
                | Statement::Replace
                | Statement::Ddl
        )
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, Statement::Ddl)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("syntax error near '{0}'")]
pub struct ClassifyError(pub String);

pub trait SqlClassifier: Send + Sync {
    fn classify(&self, sql: &str) -> Result<Statement, ClassifyError>;
}

/// A prefix-matching classifier: good enough to route traffic without a real
/// SQL parser. `Non-goals` (`spec.md` §1) explicitly exclude SQL semantic
/// validation beyond classification, so this never needs to be more than a
/// keyword sniff.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixClassifier;

fn first_word(sql: &str) -> &str {
    sql.trim_start()
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("")
}

impl SqlClassifier for PrefixClassifier {
    fn classify(&self, sql: &str) -> Result<Statement, ClassifyError> {
        let trimmed = sql.trim_start();
        if trimmed.is_empty() {
            return Err(ClassifyError("".to_string()));
        }
        let upper_word = first_word(trimmed).to_ascii_uppercase();
        let upper_sql = trimmed.to_ascii_uppercase();

        Ok(match upper_word.as_str() {
            "SELECT" => {
                if upper_sql.contains("SHOW DATABASES") {
                    Statement::ShowDatabases
                } else {
                    let locked = upper_sql.contains("FOR UPDATE")
                        || upper_sql.contains("LOCK IN SHARE MODE");
                    Statement::Select { locked }
                }
            }
            "SHOW" if upper_sql.trim_end_matches(';').trim() == "SHOW DATABASES" => {
                Statement::ShowDatabases
            }
            "INSERT" => Statement::Insert,
            "UPDATE" => Statement::Update,
            "DELETE" => Statement::Delete,
            "REPLACE" => Statement::Replace,
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" => Statement::Ddl,
            _ => Statement::Other,
        })
    }
}
