//! # opal-censor
//!
//! SQL firewall consulted once per query frame. The policy is an ordered
//! list of allow/deny handlers loaded from a YAML file at startup; a
//! missing policy file means allow-all. Denials carry a reason that the
//! protocol adapter converts into a dialect error frame, so the client
//! sees an ordinary database error and the database sees nothing.

pub mod config;
pub mod error;
pub mod handlers;
pub mod parser;

use std::path::Path;

use opal_core::{ClientId, Dialect};

use crate::config::{HandlerKind, PolicyFile};
use crate::handlers::{CompiledHandler, QueryContext};
use crate::parser::SqlAnalyzer;

pub use crate::error::CensorError;

/// Outcome of a single query inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

pub struct Censor {
    analyzer: SqlAnalyzer,
    handlers: Vec<CompiledHandler>,
    ignore_parse_errors: bool,
}

impl Censor {
    /// A censor with no policy: every query passes.
    pub fn allow_all(dialect: Dialect) -> Self {
        Self {
            analyzer: SqlAnalyzer::new(dialect),
            handlers: Vec::new(),
            ignore_parse_errors: false,
        }
    }

    /// Load a policy file. `None` is equivalent to allow-all.
    pub fn from_file(path: Option<&Path>, dialect: Dialect) -> Result<Self, CensorError> {
        match path {
            None => Ok(Self::allow_all(dialect)),
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Self::from_yaml(&content, dialect)
            }
        }
    }

    pub fn from_yaml(content: &str, dialect: Dialect) -> Result<Self, CensorError> {
        let policy = PolicyFile::from_yaml(content)?;
        let analyzer = SqlAnalyzer::new(dialect);
        let handlers = policy
            .handlers
            .iter()
            .map(|cfg| CompiledHandler::compile(cfg, |q| normalize(&analyzer, q)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            analyzer,
            handlers,
            ignore_parse_errors: policy.ignore_parse_errors,
        })
    }

    /// Inspect one query. Stateless with respect to the connection.
    pub fn inspect(&self, query: &str, client_id: &ClientId) -> Decision {
        if self.handlers.is_empty() {
            return Decision::Allow;
        }

        let tables = match self.analyzer.parse(query) {
            Ok(stmts) => Some(
                stmts
                    .iter()
                    .flat_map(|s| self.analyzer.extract_tables(s))
                    .map(|t| handlers::normalize_table_name(&t))
                    .collect::<Vec<_>>(),
            ),
            Err(e) if self.ignore_parse_errors => {
                tracing::debug!(client_id = %client_id, error = %e, "query did not parse, matching on text only");
                None
            }
            Err(e) => {
                return Decision::Deny(format!("query failed to parse: {e}"));
            }
        };

        let ctx = QueryContext {
            raw: query,
            normalized: normalize(&self.analyzer, query),
            tables,
        };

        for handler in &self.handlers {
            if handler.is_empty() {
                continue;
            }
            match handler.kind {
                HandlerKind::Deny => {
                    if handler.matches(&ctx) {
                        return Decision::Deny("query forbidden by policy".into());
                    }
                }
                // An allow handler with rules is terminal: it admits what it
                // matches and denies the rest.
                HandlerKind::Allow => {
                    if handler.matches(&ctx) {
                        return Decision::Allow;
                    }
                    return Decision::Deny("query not in allow list".into());
                }
            }
        }
        Decision::Allow
    }
}

/// Canonical statement text: parsed form when possible, collapsed
/// whitespace otherwise.
fn normalize(analyzer: &SqlAnalyzer, query: &str) -> String {
    match analyzer.parse(query) {
        Ok(stmts) if !stmts.is_empty() => stmts
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; "),
        _ => query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .trim_end_matches(';')
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientId {
        ClientId::new(b"client_one".to_vec()).unwrap()
    }

    #[test]
    fn no_policy_allows_everything() {
        let censor = Censor::allow_all(Dialect::Postgresql);
        assert_eq!(censor.inspect("DROP TABLE users", &client()), Decision::Allow);
    }

    #[test]
    fn missing_file_is_allow_all() {
        let censor = Censor::from_file(None, Dialect::Postgresql).unwrap();
        assert_eq!(censor.inspect("DELETE FROM users", &client()), Decision::Allow);
    }

    #[test]
    fn deny_pattern_blocks_query() {
        let censor = Censor::from_yaml(
            r#"
handlers:
  - handler: deny
    patterns:
      - "(?i)DROP TABLE .*"
"#,
            Dialect::Postgresql,
        )
        .unwrap();

        assert!(matches!(
            censor.inspect("DROP TABLE users", &client()),
            Decision::Deny(_)
        ));
        assert_eq!(censor.inspect("SELECT 1", &client()), Decision::Allow);
    }

    #[test]
    fn deny_table_blocks_any_statement_touching_it() {
        let censor = Censor::from_yaml(
            r#"
handlers:
  - handler: deny
    tables:
      - credit_cards
"#,
            Dialect::Postgresql,
        )
        .unwrap();

        assert!(matches!(
            censor.inspect("SELECT * FROM credit_cards", &client()),
            Decision::Deny(_)
        ));
        assert!(matches!(
            censor.inspect("SELECT * FROM users u JOIN credit_cards c ON u.id = c.uid", &client()),
            Decision::Deny(_)
        ));
        assert_eq!(
            censor.inspect("SELECT * FROM users", &client()),
            Decision::Allow
        );
    }

    #[test]
    fn exact_query_denylist_survives_formatting() {
        let censor = Censor::from_yaml(
            r#"
handlers:
  - handler: deny
    queries:
      - DROP TABLE users
"#,
            Dialect::Postgresql,
        )
        .unwrap();

        // Same statement, different whitespace: identical normalized form.
        assert!(matches!(
            censor.inspect("DROP   TABLE\n  users", &client()),
            Decision::Deny(_)
        ));
        assert_eq!(
            censor.inspect("DROP TABLE orders", &client()),
            Decision::Allow
        );
    }

    #[test]
    fn allow_list_is_terminal() {
        let censor = Censor::from_yaml(
            r#"
handlers:
  - handler: allow
    tables:
      - products
"#,
            Dialect::Postgresql,
        )
        .unwrap();

        assert_eq!(
            censor.inspect("SELECT * FROM products", &client()),
            Decision::Allow
        );
        assert!(matches!(
            censor.inspect("SELECT * FROM users", &client()),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn unparseable_query_denied_by_default() {
        let censor = Censor::from_yaml(
            r#"
handlers:
  - handler: deny
    tables: [secrets]
"#,
            Dialect::Postgresql,
        )
        .unwrap();
        assert!(matches!(
            censor.inspect("NOT SQL ;;;", &client()),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn unparseable_query_passes_with_ignore_flag() {
        let censor = Censor::from_yaml(
            r#"
ignore_parse_errors: true
handlers:
  - handler: deny
    tables: [secrets]
"#,
            Dialect::Postgresql,
        )
        .unwrap();
        assert_eq!(censor.inspect("NOT SQL ;;;", &client()), Decision::Allow);
    }

    #[test]
    fn empty_query_is_allowed() {
        let censor = Censor::from_yaml(
            r#"
handlers:
  - handler: deny
    tables: [secrets]
"#,
            Dialect::Postgresql,
        )
        .unwrap();
        assert_eq!(censor.inspect("", &client()), Decision::Allow);
    }
}
