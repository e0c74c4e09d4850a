//! Compiled policy handlers.

use std::collections::HashSet;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::{HandlerConfig, HandlerKind};
use crate::error::CensorError;

/// A query with everything handlers match on, computed once.
pub struct QueryContext<'a> {
    pub raw: &'a str,
    pub normalized: String,
    /// Lowercased, quote-stripped table references; `None` when the query
    /// did not parse.
    pub tables: Option<Vec<String>>,
}

pub struct CompiledHandler {
    pub kind: HandlerKind,
    query_hashes: HashSet<String>,
    tables: HashSet<String>,
    patterns: Vec<Regex>,
}

impl CompiledHandler {
    pub fn compile(cfg: &HandlerConfig, normalize: impl Fn(&str) -> String) -> Result<Self, CensorError> {
        let query_hashes = cfg
            .queries
            .iter()
            .map(|q| query_hash(&normalize(q)))
            .collect();
        let tables = cfg.tables.iter().map(|t| normalize_table_name(t)).collect();
        let patterns = cfg
            .patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| CensorError::InvalidPattern(p.clone(), e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            kind: cfg.handler,
            query_hashes,
            tables,
            patterns,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.query_hashes.is_empty() && self.tables.is_empty() && self.patterns.is_empty()
    }

    pub fn matches(&self, ctx: &QueryContext<'_>) -> bool {
        if self.query_hashes.contains(&query_hash(&ctx.normalized)) {
            return true;
        }
        if let Some(tables) = &ctx.tables {
            if tables.iter().any(|t| self.tables.contains(t)) {
                return true;
            }
        }
        self.patterns.iter().any(|p| p.is_match(ctx.raw))
    }
}

/// Stable fingerprint of a normalized statement.
pub fn query_hash(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Lowercase and strip identifier quoting so `"Users"`, `` `users` ``
/// and `users` compare equal.
pub fn normalize_table_name(name: &str) -> String {
    name.split('.')
        .map(|part| part.trim_matches(|c| c == '"' || c == '`').to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}
