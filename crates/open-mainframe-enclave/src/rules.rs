//! HTTP classification rules.
//!
//! A rule maps `(host, port, method, resource)` to a WLM transaction class.
//! Rules are evaluated in configured order and the first full match wins:
//! port and method first (through a per-port index), then host, then
//! resource.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::codec::{try_encode_field, FieldError, FIELD_LENGTH};
use crate::config::ClassificationEntry;

/// Port value that matches every port.
pub const ANY_PORT: i32 = -1;

const WILDCARD: &str = "*";

/// Why a configured rule was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// Transaction class missing.
    #[error("transaction class is empty")]
    EmptyTransactionClass,
    /// Transaction class longer than eight characters.
    #[error("transaction class '{0}' is longer than 8 characters")]
    TransactionClassTooLong(String),
    /// Transaction class with characters outside IBM-1047.
    #[error("transaction class '{class}' cannot be encoded: {source}")]
    UnencodableTransactionClass { class: String, source: FieldError },
    /// Three or more consecutive `*` in the resource.
    #[error("resource '{0}' has more than two consecutive wildcards")]
    TooManyWildcards(String),
    /// No usable port left after parsing.
    #[error("port specification '{0}' has no valid port")]
    NoValidPorts(String),
    /// The resource did not compile to a pattern.
    #[error("resource '{resource}' is not a valid pattern: {reason}")]
    BadResource { resource: String, reason: String },
}

// ---------------------------------------------------------------------------
//  Classification data
// ---------------------------------------------------------------------------

/// One validated classification rule.
#[derive(Debug, Clone)]
pub struct ClassificationData {
    transaction_class: String,
    transaction_class_bytes: [u8; FIELD_LENGTH],
    host: String,
    ports: BTreeSet<i32>,
    methods: BTreeSet<String>,
    resource: String,
    pattern: Option<Regex>,
}

impl ClassificationData {
    /// Validate a configured entry.
    pub fn parse(entry: &ClassificationEntry) -> Result<Self, RuleError> {
        let transaction_class = entry.transaction_class.trim().to_string();
        if transaction_class.is_empty() {
            return Err(RuleError::EmptyTransactionClass);
        }
        let transaction_class_bytes = match try_encode_field(&transaction_class) {
            Ok(bytes) => bytes,
            Err(FieldError::TooLong(_)) => {
                return Err(RuleError::TransactionClassTooLong(transaction_class));
            }
            Err(source) => {
                return Err(RuleError::UnencodableTransactionClass {
                    class: transaction_class,
                    source,
                });
            }
        };

        let ports = parse_ports(&entry.port);
        if ports.is_empty() {
            return Err(RuleError::NoValidPorts(entry.port.clone()));
        }

        let resource = entry.resource.trim().to_string();
        let pattern = compile_resource(&resource)?;

        Ok(Self {
            transaction_class_bytes,
            transaction_class,
            host: entry.host.trim().to_string(),
            ports,
            methods: parse_methods(&entry.method),
            resource,
            pattern,
        })
    }

    /// Transaction class text.
    pub fn transaction_class(&self) -> &str {
        &self.transaction_class
    }

    /// Transaction class as the blank-padded IBM-1047 field.
    pub fn transaction_class_bytes(&self) -> &[u8; FIELD_LENGTH] {
        &self.transaction_class_bytes
    }

    /// Configured host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Expanded port set; [`ANY_PORT`] is the wildcard.
    pub fn ports(&self) -> &BTreeSet<i32> {
        &self.ports
    }

    /// Configured resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether the rule applies to a port.
    pub fn matches_port(&self, port: u16) -> bool {
        self.ports.contains(&ANY_PORT) || self.ports.contains(&i32::from(port))
    }

    /// Whether the rule applies to a method.
    pub fn matches_method(&self, method: &str) -> bool {
        self.methods.contains(WILDCARD) || self.methods.contains(method)
    }

    /// Whether the rule applies to a host (exact or `*`).
    pub fn matches_host(&self, host: &str) -> bool {
        self.host == WILDCARD || self.host == host
    }

    /// Whether the rule applies to a resource.
    pub fn matches_resource(&self, resource: &str) -> bool {
        if self.resource == resource || self.resource == WILDCARD {
            return true;
        }
        self.pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(resource))
    }
}

/// Expand a port specification. Unusable pieces are skipped.
fn parse_ports(spec: &str) -> BTreeSet<i32> {
    let mut ports = BTreeSet::new();
    for piece in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if piece == WILDCARD || piece == "-1" {
            ports.insert(ANY_PORT);
        } else if let Some((start, end)) = piece.split_once('-') {
            match (start.trim().parse::<i32>(), end.trim().parse::<i32>()) {
                (Ok(start), Ok(end)) if start > 0 && end < 65535 && start <= end => {
                    ports.extend(start..=end);
                }
                _ => debug!(range = %piece, "Ignoring invalid port range"),
            }
        } else {
            match piece.parse::<i32>() {
                Ok(port) if port > 0 && port <= 65535 => {
                    ports.insert(port);
                }
                _ => debug!(port = %piece, "Ignoring invalid port"),
            }
        }
    }
    ports
}

fn parse_methods(spec: &str) -> BTreeSet<String> {
    let methods: BTreeSet<String> = spec
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();
    if methods.is_empty() {
        BTreeSet::from([WILDCARD.to_string()])
    } else {
        methods
    }
}

/// Compile a resource with wildcards into an anchored pattern.
///
/// `*` matches one or more characters within a path segment, `/**/` matches
/// zero or more whole directories, and any other `**` matches anything.
/// Returns `None` when the resource is plain text or the lone `*`.
fn compile_resource(resource: &str) -> Result<Option<Regex>, RuleError> {
    if resource.contains("***") {
        return Err(RuleError::TooManyWildcards(resource.to_string()));
    }
    if resource == WILDCARD || !resource.contains('*') {
        return Ok(None);
    }

    let mut pattern = String::from("^");
    let mut rest = resource;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("/**/") {
            pattern.push_str("/(?:[^/]+/)*");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("**") {
            pattern.push_str(".*");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('*') {
            pattern.push_str("[^/]+");
            rest = tail;
        } else {
            let end = rest.find(['*', '/']).map_or(rest.len(), |i| i.max(1));
            pattern.push_str(&regex::escape(&rest[..end]));
            rest = &rest[end..];
        }
    }
    pattern.push('$');

    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| RuleError::BadResource {
            resource: resource.to_string(),
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
//  Rule set
// ---------------------------------------------------------------------------

/// An immutable, ordered set of rules with a lazily filled port index.
///
/// A configuration update builds a new `RuleSet`, which discards the index
/// together with the old rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<ClassificationData>,
    by_port: DashMap<u16, Arc<[usize]>>,
}

impl RuleSet {
    /// Build from validated rules, keeping their order.
    pub fn new(rules: Vec<ClassificationData>) -> Self {
        Self {
            rules,
            by_port: DashMap::new(),
        }
    }

    /// Validate configured entries. Invalid entries are dropped with a
    /// warning; the rest keep their relative order.
    pub fn from_entries(entries: &[ClassificationEntry]) -> Self {
        let rules = entries
            .iter()
            .filter_map(|entry| match ClassificationData::parse(entry) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(
                        transaction_class = %entry.transaction_class,
                        resource = %entry.resource,
                        error = %e,
                        "Dropping classification rule"
                    );
                    None
                }
            })
            .collect();
        Self::new(rules)
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[ClassificationData] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Indices of the rules that apply to a port, in order.
    fn candidates(&self, port: u16) -> Arc<[usize]> {
        if let Some(hit) = self.by_port.get(&port) {
            return Arc::clone(hit.value());
        }
        let indices: Arc<[usize]> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches_port(port))
            .map(|(i, _)| i)
            .collect();
        self.by_port.insert(port, Arc::clone(&indices));
        indices
    }

    /// First rule matching the request, if any.
    pub fn classify(
        &self,
        host: &str,
        port: u16,
        resource: &str,
        method: &str,
    ) -> Option<&ClassificationData> {
        let candidates = self.candidates(port);
        candidates
            .iter()
            .map(|&i| &self.rules[i])
            .filter(|rule| rule.matches_method(method))
            .filter(|rule| rule.matches_host(host))
            .find(|rule| rule.matches_resource(resource))
    }
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------
