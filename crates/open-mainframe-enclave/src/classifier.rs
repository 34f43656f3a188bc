//! # Work Classifier
//!
//! HTTP entry point: matches a request against the classification rules
//! and hands back an [`EnclaveExecutor`] that runs work inside a fresh
//! enclave of the matched transaction class.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::codec::FIELD_LENGTH;
use crate::config::{ClassificationEntry, WlmConfig};
use crate::enclave::Enclave;
use crate::error::Result;
use crate::manager::EnclaveManager;
use crate::native::DeleteData;
use crate::rules::RuleSet;

/// Classifies inbound requests into transaction classes.
pub struct WorkClassifier {
    manager: Arc<EnclaveManager>,
    rules: RwLock<Arc<RuleSet>>,
}

impl WorkClassifier {
    /// Classifier over an already built rule set.
    pub fn new(manager: Arc<EnclaveManager>, rules: RuleSet) -> Self {
        Self {
            manager,
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Classifier over the `[[classification]]` rules of a configuration.
    pub fn from_config(manager: Arc<EnclaveManager>, config: &WlmConfig) -> Self {
        Self::new(manager, RuleSet::from_entries(&config.classification))
    }

    /// Current rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the rules. Requests already classified keep the executor
    /// they were given; the port cache starts empty with the new set.
    pub fn update_rules(&self, entries: &[ClassificationEntry]) {
        self.replace_rules(RuleSet::from_entries(entries));
    }

    /// Swap in a prebuilt rule set.
    pub fn replace_rules(&self, rules: RuleSet) {
        let count = rules.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        debug!(rules = count, "Classification rules replaced");
    }

    /// Match a request. `None` when no rule applies.
    pub fn classify(
        &self,
        host: &str,
        port: u16,
        uri: &str,
        method: &str,
    ) -> Option<EnclaveExecutor> {
        let rules = self.rules();
        let rule = rules.classify(host, port, uri, method)?;
        debug!(
            host,
            port,
            uri,
            method,
            class = rule.transaction_class(),
            "Request classified"
        );
        Some(EnclaveExecutor {
            manager: Arc::clone(&self.manager),
            transaction_class: rule.transaction_class().to_string(),
            class_bytes: *rule.transaction_class_bytes(),
            arrival: Some(SystemTime::now()),
            last_delete: None,
        })
    }
}

// ─────────────────────── Executor ───────────────────────

/// Runs work inside an enclave of one transaction class.
#[derive(Debug)]
pub struct EnclaveExecutor {
    manager: Arc<EnclaveManager>,
    transaction_class: String,
    class_bytes: [u8; FIELD_LENGTH],
    arrival: Option<SystemTime>,
    last_delete: Option<DeleteData>,
}

impl EnclaveExecutor {
    /// Transaction class of the matched rule.
    pub fn transaction_class(&self) -> &str {
        &self.transaction_class
    }

    /// Arrival time the next [`execute`](Self::execute) will report.
    pub fn arrival(&self) -> Option<SystemTime> {
        self.arrival
    }

    /// Override the arrival time of the next execution.
    pub fn set_arrival(&mut self, arrival: SystemTime) {
        self.arrival = Some(arrival);
    }

    /// Delete data from the last enclave this executor left.
    pub fn last_delete_data(&self) -> Option<&DeleteData> {
        self.last_delete.as_ref()
    }

    /// Create and join an enclave, run `work`, then leave the enclave even
    /// if `work` panics.
    ///
    /// The arrival time is used once; a second call stamps a fresh one.
    /// When the native create fails the work still runs, unclassified.
    pub fn execute<R>(&mut self, work: impl FnOnce() -> R) -> Result<R> {
        let arrival = self.arrival.take().unwrap_or_else(SystemTime::now);
        let enclave = self.manager.join_new_enclave(&self.class_bytes, arrival)?;
        if enclave.is_none() {
            warn!(class = %self.transaction_class, "Running work without an enclave");
        }

        let mut joined = JoinedEnclave {
            manager: &self.manager,
            enclave,
        };
        let output = work();
        self.last_delete = joined.leave()?;
        Ok(output)
    }
}

/// Leaves its enclave when dropped.
struct JoinedEnclave<'a> {
    manager: &'a EnclaveManager,
    enclave: Option<Arc<Enclave>>,
}

impl JoinedEnclave<'_> {
    fn leave(&mut self) -> Result<Option<DeleteData>> {
        match self.enclave.take() {
            Some(enclave) => self.manager.leave_enclave(&enclave),
            None => Ok(None),
        }
    }
}

impl Drop for JoinedEnclave<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.leave() {
            warn!(error = %e, "Leaving enclave after failed work");
        }
    }
}

// ─────────────────────── Tests ───────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::RC_IWM_ERROR;
    use crate::native::{NativeFailure, NativeOp, SimulatedNative};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn setup(entries: &[ClassificationEntry]) -> (Arc<SimulatedNative>, Arc<EnclaveManager>, WorkClassifier) {
        let native = Arc::new(SimulatedNative::new());
        let manager =
            Arc::new(EnclaveManager::activate(&WlmConfig::default(), native.clone()).unwrap());
        let classifier = WorkClassifier::new(Arc::clone(&manager), RuleSet::from_entries(entries));
        (native, manager, classifier)
    }

    fn api_rule() -> ClassificationEntry {
        ClassificationEntry::new("API")
            .with_port("8080")
            .with_resource("/api/*")
    }

    #[test]
    fn test_no_match() {
        let (_native, _manager, classifier) = setup(&[api_rule()]);
        assert!(classifier.classify("h", 9090, "/api/x", "GET").is_none());
    }

    #[test]
    fn test_execute_runs_in_enclave() {
        let (native, manager, classifier) = setup(&[api_rule()]);
        let mut executor = classifier.classify("h", 8080, "/api/x", "GET").unwrap();
        assert_eq!(executor.transaction_class(), "API");

        let class = executor
            .execute(|| {
                let enclave = manager.current_enclave().unwrap();
                native.transaction_class(enclave.token().as_bytes())
            })
            .unwrap();
        assert_eq!(class.as_deref(), Some("API"));
        assert!(manager.current_enclave().is_none());
        assert!(manager.registry().is_empty());
        assert!(executor.last_delete_data().is_some());
        assert_eq!(native.live_enclaves(), 0);
    }

    #[test]
    fn test_arrival_used_once() {
        let (native, _manager, classifier) = setup(&[api_rule()]);
        let mut executor = classifier.classify("h", 8080, "/api/x", "GET").unwrap();
        assert!(executor.arrival().is_some());
        executor.execute(|| ()).unwrap();
        assert!(executor.arrival().is_none());
        executor.execute(|| ()).unwrap();
        assert_eq!(native.calls(NativeOp::LeaveDelete), 2);
    }

    #[test]
    fn test_leave_after_panic() {
        let (native, manager, classifier) = setup(&[api_rule()]);
        let mut executor = classifier.classify("h", 8080, "/api/x", "GET").unwrap();
        let outcome = catch_unwind(AssertUnwindSafe(|| executor.execute(|| -> u32 { panic!("boom") })));
        assert!(outcome.is_err());
        assert!(manager.current_enclave().is_none());
        assert!(manager.registry().is_empty());
        assert_eq!(native.calls(NativeOp::LeaveDelete), 1);
    }

    #[test]
    fn test_work_runs_when_create_fails() {
        let (native, manager, classifier) = setup(&[api_rule()]);
        native.fail_next(NativeOp::CreateJoin, NativeFailure::new(RC_IWM_ERROR, 1));
        let mut executor = classifier.classify("h", 8080, "/api/x", "GET").unwrap();
        assert_eq!(executor.execute(|| 7).unwrap(), 7);
        assert!(manager.current_enclave().is_none());
        assert!(executor.last_delete_data().is_none());
    }

    #[test]
    fn test_update_rules() {
        let (_native, _manager, classifier) = setup(&[api_rule()]);
        assert!(classifier.classify("h", 8080, "/api/x", "GET").is_some());
        classifier.update_rules(&[ClassificationEntry::new("WEB").with_port("80")]);
        assert!(classifier.classify("h", 8080, "/api/x", "GET").is_none());
        let executor = classifier.classify("h", 80, "/", "GET").unwrap();
        assert_eq!(executor.transaction_class(), "WEB");
        assert_eq!(classifier.rules().len(), 1);
    }
}
