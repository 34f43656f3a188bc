//! Integration tests covering classification through enclave deletion.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::SystemTime;

use open_mainframe_enclave::codec::encode_field;
use open_mainframe_enclave::codes::RC_IWM_ERROR;
use open_mainframe_enclave::native::RSN_UNKNOWN_TOKEN;
use open_mainframe_enclave::{
    ClassificationEntry, ClassificationInfo, EnclaveError, EnclaveManager, EnclaveState,
    NativeFailure, NativeOp, RuleSet, ServiceMode, SimulatedNative, WlmConfig, WorkClassifier,
};
use proptest::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn activate(mode: ServiceMode) -> (Arc<SimulatedNative>, Arc<EnclaveManager>) {
    init_tracing();
    let native = Arc::new(SimulatedNative::new());
    let config = WlmConfig {
        mode,
        ..WlmConfig::default()
    };
    let manager = EnclaveManager::activate(&config, native.clone()).unwrap();
    (native, Arc::new(manager))
}

const CHECKOUT_CONFIG: &str = r#"
mode = "unauthorized"
subsystem_name = "LIBSRV1"

[[classification]]
transaction_class = "STATIC"
port = "8080-8090"
resource = "/static/**"

[[classification]]
transaction_class = "CHKOUT"
host = "*"
port = "443"
method = "POST"
resource = "/checkout"

[[classification]]
transaction_class = "BROKEN"
resource = "/a/***/b"
"#;

/// Test: a POST to /checkout runs in a CHKOUT enclave that is left and
/// deleted in one call afterwards.
#[test]
fn checkout_request_end_to_end() {
    init_tracing();
    let config = WlmConfig::from_toml_str(CHECKOUT_CONFIG).unwrap();
    let native = Arc::new(SimulatedNative::new());
    let manager = Arc::new(EnclaveManager::activate(&config, native.clone()).unwrap());
    let classifier = WorkClassifier::from_config(Arc::clone(&manager), &config);
    assert_eq!(classifier.rules().len(), 2);

    assert!(classifier
        .classify("store.example.com", 443, "/checkout", "GET")
        .is_none());
    let mut executor = classifier
        .classify("store.example.com", 443, "/checkout", "POST")
        .unwrap();
    assert_eq!(executor.transaction_class(), "CHKOUT");

    let seen = executor
        .execute(|| {
            let enclave = manager.current_enclave().unwrap();
            assert_eq!(enclave.state(), EnclaveState::Joined);
            assert!(manager.registry().contains(&enclave.key()));
            native.transaction_class(enclave.token().as_bytes())
        })
        .unwrap();
    assert_eq!(seen.as_deref(), Some("CHKOUT"));

    assert_eq!(native.calls(NativeOp::CreateJoin), 1);
    assert_eq!(native.calls(NativeOp::LeaveDelete), 1);
    assert_eq!(native.calls(NativeOp::Delete), 0);
    assert!(manager.registry().is_empty());
    assert_eq!(native.live_enclaves(), 0);

    let stats = manager.stats();
    assert_eq!((stats.created, stats.deleted, stats.live), (1, 1, 0));
    let delete = executor.last_delete_data().unwrap();
    assert_eq!(delete.as_bytes().len(), 64);

    manager.deactivate().unwrap();
    assert_eq!(native.connection_count(), 0);
}

/// Test: static resources match the `**` rule on any port in the range.
#[test]
fn static_rule_covers_port_range() {
    let config = WlmConfig::from_toml_str(CHECKOUT_CONFIG).unwrap();
    let rules = RuleSet::from_entries(&config.classification);
    let rule = rules
        .classify("any.host", 8085, "/static/css/site.css", "GET")
        .unwrap();
    assert_eq!(rule.transaction_class(), "STATIC");
    assert!(rules.classify("any.host", 8091, "/static/x", "GET").is_none());
}

/// Test: N threads leaving the same enclave issue exactly one delete.
#[test]
fn concurrent_leave_deletes_once() {
    const THREADS: usize = 8;
    let (native, manager) = activate(ServiceMode::Unauthorized);
    let enclave = manager
        .create(&ClassificationInfo::new("TC1", None), SystemTime::now())
        .unwrap()
        .unwrap();
    for _ in 1..THREADS {
        manager.pre_join_enclave(&enclave);
    }

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let enclave = Arc::clone(&enclave);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                manager.join_enclave(&enclave).unwrap();
                barrier.wait();
                manager.leave_enclave(&enclave).unwrap()
            })
        })
        .collect();

    let deletes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Option::is_some)
        .count();

    assert_eq!(deletes, 1);
    assert_eq!(
        native.calls(NativeOp::LeaveDelete) + native.calls(NativeOp::Delete),
        1
    );
    assert_eq!(native.calls(NativeOp::Leave), THREADS - 1);
    assert!(enclave.is_deleted());
    assert!(manager.registry().is_empty());
    assert_eq!(manager.stats().deleted, 1);
}

/// Test: with auto-delete off the enclave survives its last leave.
#[test]
fn auto_delete_suppression() {
    let (native, manager) = activate(ServiceMode::Authorized);
    let enclave = manager
        .create(&ClassificationInfo::new("TC1", Some("ORDERS")), SystemTime::now())
        .unwrap()
        .unwrap();
    manager.set_auto_delete(&enclave, false);

    manager.join_enclave(&enclave).unwrap();
    assert!(manager.leave_enclave(&enclave).unwrap().is_none());
    assert_eq!(native.calls(NativeOp::LeaveDelete), 0);
    assert_eq!(native.calls(NativeOp::Delete), 0);
    assert_eq!(enclave.state(), EnclaveState::Left);
    let found = manager.get_enclave_from_token(&enclave.key()).unwrap();
    assert!(Arc::ptr_eq(&found, &enclave));

    assert!(manager.delete_enclave(&enclave, false).unwrap().is_some());
    assert!(manager.registry().is_empty());
    assert_eq!(native.live_enclaves(), 0);
}

/// Test: a failed native join rolls the use back and deletes the enclave
/// when nothing else holds it.
#[test]
fn join_failure_rolls_back_and_deletes() {
    let (native, manager) = activate(ServiceMode::Unauthorized);
    let enclave = manager
        .create(&ClassificationInfo::new("TC1", None), SystemTime::now())
        .unwrap()
        .unwrap();
    native.fail_next(
        NativeOp::Join,
        NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN),
    );

    let err = manager.join_enclave(&enclave).unwrap_err();
    assert!(matches!(err, EnclaveError::AlreadyClassified { .. }));
    assert_eq!(enclave.pending_use_count(), 0);
    assert_eq!(enclave.in_use_count(), 0);
    assert!(enclave.is_deleted());
    assert!(manager.registry().is_empty());
    assert_eq!(native.calls(NativeOp::Delete), 1);
    assert_eq!(native.calls(NativeOp::LeaveDelete), 0);
    assert!(manager.current_enclave().is_none());
}

/// Test: a failed join with other pending users leaves the counts as they
/// were before the pre-join.
#[test]
fn join_failure_keeps_shared_enclave() {
    let (native, manager) = activate(ServiceMode::Unauthorized);
    let enclave = manager
        .create(&ClassificationInfo::new("TC1", None), SystemTime::now())
        .unwrap()
        .unwrap();
    manager.pre_join_enclave(&enclave);
    native.fail_next(NativeOp::Join, NativeFailure::new(RC_IWM_ERROR, 0x0999));

    assert!(manager.join_enclave(&enclave).is_err());
    assert_eq!(enclave.pending_use_count(), 1);
    assert_eq!(enclave.in_use_count(), 0);
    assert!(!enclave.is_deleted());
    assert_eq!(native.calls(NativeOp::Delete), 0);

    manager.join_enclave(&enclave).unwrap();
    assert!(manager.leave_enclave(&enclave).unwrap().is_some());
}

/// Test: authorized services classify each (class, name) once.
#[test]
fn authorized_service_class_cache() {
    let (native, manager) = activate(ServiceMode::Authorized);
    let info = ClassificationInfo::new("CHKOUT", Some("ORDERS"));
    for _ in 0..3 {
        let enclave = manager.create(&info, SystemTime::now()).unwrap().unwrap();
        manager.join_enclave(&enclave).unwrap();
        manager.leave_enclave(&enclave).unwrap().unwrap();
    }
    assert_eq!(native.calls(NativeOp::Classify), 1);

    let report = manager.introspect();
    assert!(report.contains("CREATED: 3  DELETED: 3  LIVE: 0"));
    assert!(report.contains("SERVICE CLASS CACHE: 1"));
    assert!(report.contains("CHKOUT"));
}

/// Test: request work classified over HTTP reuses the cached service class
/// in authorized mode.
#[test]
fn authorized_join_new_enclave_classifies_once() {
    let (native, manager) = activate(ServiceMode::Authorized);
    let class = encode_field("TC1");
    for _ in 0..3 {
        let enclave = manager
            .join_new_enclave(&class, SystemTime::now())
            .unwrap()
            .unwrap();
        manager.leave_enclave(&enclave).unwrap().unwrap();
    }
    assert_eq!(native.calls(NativeOp::CreateJoin), 3);
    assert_eq!(native.calls(NativeOp::Classify), 1);
    assert!(manager.introspect().contains("SERVICE CLASS CACHE: 1"));
}

/// Test: a connect failure fails activation.
#[test]
fn activation_requires_connection() {
    let native = Arc::new(SimulatedNative::new());
    native.fail_next(NativeOp::Connect, NativeFailure::new(RC_IWM_ERROR, 0x0123));
    let err = EnclaveManager::activate(&WlmConfig::default(), native).unwrap_err();
    assert!(matches!(err, EnclaveError::ConnectFailed { .. }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any number of threads joining and leaving one enclave keeps the
    /// counters balanced and deletes it exactly once when unused.
    #[test]
    fn usage_counts_balance(threads in 1usize..6, extra in 0u32..3) {
        let (native, manager) = activate(ServiceMode::Unauthorized);
        let enclave = manager
            .create(&ClassificationInfo::new("TC1", None), SystemTime::now())
            .unwrap()
            .unwrap();
        for _ in 1..threads {
            manager.pre_join_enclave(&enclave);
        }
        for _ in 0..extra {
            manager.pre_join_enclave(&enclave);
        }

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let enclave = Arc::clone(&enclave);
                thread::spawn(move || {
                    manager.join_enclave(&enclave).unwrap();
                    let joined = enclave.is_in_use();
                    manager.leave_enclave(&enclave).unwrap();
                    joined
                })
            })
            .collect();
        for handle in handles {
            prop_assert!(handle.join().unwrap());
        }

        prop_assert_eq!(enclave.in_use_count(), 0);
        prop_assert_eq!(enclave.pending_use_count(), extra);
        prop_assert_eq!(enclave.is_in_use(), extra > 0);
        let deletes = native.calls(NativeOp::LeaveDelete) + native.calls(NativeOp::Delete);
        prop_assert_eq!(deletes, usize::from(extra == 0));
        prop_assert_eq!(manager.registry().is_empty(), extra == 0);
    }

    /// A resource with three consecutive wildcards never matches anything.
    #[test]
    fn triple_wildcard_never_matches(segments in proptest::collection::vec("[a-z*]{1,4}", 1..5)) {
        let rules = RuleSet::from_entries(&[
            ClassificationEntry::new("BAD").with_resource("/a/***/b"),
        ]);
        prop_assert!(rules.is_empty());
        let path = format!("/a/{}/b", segments.join("/"));
        prop_assert!(rules.classify("h", 80, &path, "GET").is_none());
    }
}
