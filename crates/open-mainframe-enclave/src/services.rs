//! # WLM enclave services
//!
//! [`EnclaveServices`] is the capability the enclave manager works against.
//! Two variants implement it over the raw [`NativeWorkUnits`] boundary:
//!
//! - [`AuthorizedServices`]: connects once on a durable worker that stays
//!   alive until disconnect, and caches service class tokens per
//!   `(collection, class, name)` so repeated creates skip classification.
//! - [`UnauthorizedServices`]: connects on a dedicated worker and shuts the
//!   worker down with a bounded wait on disconnect.
//!
//! Every native failure is recorded as the calling thread's
//! [`ServiceResult`]. Security denials become [`EnclaveError::SecurityDenied`];
//! anything else is logged and reported as an absent result, leaving the
//! decision to the caller. Nothing is retried.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::codec::{ClassificationInfo, FIELD_LENGTH};
use crate::codes::{FailureKind, RC_OK};
use crate::config::{ServiceMode, WlmConfig};
use crate::error::{EnclaveError, Result};
use crate::native::{ConnectRequest, DeleteData, NativeCall, NativeWorkUnits};
use crate::worker::DurableWorker;

// ─────────────────────── Service result ───────────────────────

/// Outcome of the last native call made by a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResult {
    /// Native service name.
    pub service: &'static str,
    /// Native return code.
    pub return_code: i32,
    /// Native reason code.
    pub reason_code: i32,
    /// Failure category, `None` on success.
    pub failure: Option<FailureKind>,
    /// Data returned by the call (delete records).
    pub return_data: Option<Vec<u8>>,
}

impl ServiceResult {
    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Return code of this layer: 0 ok, 4 already joined, 8 failed,
    /// 12 security denied.
    pub fn service_return_code(&self) -> i32 {
        match self.failure {
            None => 0,
            Some(FailureKind::AlreadyJoined) => 4,
            Some(FailureKind::Unspecified) | Some(FailureKind::OutOfMemory) => 8,
            Some(FailureKind::SecurityDenied) => 12,
        }
    }

    /// One-line diagnostic form.
    pub fn describe(&self) -> String {
        format!(
            "{} rc={} rsn={:#010x} src={} ({})",
            self.service,
            self.return_code,
            self.reason_code,
            self.service_return_code(),
            self.failure.map_or("OK", |k| k.as_str())
        )
    }
}

thread_local! {
    static LAST_RESULT: RefCell<Option<ServiceResult>> = const { RefCell::new(None) };
}

/// Result of the calling thread's most recent native call.
pub fn last_service_result() -> Option<ServiceResult> {
    LAST_RESULT.with(|cell| cell.borrow().clone())
}

fn record(result: ServiceResult) {
    LAST_RESULT.with(|cell| *cell.borrow_mut() = Some(result));
}

/// Record a native outcome and apply the failure policy.
fn check<T>(service: &'static str, call: NativeCall<T>) -> Result<Option<T>> {
    match call {
        Ok(value) => {
            record(ServiceResult {
                service,
                return_code: RC_OK,
                reason_code: 0,
                failure: None,
                return_data: None,
            });
            Ok(Some(value))
        }
        Err(failure) => {
            let kind = FailureKind::classify(failure.return_code, failure.reason_code);
            record(ServiceResult {
                service,
                return_code: failure.return_code,
                reason_code: failure.reason_code,
                failure: Some(kind),
                return_data: None,
            });
            match kind {
                FailureKind::SecurityDenied => {
                    error!(service, rc = failure.return_code, rsn = failure.reason_code, "WLM service denied by security product");
                    Err(EnclaveError::SecurityDenied {
                        service: service.to_string(),
                        return_code: failure.return_code,
                        reason_code: failure.reason_code,
                    })
                }
                FailureKind::OutOfMemory => {
                    error!(service, rc = failure.return_code, rsn = failure.reason_code, "WLM service out of storage");
                    Ok(None)
                }
                FailureKind::AlreadyJoined => {
                    debug!(service, rsn = failure.reason_code, "Thread already joined");
                    Ok(None)
                }
                FailureKind::Unspecified => {
                    warn!(service, rc = failure.return_code, rsn = failure.reason_code, "WLM service failed");
                    Ok(None)
                }
            }
        }
    }
}

/// Like [`check`], additionally keeping returned delete data in the
/// thread's result.
fn check_delete(service: &'static str, call: NativeCall<DeleteData>) -> Result<Option<DeleteData>> {
    let data = check(service, call)?;
    if let Some(data) = &data {
        LAST_RESULT.with(|cell| {
            if let Some(result) = cell.borrow_mut().as_mut() {
                result.return_data = Some(data.as_bytes().to_vec());
            }
        });
    }
    Ok(data)
}

// ─────────────────────── Capability ───────────────────────

/// Enclave operations offered to the enclave manager.
///
/// Methods return `Ok(None)` / `Ok(false)` when the native call failed for
/// a reason other than security; the details are in
/// [`last_service_result`].
pub trait EnclaveServices: Send + Sync {
    /// Privilege level of this variant.
    fn mode(&self) -> ServiceMode;

    /// Connect to WLM. Failure is fatal to activation.
    fn connect(&self) -> Result<()>;

    /// Drop the connection and stop the connect worker.
    fn disconnect(&self) -> Result<()>;

    /// Current connection token.
    fn connect_token(&self) -> Option<i64>;

    /// Create an enclave.
    fn create(&self, info: &ClassificationInfo, arrival: SystemTime) -> Result<Option<Vec<u8>>>;

    /// Create an enclave and join the calling thread to it.
    fn create_join(
        &self,
        transaction_class: &[u8; FIELD_LENGTH],
        arrival: SystemTime,
    ) -> Result<Option<Vec<u8>>>;

    /// Join the calling thread to an enclave.
    fn join(&self, token: &[u8]) -> Result<bool>;

    /// Remove the calling thread from an enclave.
    fn leave(&self, token: &[u8]) -> Result<bool>;

    /// Delete an enclave.
    fn delete(&self, token: &[u8]) -> Result<Option<DeleteData>>;

    /// Leave and delete an enclave in one call.
    fn leave_delete(&self, token: &[u8]) -> Result<Option<DeleteData>>;

    /// Register an enclave. Returns the registration token.
    fn register(&self, token: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Drop a registration.
    fn deregister(&self, token: &[u8], registration: &[u8]) -> Result<bool>;

    /// Append a diagnostic dump.
    fn introspect(&self, out: &mut String);
}

/// Build the variant selected by configuration.
pub fn build_services(
    config: &WlmConfig,
    native: Arc<dyn NativeWorkUnits>,
) -> Arc<dyn EnclaveServices> {
    match config.mode {
        ServiceMode::Authorized => Arc::new(AuthorizedServices::new(config, native)),
        ServiceMode::Unauthorized => Arc::new(UnauthorizedServices::new(config, native)),
    }
}

// ─────────────────────── Shared connection ───────────────────────

/// Connection state and the calls common to both variants.
struct Connection {
    native: Arc<dyn NativeWorkUnits>,
    request: ConnectRequest,
    worker_name: &'static str,
    token: RwLock<Option<i64>>,
    worker: Mutex<Option<DurableWorker>>,
}

impl Connection {
    fn new(config: &WlmConfig, native: Arc<dyn NativeWorkUnits>, worker_name: &'static str) -> Self {
        Self {
            native,
            request: ConnectRequest {
                subsystem: config.subsystem.clone(),
                subsystem_name: config.subsystem_name.clone(),
                create_function_name: config.create_function_name.clone(),
                collection_name: config.collection_name.clone(),
            },
            worker_name,
            token: RwLock::new(None),
            worker: Mutex::new(None),
        }
    }

    fn token(&self) -> Option<i64> {
        *self.token.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_token(&self) -> Result<i64> {
        self.token().ok_or(EnclaveError::NotConnected)
    }

    /// Connect on a fresh durable worker, keeping the worker afterwards.
    fn connect(&self) -> Result<()> {
        let mut worker_slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.token().is_some() {
            return Ok(());
        }

        let worker = DurableWorker::spawn(self.worker_name)?;
        let native = Arc::clone(&self.native);
        let request = self.request.clone();
        let outcome = worker.run(move || native.connect(&request))?;

        match check("connect", outcome)? {
            Some(token) => {
                *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
                *worker_slot = Some(worker);
                debug!(
                    subsystem = %self.request.subsystem,
                    subsystem_name = %self.request.subsystem_name,
                    token,
                    "Connected to WLM"
                );
                Ok(())
            }
            None => {
                worker.shutdown(None);
                let (return_code, reason_code) = last_service_result()
                    .map_or((-1, 0), |r| (r.return_code, r.reason_code));
                Err(EnclaveError::ConnectFailed {
                    subsystem: self.request.subsystem.clone(),
                    subsystem_name: self.request.subsystem_name.clone(),
                    return_code,
                    reason_code,
                })
            }
        }
    }

    /// Disconnect on the worker that connected, then stop it.
    fn disconnect(&self, shutdown_wait: Option<Duration>) -> Result<()> {
        let mut worker_slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let token = self.token.write().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = worker_slot.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if let Some(token) = token {
            let native = Arc::clone(&self.native);
            match worker.run(move || native.disconnect(token)) {
                Ok(outcome) => {
                    if let Err(e) = check("disconnect", outcome) {
                        result = Err(e);
                    }
                }
                Err(e) => result = Err(e),
            }
            debug!(token, "Disconnected from WLM");
        }
        worker.shutdown(shutdown_wait);
        result
    }

    fn create(
        &self,
        info: &ClassificationInfo,
        service_class_token: Option<u32>,
        arrival: SystemTime,
    ) -> Result<Option<Vec<u8>>> {
        let token = self.require_token()?;
        check(
            "create",
            self.native
                .create_work_unit(token, info, service_class_token, arrival),
        )
    }

    fn create_join(
        &self,
        transaction_class: &[u8; FIELD_LENGTH],
        service_class_token: Option<u32>,
        arrival: SystemTime,
    ) -> Result<Option<Vec<u8>>> {
        let token = self.require_token()?;
        check(
            "create_join",
            self.native.create_join_work_unit(
                token,
                transaction_class,
                service_class_token,
                arrival,
            ),
        )
    }

    fn join(&self, token: &[u8]) -> Result<bool> {
        Ok(check("join", self.native.join_work_unit(token))?.is_some())
    }

    fn leave(&self, token: &[u8]) -> Result<bool> {
        Ok(check("leave", self.native.leave_work_unit(token))?.is_some())
    }

    fn delete(&self, token: &[u8]) -> Result<Option<DeleteData>> {
        check_delete("delete", self.native.delete_work_unit(token))
    }

    fn leave_delete(&self, token: &[u8]) -> Result<Option<DeleteData>> {
        check_delete("leave_delete", self.native.leave_delete_work_unit(token))
    }

    fn register(&self, token: &[u8]) -> Result<Option<Vec<u8>>> {
        check("register", self.native.register_work_unit(token))
    }

    fn deregister(&self, token: &[u8], registration: &[u8]) -> Result<bool> {
        Ok(check(
            "deregister",
            self.native.deregister_work_unit(token, registration),
        )?
        .is_some())
    }

    fn introspect(&self, mode: ServiceMode, out: &mut String) {
        let _ = writeln!(out, "  MODE: {}", mode.as_str());
        let _ = writeln!(
            out,
            "  SUBSYSTEM: {}/{}  COLLECTION: {}",
            self.request.subsystem, self.request.subsystem_name, self.request.collection_name
        );
        match self.token() {
            Some(token) => {
                let _ = writeln!(out, "  CONNECT TOKEN: {token:#018X}  WORKER: {}", self.worker_name);
            }
            None => {
                let _ = writeln!(out, "  NOT CONNECTED");
            }
        }
    }
}

// ─────────────────────── Authorized ───────────────────────

/// Key of the service class token cache.
type ServiceClassKey = (String, String, String);

/// Supervisor-state services.
pub struct AuthorizedServices {
    connection: Connection,
    service_classes: DashMap<ServiceClassKey, u32>,
}

impl AuthorizedServices {
    /// Create unconnected services.
    pub fn new(config: &WlmConfig, native: Arc<dyn NativeWorkUnits>) -> Self {
        Self {
            connection: Connection::new(config, native, "wlm-authorized-connect"),
            service_classes: DashMap::new(),
        }
    }

    /// Number of cached service class tokens.
    pub fn cached_service_classes(&self) -> usize {
        self.service_classes.len()
    }

    /// Cached service class token, classifying on a miss. A failed
    /// classification is not cached and the create proceeds without one.
    fn service_class(&self, info: &ClassificationInfo) -> Result<Option<u32>> {
        let (class, name) = info.decode();
        let key = (self.connection.request.collection_name.clone(), class, name);
        if let Some(hit) = self.service_classes.get(&key) {
            return Ok(Some(*hit));
        }
        let connect_token = self.connection.require_token()?;
        let token = check("classify", self.connection.native.classify(connect_token, info))?;
        if let Some(token) = token {
            self.service_classes.insert(key, token);
        }
        Ok(token)
    }
}

impl EnclaveServices for AuthorizedServices {
    fn mode(&self) -> ServiceMode {
        ServiceMode::Authorized
    }

    fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    fn disconnect(&self) -> Result<()> {
        self.service_classes.clear();
        self.connection.disconnect(None)
    }

    fn connect_token(&self) -> Option<i64> {
        self.connection.token()
    }

    fn create(&self, info: &ClassificationInfo, arrival: SystemTime) -> Result<Option<Vec<u8>>> {
        let service_class = self.service_class(info)?;
        self.connection.create(info, service_class, arrival)
    }

    fn create_join(
        &self,
        transaction_class: &[u8; FIELD_LENGTH],
        arrival: SystemTime,
    ) -> Result<Option<Vec<u8>>> {
        let info = ClassificationInfo::for_class_field(transaction_class);
        let service_class = self.service_class(&info)?;
        self.connection
            .create_join(transaction_class, service_class, arrival)
    }

    fn join(&self, token: &[u8]) -> Result<bool> {
        self.connection.join(token)
    }

    fn leave(&self, token: &[u8]) -> Result<bool> {
        self.connection.leave(token)
    }

    fn delete(&self, token: &[u8]) -> Result<Option<DeleteData>> {
        self.connection.delete(token)
    }

    fn leave_delete(&self, token: &[u8]) -> Result<Option<DeleteData>> {
        self.connection.leave_delete(token)
    }

    fn register(&self, token: &[u8]) -> Result<Option<Vec<u8>>> {
        self.connection.register(token)
    }

    fn deregister(&self, token: &[u8], registration: &[u8]) -> Result<bool> {
        self.connection.deregister(token, registration)
    }

    fn introspect(&self, out: &mut String) {
        self.connection.introspect(self.mode(), out);
        let _ = writeln!(out, "  SERVICE CLASS CACHE: {}", self.service_classes.len());
        for entry in self.service_classes.iter() {
            let (collection, class, name) = entry.key();
            let _ = writeln!(out, "    {collection:<8} {class:<8} {name:<8} {:#010X}", entry.value());
        }
    }
}

// ─────────────────────── Unauthorized ───────────────────────

/// Problem-state services.
pub struct UnauthorizedServices {
    connection: Connection,
    shutdown_timeout: Duration,
}

impl UnauthorizedServices {
    /// Create unconnected services.
    pub fn new(config: &WlmConfig, native: Arc<dyn NativeWorkUnits>) -> Self {
        Self {
            connection: Connection::new(config, native, "wlm-unauthorized-connect"),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

impl EnclaveServices for UnauthorizedServices {
    fn mode(&self) -> ServiceMode {
        ServiceMode::Unauthorized
    }

    fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    fn disconnect(&self) -> Result<()> {
        self.connection.disconnect(Some(self.shutdown_timeout))
    }

    fn connect_token(&self) -> Option<i64> {
        self.connection.token()
    }

    fn create(&self, info: &ClassificationInfo, arrival: SystemTime) -> Result<Option<Vec<u8>>> {
        self.connection.create(info, None, arrival)
    }

    fn create_join(
        &self,
        transaction_class: &[u8; FIELD_LENGTH],
        arrival: SystemTime,
    ) -> Result<Option<Vec<u8>>> {
        self.connection.create_join(transaction_class, None, arrival)
    }

    fn join(&self, token: &[u8]) -> Result<bool> {
        self.connection.join(token)
    }

    fn leave(&self, token: &[u8]) -> Result<bool> {
        self.connection.leave(token)
    }

    fn delete(&self, token: &[u8]) -> Result<Option<DeleteData>> {
        self.connection.delete(token)
    }

    fn leave_delete(&self, token: &[u8]) -> Result<Option<DeleteData>> {
        self.connection.leave_delete(token)
    }

    fn register(&self, token: &[u8]) -> Result<Option<Vec<u8>>> {
        self.connection.register(token)
    }

    fn deregister(&self, token: &[u8], registration: &[u8]) -> Result<bool> {
        self.connection.deregister(token, registration)
    }

    fn introspect(&self, out: &mut String) {
        self.connection.introspect(self.mode(), out);
        let _ = writeln!(out, "  SHUTDOWN WAIT: {}s", self.shutdown_timeout.as_secs());
    }
}

// ─────────────────────── Tests ───────────────────────
