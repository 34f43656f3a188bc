//! Native enclave service boundary.
//!
//! [`NativeWorkUnits`] is the narrow contract the enclave core needs from
//! the operating system: connect to WLM, then create, join, leave and delete
//! work units. Every call is one-shot and synchronous; failures carry the
//! raw return and reason codes and nothing else.
//!
//! [`SimulatedNative`] implements the contract in memory with the same
//! thread affinity as the real services (a join binds the calling thread),
//! so the core can run and be tested away from z/OS.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Instant, SystemTime};

use crate::codec::{ClassificationInfo, FIELD_LENGTH};
use crate::codes::{RC_IWM_ERROR, RSN_ALREADY_JOINED};

/// Return and reason codes of a failed native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFailure {
    /// Return code (severity or errno).
    pub return_code: i32,
    /// Reason code.
    pub reason_code: i32,
}

impl NativeFailure {
    /// Construct a failure.
    pub fn new(return_code: i32, reason_code: i32) -> Self {
        Self {
            return_code,
            reason_code,
        }
    }
}

impl fmt::Display for NativeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rc={}, rsn={:#010x}", self.return_code, self.reason_code)
    }
}

/// Outcome of a native call.
pub type NativeCall<T> = std::result::Result<T, NativeFailure>;

/// Unspecified reason: the token does not name a live work unit.
pub const RSN_UNKNOWN_TOKEN: i32 = 0x0811;
/// Unspecified reason: the thread is not joined to the work unit.
pub const RSN_NOT_JOINED: i32 = 0x0836;

// ---------------------------------------------------------------------------
//  Delete data
// ---------------------------------------------------------------------------

/// Record returned by the delete services.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeleteData {
    bytes: [u8; DeleteData::LENGTH],
}

impl DeleteData {
    /// Record length.
    pub const LENGTH: usize = 64;
    /// Offset of the echoed enclave token.
    pub const TOKEN_OFFSET: usize = 56;

    /// Wrap a raw record.
    pub fn new(bytes: [u8; Self::LENGTH]) -> Self {
        Self { bytes }
    }

    /// Raw record bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.bytes
    }

    /// The enclave token echoed at offset 56.
    pub fn token(&self) -> &[u8] {
        &self.bytes[Self::TOKEN_OFFSET..]
    }
}

impl fmt::Debug for DeleteData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteData")
            .field("token", &hex::encode_upper(self.token()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
//  Boundary
// ---------------------------------------------------------------------------

/// Identity presented when connecting to WLM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Subsystem type.
    pub subsystem: String,
    /// Subsystem name.
    pub subsystem_name: String,
    /// Create function name.
    pub create_function_name: String,
    /// Collection name.
    pub collection_name: String,
}

/// Raw native WLM enclave services.
pub trait NativeWorkUnits: Send + Sync {
    /// Connect as a work manager. Returns the connection token.
    fn connect(&self, request: &ConnectRequest) -> NativeCall<i64>;

    /// Drop a connection.
    fn disconnect(&self, connect_token: i64) -> NativeCall<()>;

    /// Classify work, returning a service class token.
    fn classify(&self, connect_token: i64, info: &ClassificationInfo) -> NativeCall<u32>;

    /// Create an enclave.
    fn create_work_unit(
        &self,
        connect_token: i64,
        info: &ClassificationInfo,
        service_class_token: Option<u32>,
        arrival: SystemTime,
    ) -> NativeCall<Vec<u8>>;

    /// Create an enclave and join the calling thread to it.
    fn create_join_work_unit(
        &self,
        connect_token: i64,
        transaction_class: &[u8; FIELD_LENGTH],
        service_class_token: Option<u32>,
        arrival: SystemTime,
    ) -> NativeCall<Vec<u8>>;

    /// Join the calling thread to an enclave.
    fn join_work_unit(&self, token: &[u8]) -> NativeCall<()>;

    /// Remove the calling thread from an enclave.
    fn leave_work_unit(&self, token: &[u8]) -> NativeCall<()>;

    /// Delete an enclave.
    fn delete_work_unit(&self, token: &[u8]) -> NativeCall<DeleteData>;

    /// Leave, then delete, in one call.
    fn leave_delete_work_unit(&self, token: &[u8]) -> NativeCall<DeleteData>;

    /// Register interest in an enclave. Returns the registration token.
    fn register_work_unit(&self, token: &[u8]) -> NativeCall<Vec<u8>>;

    /// Drop a registration.
    fn deregister_work_unit(&self, token: &[u8], registration: &[u8]) -> NativeCall<()>;
}

// ---------------------------------------------------------------------------
//  Simulation
// ---------------------------------------------------------------------------

/// Native operations, for call counting and failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    Connect,
    Disconnect,
    Classify,
    Create,
    CreateJoin,
    Join,
    Leave,
    Delete,
    LeaveDelete,
    Register,
    Deregister,
}

#[derive(Debug)]
struct SimEnclave {
    transaction_class: String,
    created: Instant,
    joined: usize,
    registrations: usize,
}

#[derive(Debug, Default)]
struct SimState {
    connections: HashMap<i64, ConnectRequest>,
    enclaves: HashMap<Vec<u8>, SimEnclave>,
    joined: HashMap<ThreadId, Vec<u8>>,
    calls: HashMap<NativeOp, usize>,
    scripted: HashMap<NativeOp, Vec<NativeFailure>>,
}

/// In-memory native services.
#[derive(Debug, Default)]
pub struct SimulatedNative {
    state: Mutex<SimState>,
    next_token: AtomicU64,
}

impl SimulatedNative {
    /// Create an empty simulation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with the given codes.
    pub fn fail_next(&self, op: NativeOp, failure: NativeFailure) {
        self.lock().scripted.entry(op).or_default().push(failure);
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn calls(&self, op: NativeOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of live enclaves.
    pub fn live_enclaves(&self) -> usize {
        self.lock().enclaves.len()
    }

    /// Whether a token names a live enclave.
    pub fn is_live(&self, token: &[u8]) -> bool {
        self.lock().enclaves.contains_key(token)
    }

    /// Number of threads joined to an enclave.
    pub fn joined_count(&self, token: &[u8]) -> usize {
        self.lock().enclaves.get(token).map_or(0, |e| e.joined)
    }

    /// Transaction class an enclave was created with.
    pub fn transaction_class(&self, token: &[u8]) -> Option<String> {
        self.lock()
            .enclaves
            .get(token)
            .map(|e| e.transaction_class.clone())
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and consume a scripted failure, if any.
    fn begin(&self, op: NativeOp) -> NativeCall<MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(failures) = state.scripted.get_mut(&op) {
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        Ok(state)
    }

    fn new_token(&self) -> Vec<u8> {
        let n = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        (0x2000_0000_0000_0000u64 | n).to_be_bytes().to_vec()
    }

    fn create(state: &mut SimState, token: Vec<u8>, transaction_class: String) {
        state.enclaves.insert(
            token,
            SimEnclave {
                transaction_class,
                created: Instant::now(),
                joined: 0,
                registrations: 0,
            },
        );
    }

    fn join(state: &mut SimState, token: &[u8]) -> NativeCall<()> {
        let me = thread::current().id();
        if state.joined.contains_key(&me) {
            return Err(NativeFailure::new(RC_IWM_ERROR, RSN_ALREADY_JOINED));
        }
        let enclave = state
            .enclaves
            .get_mut(token)
            .ok_or(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN))?;
        enclave.joined += 1;
        state.joined.insert(me, token.to_vec());
        Ok(())
    }

    fn leave(state: &mut SimState, token: &[u8]) -> NativeCall<()> {
        let me = thread::current().id();
        if state.joined.get(&me).map(Vec::as_slice) != Some(token) {
            return Err(NativeFailure::new(RC_IWM_ERROR, RSN_NOT_JOINED));
        }
        state.joined.remove(&me);
        if let Some(enclave) = state.enclaves.get_mut(token) {
            enclave.joined = enclave.joined.saturating_sub(1);
        }
        Ok(())
    }

    fn delete(state: &mut SimState, token: &[u8]) -> NativeCall<DeleteData> {
        let enclave = state
            .enclaves
            .remove(token)
            .ok_or(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN))?;
        state.joined.retain(|_, joined| joined.as_slice() != token);

        let mut bytes = [0u8; DeleteData::LENGTH];
        let elapsed = u64::try_from(enclave.created.elapsed().as_micros()).unwrap_or(u64::MAX);
        bytes[..8].copy_from_slice(&elapsed.to_be_bytes());
        let len = token.len().min(DeleteData::LENGTH - DeleteData::TOKEN_OFFSET);
        bytes[DeleteData::TOKEN_OFFSET..DeleteData::TOKEN_OFFSET + len]
            .copy_from_slice(&token[..len]);
        Ok(DeleteData::new(bytes))
    }
}

impl NativeWorkUnits for SimulatedNative {
    fn connect(&self, request: &ConnectRequest) -> NativeCall<i64> {
        let mut state = self.begin(NativeOp::Connect)?;
        let token = i64::try_from(self.next_token.fetch_add(1, Ordering::Relaxed) + 1)
            .unwrap_or(i64::MAX);
        state.connections.insert(token, request.clone());
        Ok(token)
    }

    fn disconnect(&self, connect_token: i64) -> NativeCall<()> {
        let mut state = self.begin(NativeOp::Disconnect)?;
        state
            .connections
            .remove(&connect_token)
            .map(|_| ())
            .ok_or(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN))
    }

    fn classify(&self, connect_token: i64, info: &ClassificationInfo) -> NativeCall<u32> {
        let state = self.begin(NativeOp::Classify)?;
        if !state.connections.contains_key(&connect_token) {
            return Err(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN));
        }
        let class = info.transaction_class();
        Ok(class
            .bytes()
            .fold(0x0001_0000u32, |acc, b| acc.rotate_left(5) ^ u32::from(b)))
    }

    fn create_work_unit(
        &self,
        connect_token: i64,
        info: &ClassificationInfo,
        _service_class_token: Option<u32>,
        _arrival: SystemTime,
    ) -> NativeCall<Vec<u8>> {
        let mut state = self.begin(NativeOp::Create)?;
        if !state.connections.contains_key(&connect_token) {
            return Err(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN));
        }
        let token = self.new_token();
        Self::create(&mut state, token.clone(), info.transaction_class());
        Ok(token)
    }

    fn create_join_work_unit(
        &self,
        connect_token: i64,
        transaction_class: &[u8; FIELD_LENGTH],
        _service_class_token: Option<u32>,
        _arrival: SystemTime,
    ) -> NativeCall<Vec<u8>> {
        let mut state = self.begin(NativeOp::CreateJoin)?;
        if !state.connections.contains_key(&connect_token) {
            return Err(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN));
        }
        if state.joined.contains_key(&thread::current().id()) {
            return Err(NativeFailure::new(RC_IWM_ERROR, RSN_ALREADY_JOINED));
        }
        let token = self.new_token();
        let class = crate::codec::decode_field(transaction_class);
        Self::create(&mut state, token.clone(), class);
        Self::join(&mut state, &token)?;
        Ok(token)
    }

    fn join_work_unit(&self, token: &[u8]) -> NativeCall<()> {
        let mut state = self.begin(NativeOp::Join)?;
        Self::join(&mut state, token)
    }

    fn leave_work_unit(&self, token: &[u8]) -> NativeCall<()> {
        let mut state = self.begin(NativeOp::Leave)?;
        Self::leave(&mut state, token)
    }

    fn delete_work_unit(&self, token: &[u8]) -> NativeCall<DeleteData> {
        let mut state = self.begin(NativeOp::Delete)?;
        Self::delete(&mut state, token)
    }

    fn leave_delete_work_unit(&self, token: &[u8]) -> NativeCall<DeleteData> {
        let mut state = self.begin(NativeOp::LeaveDelete)?;
        Self::leave(&mut state, token)?;
        Self::delete(&mut state, token)
    }

    fn register_work_unit(&self, token: &[u8]) -> NativeCall<Vec<u8>> {
        let mut state = self.begin(NativeOp::Register)?;
        let enclave = state
            .enclaves
            .get_mut(token)
            .ok_or(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN))?;
        enclave.registrations += 1;
        let mut registration = token.to_vec();
        registration.extend_from_slice(&(enclave.registrations as u32).to_be_bytes());
        Ok(registration)
    }

    fn deregister_work_unit(&self, token: &[u8], _registration: &[u8]) -> NativeCall<()> {
        let mut state = self.begin(NativeOp::Deregister)?;
        let enclave = state
            .enclaves
            .get_mut(token)
            .ok_or(NativeFailure::new(RC_IWM_ERROR, RSN_UNKNOWN_TOKEN))?;
        enclave.registrations = enclave.registrations.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_field;

    fn connected() -> (SimulatedNative, i64) {
        let native = SimulatedNative::new();
        let token = native
            .connect(&ConnectRequest {
                subsystem: "CB".into(),
                subsystem_name: "SRV".into(),
                create_function_name: "CBWLM".into(),
                collection_name: "LIBERTY".into(),
            })
            .unwrap();
        (native, token)
    }

    #[test]
    fn test_create_join_leave_delete() {
        let (native, conn) = connected();
        let info = ClassificationInfo::new("TC1", None);
        let token = native
            .create_work_unit(conn, &info, None, SystemTime::now())
            .unwrap();
        assert_eq!(token.len(), 8);
        assert_eq!(native.transaction_class(&token).as_deref(), Some("TC1"));

        native.join_work_unit(&token).unwrap();
        assert_eq!(native.joined_count(&token), 1);
        native.leave_work_unit(&token).unwrap();
        let data = native.delete_work_unit(&token).unwrap();
        assert_eq!(data.token(), token.as_slice());
        assert_eq!(native.live_enclaves(), 0);
    }

    #[test]
    fn test_thread_can_join_only_once() {
        let (native, conn) = connected();
        let token = native
            .create_join_work_unit(conn, &encode_field("TC1"), None, SystemTime::now())
            .unwrap();
        let err = native.join_work_unit(&token).unwrap_err();
        assert_eq!(err.reason_code, RSN_ALREADY_JOINED);

        let data = native.leave_delete_work_unit(&token).unwrap();
        assert_eq!(data.token(), token.as_slice());
    }

    #[test]
    fn test_leave_requires_join() {
        let (native, conn) = connected();
        let token = native
            .create_work_unit(conn, &ClassificationInfo::new("X", None), None, SystemTime::now())
            .unwrap();
        assert_eq!(
            native.leave_work_unit(&token).unwrap_err().reason_code,
            RSN_NOT_JOINED
        );
    }

    #[test]
    fn test_scripted_failure_consumed_once() {
        let (native, _) = connected();
        native.fail_next(NativeOp::Delete, NativeFailure::new(111, 0));
        assert_eq!(native.delete_work_unit(b"nope").unwrap_err().return_code, 111);
        assert_eq!(
            native.delete_work_unit(b"nope").unwrap_err().reason_code,
            RSN_UNKNOWN_TOKEN
        );
        assert_eq!(native.calls(NativeOp::Delete), 2);
    }

    #[test]
    fn test_create_needs_connection() {
        let native = SimulatedNative::new();
        assert!(native
            .create_work_unit(7, &ClassificationInfo::new("X", None), None, SystemTime::now())
            .is_err());
    }
}
