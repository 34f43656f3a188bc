//! # Enclaves
//!
//! An [`Enclave`] is the in-process handle for a WLM enclave token. It
//! counts work that intends to join (pending) and threads that have joined
//! (in use), and remembers whether this process created it and may delete
//! it. All counter changes and the delete decision happen under the
//! enclave's own lock.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::{EnclaveError, Result};

// ─────────────────────── Token ───────────────────────

/// Opaque enclave token issued by WLM.
#[derive(Clone, PartialEq, Eq)]
pub struct EnclaveToken(Arc<[u8]>);

impl EnclaveToken {
    /// Wrap raw token bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a canonical hex key.
    pub fn from_key(key: &str) -> Result<Self> {
        hex::decode(key.trim())
            .ok()
            .filter(|bytes| !bytes.is_empty())
            .map(Self::new)
            .ok_or_else(|| EnclaveError::InvalidToken {
                key: key.to_string(),
            })
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Canonical upper-case hex form, used as the registry key.
    pub fn key(&self) -> String {
        hex::encode_upper(&self.0)
    }
}

/// Tokens differ mostly in their trailing bytes, so only the last four
/// are hashed.
impl Hash for EnclaveToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let start = self.0.len().saturating_sub(4);
        self.0[start..].hash(state);
    }
}

impl fmt::Display for EnclaveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl fmt::Debug for EnclaveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnclaveToken({})", self.key())
    }
}

// ─────────────────────── State ───────────────────────

/// Lifecycle state derived from the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveState {
    /// Work intends to join; nobody has joined yet.
    Pending,
    /// At least one thread is joined.
    Joined,
    /// Not in use.
    Left,
    /// Deleted; the token is dead.
    Deleted,
}

impl EnclaveState {
    /// String representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Joined => "JOINED",
            Self::Left => "LEFT",
            Self::Deleted => "DELETED",
        }
    }
}

/// Lock-protected part of an enclave.
#[derive(Debug)]
pub(crate) struct Usage {
    pub(crate) pending: u32,
    pub(crate) in_use: u32,
    pub(crate) owned: bool,
    pub(crate) auto_delete: bool,
    pub(crate) registration: Option<Vec<u8>>,
    pub(crate) deleted: bool,
}

impl Usage {
    fn new(owned: bool) -> Self {
        Self {
            pending: 0,
            in_use: 0,
            owned,
            auto_delete: true,
            registration: None,
            deleted: false,
        }
    }

    pub(crate) fn add_pending(&mut self) {
        self.pending += 1;
    }

    /// Turn one pending use into an in-use count.
    pub(crate) fn begin_use(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.in_use += 1;
    }

    pub(crate) fn end_use(&mut self) {
        if self.in_use == 0 {
            warn!("Enclave in-use count already zero");
        }
        self.in_use = self.in_use.saturating_sub(1);
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.in_use > 0 || self.pending > 0
    }

    /// Whether leaving may delete the enclave implicitly.
    pub(crate) fn deletable_on_leave(&self) -> bool {
        !self.deleted
            && !self.is_in_use()
            && self.owned
            && self.auto_delete
            && self.registration.is_none()
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
        self.owned = false;
    }

    fn state(&self) -> EnclaveState {
        if self.deleted {
            EnclaveState::Deleted
        } else if self.in_use > 0 {
            EnclaveState::Joined
        } else if self.pending > 0 {
            EnclaveState::Pending
        } else {
            EnclaveState::Left
        }
    }
}

// ─────────────────────── Enclave ───────────────────────

/// A WLM enclave known to this process.
#[derive(Debug)]
pub struct Enclave {
    token: EnclaveToken,
    usage: Mutex<Usage>,
}

/// Point-in-time view of an enclave, for reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveSnapshot {
    /// Token key.
    pub key: String,
    /// Lifecycle state.
    pub state: EnclaveState,
    /// Pending use count.
    pub pending: u32,
    /// In-use count.
    pub in_use: u32,
    /// Created by this process.
    pub created_by_manager: bool,
    /// Auto-delete on last leave.
    pub auto_delete: bool,
    /// Registered.
    pub registered: bool,
}

impl Enclave {
    /// Wrap a token. `created_by_manager` decides whether this process may
    /// delete it.
    pub fn new(token: EnclaveToken, created_by_manager: bool) -> Self {
        Self {
            token,
            usage: Mutex::new(Usage::new(created_by_manager)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Usage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The enclave token.
    pub fn token(&self) -> &EnclaveToken {
        &self.token
    }

    /// Registry key.
    pub fn key(&self) -> String {
        self.token.key()
    }

    /// Users that will join but have not yet.
    pub fn pending_use_count(&self) -> u32 {
        self.lock().pending
    }

    /// Threads currently joined.
    pub fn in_use_count(&self) -> u32 {
        self.lock().in_use
    }

    /// In use when anything is joined or about to join.
    pub fn is_in_use(&self) -> bool {
        self.lock().is_in_use()
    }

    /// Created by the manager rather than adopted.
    pub fn is_created_by_manager(&self) -> bool {
        self.lock().owned
    }

    /// Whether the last leave deletes the enclave.
    pub fn is_auto_delete(&self) -> bool {
        self.lock().auto_delete
    }

    /// Registered with WLM.
    pub fn is_registered(&self) -> bool {
        self.lock().registration.is_some()
    }

    /// Registration token, if registered.
    pub fn registration_token(&self) -> Option<Vec<u8>> {
        self.lock().registration.clone()
    }

    /// Deleted natively; no further use is allowed.
    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EnclaveState {
        self.lock().state()
    }

    /// Consistent view of all counters and flags.
    pub fn snapshot(&self) -> EnclaveSnapshot {
        let usage = self.lock();
        EnclaveSnapshot {
            key: self.key(),
            state: usage.state(),
            pending: usage.pending,
            in_use: usage.in_use,
            created_by_manager: usage.owned,
            auto_delete: usage.auto_delete,
            registered: usage.registration.is_some(),
        }
    }
}

impl fmt::Display for Enclave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot();
        write!(
            f,
            "{} {} pending={} inuse={} owned={} autodelete={} registered={}",
            s.key,
            s.state.as_str(),
            s.pending,
            s.in_use,
            s.created_by_manager,
            s.auto_delete,
            s.registered
        )
    }
}

// ─────────────────────── Tests ───────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(token: &EnclaveToken) -> u64 {
        let mut h = DefaultHasher::new();
        token.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_token_key_roundtrip() {
        let token = EnclaveToken::new(vec![0x20, 0, 0, 0, 0, 0, 0, 0xAB]);
        assert_eq!(token.key(), "20000000000000AB");
        assert_eq!(EnclaveToken::from_key("20000000000000ab").unwrap(), token);
    }

    #[test]
    fn test_bad_keys() {
        assert!(matches!(
            EnclaveToken::from_key("XYZ"),
            Err(EnclaveError::InvalidToken { .. })
        ));
        assert!(EnclaveToken::from_key("").is_err());
    }

    #[test]
    fn test_hash_uses_last_four_bytes() {
        let a = EnclaveToken::new(vec![1, 2, 3, 4, 9, 9, 9, 9]);
        let b = EnclaveToken::new(vec![5, 6, 7, 8, 9, 9, 9, 9]);
        assert_ne!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_new_enclave_state() {
        let enclave = Enclave::new(EnclaveToken::new(vec![1; 8]), true);
        assert_eq!(enclave.state(), EnclaveState::Left);
        assert!(!enclave.is_in_use());
        assert!(enclave.is_created_by_manager());
        assert!(enclave.is_auto_delete());
        assert!(!enclave.is_registered());
    }

    #[test]
    fn test_usage_transitions() {
        let mut usage = Usage::new(true);
        usage.add_pending();
        assert_eq!(usage.state(), EnclaveState::Pending);
        usage.begin_use();
        assert_eq!((usage.pending, usage.in_use), (0, 1));
        assert_eq!(usage.state(), EnclaveState::Joined);
        usage.end_use();
        assert_eq!(usage.state(), EnclaveState::Left);
        assert!(usage.deletable_on_leave());
        usage.mark_deleted();
        assert_eq!(usage.state(), EnclaveState::Deleted);
        assert!(!usage.deletable_on_leave());
    }

    #[test]
    fn test_deletable_rules() {
        let mut usage = Usage::new(false);
        assert!(!usage.deletable_on_leave());

        usage.owned = true;
        usage.auto_delete = false;
        assert!(!usage.deletable_on_leave());

        usage.auto_delete = true;
        usage.registration = Some(vec![1]);
        assert!(!usage.deletable_on_leave());

        usage.registration = None;
        usage.add_pending();
        assert!(!usage.deletable_on_leave());
    }

    #[test]
    fn test_display() {
        let enclave = Enclave::new(EnclaveToken::new(vec![0xAB; 2]), false);
        assert_eq!(
            enclave.to_string(),
            "ABAB LEFT pending=0 inuse=0 owned=false autodelete=true registered=false"
        );
    }

    proptest! {
        #[test]
        fn prop_counters_never_negative(ops in proptest::collection::vec(0u8..3, 0..64)) {
            let mut usage = Usage::new(true);
            for op in ops {
                match op {
                    0 => usage.add_pending(),
                    1 => usage.begin_use(),
                    _ => usage.end_use(),
                }
                prop_assert_eq!(usage.is_in_use(), usage.pending > 0 || usage.in_use > 0);
                prop_assert_eq!(usage.state() == EnclaveState::Left, !usage.is_in_use());
            }
        }
    }
}
