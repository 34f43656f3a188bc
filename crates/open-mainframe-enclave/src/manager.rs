//! # Enclave Manager
//!
//! Drives enclaves through their lifecycle: create, pre-join, join, leave
//! and delete. Each decision that can end in a native delete is made under
//! the enclave's lock, and the enclave leaves the registry before the
//! native delete is issued, so racing leavers delete at most once.
//!
//! The enclave a thread is joined to is kept in a thread-local slot, one
//! per manager.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::codec::{decode_field, ClassificationInfo, FIELD_LENGTH};
use crate::codes::FailureKind;
use crate::config::WlmConfig;
use crate::enclave::{Enclave, EnclaveToken, Usage};
use crate::error::{EnclaveError, Result};
use crate::native::{DeleteData, NativeWorkUnits};
use crate::registry::EnclaveRegistry;
use crate::services::{build_services, last_service_result, EnclaveServices};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<HashMap<u64, Arc<Enclave>>> = RefCell::new(HashMap::new());
}

/// Creation and deletion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnclaveStats {
    /// Enclaves created by this manager.
    pub created: u64,
    /// Enclaves this manager deleted.
    pub deleted: u64,
    /// Enclaves currently in the registry.
    pub live: usize,
}

/// Owns the enclave registry and the enclave services.
pub struct EnclaveManager {
    id: u64,
    services: Arc<dyn EnclaveServices>,
    registry: EnclaveRegistry,
    created: AtomicU64,
    deleted: AtomicU64,
}

impl fmt::Debug for EnclaveManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveManager")
            .field("id", &self.id)
            .field("mode", &self.services.mode())
            .field("stats", &self.stats())
            .finish()
    }
}

impl EnclaveManager {
    /// Manager over already connected services.
    pub fn new(services: Arc<dyn EnclaveServices>) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            services,
            registry: EnclaveRegistry::new(),
            created: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        }
    }

    /// Build the configured services, connect them and wrap them in a
    /// manager. A failed connect fails activation.
    pub fn activate(config: &WlmConfig, native: Arc<dyn NativeWorkUnits>) -> Result<Self> {
        let services = build_services(config, native);
        services.connect()?;
        info!(
            mode = config.mode.as_str(),
            subsystem = %config.subsystem,
            subsystem_name = %config.subsystem_name,
            "Enclave manager active"
        );
        Ok(Self::new(services))
    }

    /// Disconnect the services.
    pub fn deactivate(&self) -> Result<()> {
        let live = self.registry.len();
        if live > 0 {
            warn!(live, "Deactivating with live enclaves");
        }
        self.services.disconnect()?;
        info!("Enclave manager inactive");
        Ok(())
    }

    /// Native services in use.
    pub fn services(&self) -> &Arc<dyn EnclaveServices> {
        &self.services
    }

    /// Live enclaves created or adopted here.
    pub fn registry(&self) -> &EnclaveRegistry {
        &self.registry
    }

    // ─────────────────────── Lifecycle ───────────────────────

    /// Create an enclave owned by this manager, with one pending use.
    ///
    /// Returns `Ok(None)` when the native create failed; the reason is in
    /// [`last_service_result`].
    pub fn create(
        &self,
        info: &ClassificationInfo,
        arrival: SystemTime,
    ) -> Result<Option<Arc<Enclave>>> {
        let Some(token) = self.services.create(info, arrival)? else {
            return Ok(None);
        };
        let enclave = Arc::new(Enclave::new(EnclaveToken::new(token), true));
        enclave.lock().add_pending();
        let key = self.registry.remember(&enclave);
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, class = %info.transaction_class(), "Enclave created");
        Ok(Some(enclave))
    }

    /// Announce an upcoming join so the enclave is not deleted meanwhile.
    pub fn pre_join_enclave(&self, enclave: &Arc<Enclave>) {
        enclave.lock().add_pending();
    }

    /// Join the calling thread to an enclave, consuming one pending use.
    ///
    /// If the thread is already classified or the native join fails, the
    /// use is rolled back (possibly deleting the enclave) and
    /// [`EnclaveError::AlreadyClassified`] is returned.
    pub fn join_enclave(&self, enclave: &Arc<Enclave>) -> Result<()> {
        let current = self.current();
        let joined = {
            let mut usage = enclave.lock();
            usage.begin_use();
            match current {
                Some(_) => Ok(false),
                None => self.services.join(enclave.token().as_bytes()),
            }
        };

        match joined {
            Ok(true) => {
                self.set_current(enclave);
                debug!(key = %enclave.key(), "Enclave joined");
                Ok(())
            }
            Ok(false) => {
                self.leave(enclave, true)?;
                Err(EnclaveError::AlreadyClassified {
                    current: current.map_or_else(|| "unknown".to_string(), |c| c.key()),
                    requested: enclave.key(),
                })
            }
            Err(e) => {
                self.leave(enclave, true)?;
                Err(e)
            }
        }
    }

    /// Leave a joined enclave. When this was the last use of an owned,
    /// auto-delete, unregistered enclave, it is left and deleted in one
    /// native call and the delete data is returned.
    pub fn leave_enclave(&self, enclave: &Arc<Enclave>) -> Result<Option<DeleteData>> {
        self.leave(enclave, false)
    }

    /// `join_incomplete` undoes a join that never reached the native
    /// layer; no native leave is issued and a delete is a plain delete.
    fn leave(&self, enclave: &Arc<Enclave>, join_incomplete: bool) -> Result<Option<DeleteData>> {
        let mut usage = enclave.lock();
        usage.end_use();

        if usage.deletable_on_leave() {
            return self.delete_locked(enclave, &mut usage, !join_incomplete);
        }
        self.forget_if_external(enclave, &usage);
        if join_incomplete {
            return Ok(None);
        }

        self.clear_current(enclave);
        if self.services.leave(enclave.token().as_bytes())? {
            debug!(key = %enclave.key(), in_use = usage.in_use, "Enclave left");
        }
        Ok(None)
    }

    /// Create an enclave and join the calling thread to it in one native
    /// call.
    pub fn join_new_enclave(
        &self,
        transaction_class: &[u8; FIELD_LENGTH],
        arrival: SystemTime,
    ) -> Result<Option<Arc<Enclave>>> {
        if let Some(current) = self.current() {
            return Err(EnclaveError::AlreadyClassified {
                current: current.key(),
                requested: decode_field(transaction_class),
            });
        }

        let Some(token) = self.services.create_join(transaction_class, arrival)? else {
            let already_joined = last_service_result()
                .is_some_and(|r| r.failure == Some(FailureKind::AlreadyJoined));
            if already_joined {
                return Err(EnclaveError::AlreadyClassified {
                    current: "unknown".to_string(),
                    requested: decode_field(transaction_class),
                });
            }
            return Ok(None);
        };

        let enclave = Arc::new(Enclave::new(EnclaveToken::new(token), true));
        {
            let mut usage = enclave.lock();
            usage.add_pending();
            usage.begin_use();
        }
        let key = self.registry.remember(&enclave);
        self.created.fetch_add(1, Ordering::Relaxed);
        self.set_current(&enclave);
        debug!(key = %key, class = %decode_field(transaction_class), "Enclave created and joined");
        Ok(Some(enclave))
    }

    /// Delete an owned enclave. Unless forced, an enclave in use is kept.
    /// Returns the delete data when a delete was issued and succeeded.
    pub fn delete_enclave(&self, enclave: &Arc<Enclave>, force: bool) -> Result<Option<DeleteData>> {
        let mut usage = enclave.lock();
        if usage.deleted || !usage.owned {
            debug!(key = %enclave.key(), "Enclave not owned, not deleting");
            return Ok(None);
        }
        if usage.is_in_use() && !force {
            debug!(
                key = %enclave.key(),
                pending = usage.pending,
                in_use = usage.in_use,
                "Enclave in use, not deleting"
            );
            return Ok(None);
        }
        self.delete_locked(enclave, &mut usage, false)
    }

    /// Registry removal happens here, before the native call, while the
    /// caller still holds the enclave lock.
    fn delete_locked(
        &self,
        enclave: &Arc<Enclave>,
        usage: &mut Usage,
        leaving: bool,
    ) -> Result<Option<DeleteData>> {
        usage.mark_deleted();
        self.registry.forget(enclave);
        self.clear_current(enclave);

        let token = enclave.token().as_bytes();
        let data = if leaving {
            self.services.leave_delete(token)?
        } else {
            self.services.delete(token)?
        };
        match &data {
            Some(_) => {
                self.deleted.fetch_add(1, Ordering::Relaxed);
                debug!(key = %enclave.key(), leaving, "Enclave deleted");
            }
            None => warn!(key = %enclave.key(), leaving, "Enclave delete failed"),
        }
        Ok(data)
    }

    /// Enclaves this manager does not own are only tracked while in use.
    fn forget_if_external(&self, enclave: &Arc<Enclave>, usage: &Usage) {
        if !usage.owned && !usage.deleted && !usage.is_in_use() && usage.registration.is_none() {
            self.registry.forget(enclave);
        }
    }

    // ─────────────────────── Thread association ───────────────────────

    /// Enclave the calling thread is joined to.
    pub fn current_enclave(&self) -> Option<Arc<Enclave>> {
        self.current()
    }

    /// Suspend the calling thread's enclave: leave it natively and clear
    /// the thread slot. Counts and the registry are untouched.
    pub fn remove_current_enclave_from_thread(&self) -> Result<Option<Arc<Enclave>>> {
        let Some(enclave) = CURRENT.with(|slot| slot.borrow_mut().remove(&self.id)) else {
            return Ok(None);
        };
        self.services.leave(enclave.token().as_bytes())?;
        debug!(key = %enclave.key(), "Enclave removed from thread");
        Ok(Some(enclave))
    }

    /// Resume a suspended enclave on the calling thread.
    pub fn restore_enclave_to_thread(&self, enclave: &Arc<Enclave>) -> Result<()> {
        let already = |current: String| EnclaveError::AlreadyClassified {
            current,
            requested: enclave.key(),
        };
        if let Some(current) = self.current() {
            return Err(already(current.key()));
        }
        if !self.services.join(enclave.token().as_bytes())? {
            return Err(already("unknown".to_string()));
        }
        self.set_current(enclave);
        debug!(key = %enclave.key(), "Enclave restored to thread");
        Ok(())
    }

    fn current(&self) -> Option<Arc<Enclave>> {
        CURRENT.with(|slot| slot.borrow().get(&self.id).cloned())
    }

    fn set_current(&self, enclave: &Arc<Enclave>) {
        CURRENT.with(|slot| {
            slot.borrow_mut().insert(self.id, Arc::clone(enclave));
        });
    }

    fn clear_current(&self, enclave: &Arc<Enclave>) {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.get(&self.id).is_some_and(|c| Arc::ptr_eq(c, enclave)) {
                slot.remove(&self.id);
            }
        });
    }

    // ─────────────────────── Tokens & flags ───────────────────────

    /// Registered enclave for a token key.
    pub fn get_enclave_from_token(&self, key: &str) -> Result<Arc<Enclave>> {
        let token = EnclaveToken::from_key(key)?;
        self.registry.find(&token.key())
    }

    /// Canonical token key of an enclave.
    pub fn string_token(&self, enclave: &Enclave) -> String {
        enclave.key()
    }

    /// Wrap an enclave created outside this manager. It can be joined and
    /// left but is never deleted here.
    pub fn adopt_enclave(&self, token: EnclaveToken) -> Arc<Enclave> {
        let key = token.key();
        let (enclave, adopted) = self
            .registry
            .remember_or_get(key.clone(), || Arc::new(Enclave::new(token, false)));
        if adopted {
            debug!(key = %key, "Enclave adopted");
        }
        enclave
    }

    /// Choose whether the last leave deletes the enclave.
    pub fn set_auto_delete(&self, enclave: &Enclave, auto_delete: bool) {
        enclave.lock().auto_delete = auto_delete;
    }

    /// Register an enclave, protecting it from deletion on leave.
    pub fn register_enclave(&self, enclave: &Arc<Enclave>) -> Result<()> {
        let mut usage = enclave.lock();
        if usage.registration.is_some() {
            return Ok(());
        }
        match self.services.register(enclave.token().as_bytes())? {
            Some(registration) => {
                usage.registration = Some(registration);
                debug!(key = %enclave.key(), "Enclave registered");
                Ok(())
            }
            None => Err(native_failure("register")),
        }
    }

    /// Drop a registration. An unused, owned, auto-delete enclave is then
    /// deleted and its delete data returned.
    pub fn deregister_enclave(&self, enclave: &Arc<Enclave>) -> Result<Option<DeleteData>> {
        let mut usage = enclave.lock();
        let Some(registration) = usage.registration.clone() else {
            return Ok(None);
        };
        if !self
            .services
            .deregister(enclave.token().as_bytes(), &registration)?
        {
            return Err(native_failure("deregister"));
        }
        usage.registration = None;
        debug!(key = %enclave.key(), "Enclave deregistered");

        if usage.deletable_on_leave() {
            return self.delete_locked(enclave, &mut usage, false);
        }
        self.forget_if_external(enclave, &usage);
        Ok(None)
    }

    // ─────────────────────── Diagnostics ───────────────────────

    /// Created, deleted and live counts.
    pub fn stats(&self) -> EnclaveStats {
        EnclaveStats {
            created: self.created.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            live: self.registry.len(),
        }
    }

    /// Human-readable report of counters, live enclaves and the services.
    pub fn introspect(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(out, "ENCLAVE MANAGER");
        let _ = writeln!(
            out,
            "  CREATED: {}  DELETED: {}  LIVE: {}",
            stats.created, stats.deleted, stats.live
        );
        for snapshot in self.registry.snapshot() {
            let _ = writeln!(
                out,
                "    {:<32} {:<8} PENDING={} INUSE={}{}{}{}",
                snapshot.key,
                snapshot.state.as_str(),
                snapshot.pending,
                snapshot.in_use,
                if snapshot.created_by_manager { " OWNED" } else { "" },
                if snapshot.auto_delete { "" } else { " NOAUTODELETE" },
                if snapshot.registered { " REGISTERED" } else { "" },
            );
        }
        let _ = writeln!(out, "ENCLAVE SERVICES");
        self.services.introspect(&mut out);
        out
    }
}

fn native_failure(service: &str) -> EnclaveError {
    let (return_code, reason_code) =
        last_service_result().map_or((-1, 0), |r| (r.return_code, r.reason_code));
    EnclaveError::NativeServiceFailure {
        service: service.to_string(),
        return_code,
        reason_code,
    }
}

// ─────────────────────── Tests ───────────────────────
