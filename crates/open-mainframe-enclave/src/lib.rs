//! z/OS WLM enclave management.
//!
//! This crate provides:
//!
//! - **Classification rules**: map HTTP requests (host, port, resource,
//!   method) to WLM transaction classes
//! - **Classification info**: the 44-byte EBCDIC blob passed to create
//! - **Enclave services**: authorized and unauthorized access to the native
//!   create, join, leave and delete calls, behind one capability trait
//! - **Enclave manager**: use counting, thread association, registration
//!   and at-most-once deletion of enclaves
//! - **Work classifier**: runs request work inside a fresh enclave

pub mod classifier;
pub mod codec;
pub mod codes;
pub mod config;
pub mod ebcdic;
pub mod enclave;
pub mod error;
pub mod manager;
pub mod native;
pub mod registry;
pub mod rules;
pub mod services;
pub mod worker;

pub use classifier::{EnclaveExecutor, WorkClassifier};
pub use codec::ClassificationInfo;
pub use codes::FailureKind;
pub use config::{ClassificationEntry, ServiceMode, WlmConfig};
pub use enclave::{Enclave, EnclaveSnapshot, EnclaveState, EnclaveToken};
pub use error::{EnclaveError, Result};
pub use manager::{EnclaveManager, EnclaveStats};
pub use native::{DeleteData, NativeFailure, NativeOp, NativeWorkUnits, SimulatedNative};
pub use registry::EnclaveRegistry;
pub use rules::{ClassificationData, RuleSet};
pub use services::{
    build_services, last_service_result, AuthorizedServices, EnclaveServices, ServiceResult,
    UnauthorizedServices,
};
