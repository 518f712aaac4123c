//! Testctl is a remote test-process controller: it starts test-suite executables on the local
//! device on behalf of a remote test driver, and reports their readiness, exit status and output.
//!
//! ## Registration
//!
//! Test drivers find the controller through a process controller registry. The controller
//! registers itself with the registry over Cap'n Proto RPC and keeps doing so for as long as it
//! runs: connectivity failures and disconnections are followed by a new registration after a
//! fixed backoff. See [`registration`].
//!
//! ## Process supervision
//!
//! The `ProcessController` RPC interface (see `controller.capnp`) starts executables and hands
//! out one `Process` capability per started executable, through which the driver waits for
//! readiness, waits for completion, and terminates the process. See [`process`] and
//! [`rpc::controller`].
//!
//! ## Build flavors
//!
//! Test suites come in `sync`, `async` and `collocated` flavors. A client uses the flavor of the
//! server started right before it, `sync` by default.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod environment;
pub mod error;
pub mod listen;
pub mod process;
pub mod registration;
pub mod rpc;

mod internal;
