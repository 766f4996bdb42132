//! Callback ingestion: signature gate and enqueue-then-acknowledge

mod acceptor;
pub mod signature;

pub use acceptor::{AcceptOutcome, CallbackAcceptor};
pub use signature::{SignatureGate, SIGNATURE_HEADER};
