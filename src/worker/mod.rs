//! The worker handle (§2 "C7"): a local-process or remote-mesh front for
//! one worker, state-machine-driven by inbound protocol messages.

pub mod handle;

pub use handle::{HandleState, LocalWorkerHandle, RemoteWorkerHandle, WorkerEvent, WorkerHandle, WorkerKind, WorkerStatus};
