//! Runtime state plane for the gateway.
//!
//! Everything here is in-process soft state: MCP sessions, per-project event
//! streams, the asynchronous job queue, and the project lock table. Each
//! structure is guarded by one coarse mutex; the invariants they uphold
//! (dense event sequences, at-most-one lock holder, lease-bounded claims)
//! are what the rest of the gateway builds on.
//!
//! Time never comes from the ambient environment. Every TTL and lease
//! computation goes through an injected [`Clock`], so tests drive expiry
//! deterministically.

pub mod clock;
pub mod events;
pub mod jobs;
pub mod locks;
pub mod sessions;

pub use clock::{Clock, ManualClock, ManualSleeper, Sleeper, SystemClock, TokioSleeper};
pub use events::{EventKind, EventLog, LockView, ProjectEvent, SnapshotView};
pub use jobs::{Job, JobQueue, JobStatus, QueueError, SubmitJobInput};
pub use locks::{LockError, LockManager, LockOwner, ProjectLock};
pub use sessions::{Session, SessionId, SessionStore, SseHandle};
