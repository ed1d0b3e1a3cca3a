//! Persistence ports.
//!
//! Concrete SQL/document/blob adapters live outside this workspace; the
//! gateway programs against the traits here and treats every call as a
//! transaction boundary. The in-memory adapters back the default assembly
//! and the test suites, and carry the same observable semantics a remote
//! store must provide: revision compare-and-set and the stale-write-lock
//! sidecar pattern.

pub mod blob;
pub mod project;
pub mod workspace;

pub use blob::{BlobObject, BlobPointer, BlobStore, MemoryBlobStore, PutBlobInput};
pub use project::{
    MemoryProjectRepository, ProjectRecord, ProjectRepository, RepoError, WriteLockConfig,
};
pub use workspace::{
    AclDecision, FolderAcl, Member, MemoryWorkspaceRepository, Role, Workspace, WorkspaceMode,
    WorkspaceRepository,
};
