//! Authentication and authorization for the gateway.
//!
//! Authentication is a port: the router hands request headers to an
//! injected [`Authenticator`] and gets a [`Principal`] back. Requests with
//! no credentials become anonymous principals; what anonymous principals
//! may do is decided downstream by the registry resolver and the policy
//! engine, never here.
//!
//! Authorization is the workspace policy engine: given workspace mode,
//! membership, and folder ACLs, it decides whether an account may read or
//! write a project.

pub mod auth;
pub mod policy;

pub use auth::{AuthError, Authenticator, StaticKeyAuthenticator};
pub use meshgate_protocol::{KeySpace, Principal};
pub use policy::{AccessDenial, AccessKind, AccessRequest, DenyReason, PolicyEngine};
