//! Access control seam
//!
//! Authorization lives outside the core; the engine only asks a policy
//! before touching a stream and surfaces `AccessDenied` when refused.

use std::fmt;

/// Kind of access being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Delete,
    MetadataRead,
    MetadataWrite,
}

/// Decides whether an operation on a stream is allowed
pub trait AccessPolicy: Send + Sync + fmt::Debug {
    fn check(&self, stream: &str, operation: Operation) -> bool;
}

/// Policy that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _stream: &str, _operation: Operation) -> bool {
        true
    }
}
