//! Core domain model for exertion dispatch.
//!
//! This module contains the exertion tree, data contexts and the
//! dependency graph that orders a tree before it is dispatched.

pub mod context;
pub mod dag;
pub mod exertion;

pub use context::{ContextId, DataContext, InputBinding, PathSelector, MAX_SLOT_INDEX, SELF_KEY};
pub use dag::{DependencyGraph, EdgeKind};
pub use exertion::{
    Access, ControlContext, Deployment, ExecState, Exertion, ExertionId, ExertionKind, Flow,
    Signature, ThrowableRecord,
};
