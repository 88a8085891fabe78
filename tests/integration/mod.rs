//! Integration test suite for the dispatch engine.
//!
//! These tests drive whole exertion trees through `DispatcherFactory`
//! against in-process services, an in-memory work queue and running space
//! workers.
//!
//! # Test Categories
//!
//! - `local_dispatch`: sequential, parallel, block and nested execution
//! - `shared_context`: context propagation and re-dispatch of finished work
//! - `queue_dispatch`: queue-mediated execution and poisoning
//! - `collaborators`: service lookup retries, provisioning, registry, monitoring
//! - `arithmetic`: end-to-end runs of the built-in arithmetic provider

mod fixtures;

mod collaborators;
mod queue_dispatch;
mod shared_context;
