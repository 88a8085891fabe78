//! Dispatch engine.
//!
//! [`DispatcherFactory`] sorts an exertion tree and picks a [`Strategy`];
//! the resulting [`Dispatcher`] runs it to a terminal state, locally in
//! sequence or in parallel, or through the shared work queue. Completed
//! shared contexts flow to dependents through the [`SharedContextPool`].

mod core;
mod factory;
mod parallel;
mod provision;
mod queue;
mod registry;
mod sequential;
mod shared;

pub use self::core::{DispatchEnv, Dispatcher, Strategy};
pub use factory::DispatcherFactory;
pub use provision::ProvisionCoordinator;
pub use registry::DispatcherRegistry;
pub use shared::SharedContextPool;

pub(crate) use self::core::{normalize_result, panic_message};
