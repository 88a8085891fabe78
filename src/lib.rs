pub mod arith;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod service;
pub mod space;

pub use error::{Error, Result};
