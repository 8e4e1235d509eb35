pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
