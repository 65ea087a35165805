pub mod checker;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod persistence;
pub mod scanner;
pub mod scheduler;
pub mod tempfile_registry;
pub mod util;
pub mod worker;

pub use error::{EngineError, Result};
