// Analysis engine - independent of the CLI shell

pub mod analysis;
pub mod bd;
pub mod core;
pub mod encode;
pub mod error;
pub mod job;
pub mod perf;
pub mod probe;
pub mod template;
pub mod worker;

pub use core::*;
pub use error::{AnalysisError, ErrorRecord};
