pub mod config;
pub mod report;
pub mod runner;

pub use config::{AppConfig, LoggingConfig, PathsConfig};
pub use report::{RunReport, TimedOperation};
pub use runner::Pipeline;
