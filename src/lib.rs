pub mod aggregation;
pub mod cache;
pub mod config;
pub mod curve;
pub mod engine;
pub mod error;
pub mod logging;
pub mod predictor;
pub mod queue;
pub mod session;
pub mod store;
pub mod types;
pub mod workers;

pub use config::EngineConfig;
pub use engine::SchedulerEngine;
pub use error::{EngineError, EngineResult};
