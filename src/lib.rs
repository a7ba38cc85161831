pub mod checkpoint;
pub mod config;
pub mod ema;
pub mod error;
pub mod model;
pub mod optim;
pub mod scheduler;
pub mod utils;

pub use config::{LoadIter, LrPolicy, ModelConfig};
pub use error::{ModelError, Result};
pub use model::*;
