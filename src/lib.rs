pub mod error;
pub mod config;
pub mod models;
pub mod schema;
pub mod db;
pub mod store;
pub mod preprocessing;
pub mod model;
pub mod state;
pub mod matcher;
pub mod classifier;
pub mod server;

pub use classifier::Classifier;
pub use config::ClassifierConfig;
pub use error::{Error, Result};
pub use matcher::ClassificationResult;
