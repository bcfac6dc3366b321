pub mod estimator;
pub mod manager;

pub use estimator::TokenEstimator;
pub use manager::{ContextConfig, ContextManager};
