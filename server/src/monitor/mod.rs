pub mod health;

pub use health::{SourceHealth, SourceHealthMonitor};
