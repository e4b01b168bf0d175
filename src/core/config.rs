mod parsing;
mod settings;
mod types;

pub use types::{ComparisonStrategy, ConfigError, DeletePolicy, GradingSettings, Settings};
pub(crate) use types::AiSettings;
