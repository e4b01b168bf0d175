use std::env;
use std::time::Duration;

use super::types::{ComparisonStrategy, ConfigError, DeletePolicy, Environment};

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_f64(field: &'static str, value: String) -> Result<f64, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or(ConfigError::InvalidValue { field, value })
}

/// Parses a fraction in `[0, 1]`.
pub(super) fn parse_unit_interval(field: &'static str, value: String) -> Result<f64, ConfigError> {
    let parsed = parse_f64(field, value.clone())?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(ConfigError::InvalidValue { field, value });
    }
    Ok(parsed)
}

pub(super) fn parse_millis(field: &'static str, value: String) -> Result<Duration, ConfigError> {
    parse_u64(field, value).map(Duration::from_millis)
}

pub(super) fn parse_seconds(field: &'static str, value: String) -> Result<Duration, ConfigError> {
    parse_u64(field, value).map(Duration::from_secs)
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_strategy(value: String) -> Result<ComparisonStrategy, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "embedding" | "embeddings" => Ok(ComparisonStrategy::Embedding),
        "llm" | "llm_judge" | "judge" => Ok(ComparisonStrategy::LlmJudge),
        _ => Err(ConfigError::InvalidValue { field: "COMPARISON_STRATEGY", value }),
    }
}

pub(super) fn parse_delete_policy(value: String) -> Result<DeletePolicy, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "reject" => Ok(DeletePolicy::Reject),
        "cascade" => Ok(DeletePolicy::Cascade),
        _ => Err(ConfigError::InvalidValue { field: "MODEL_ANSWER_DELETE_POLICY", value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(parse_environment(Some("prod".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("production".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("staging".to_string())), Environment::Staging);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }

    #[test]
    fn unit_interval_rejects_out_of_range() {
        assert_eq!(parse_unit_interval("SIMILARITY_FLOOR", "0.2".to_string()).ok(), Some(0.2));
        assert!(parse_unit_interval("SIMILARITY_FLOOR", "1.5".to_string()).is_err());
        assert!(parse_unit_interval("SIMILARITY_FLOOR", "-0.1".to_string()).is_err());
        assert!(parse_unit_interval("SIMILARITY_FLOOR", "NaN".to_string()).is_err());
    }

    #[test]
    fn strategy_and_policy_names() {
        assert_eq!(parse_strategy("LLM".to_string()).ok(), Some(ComparisonStrategy::LlmJudge));
        assert_eq!(
            parse_strategy("embedding".to_string()).ok(),
            Some(ComparisonStrategy::Embedding)
        );
        assert!(parse_strategy("keywords".to_string()).is_err());
        assert_eq!(parse_delete_policy("cascade".to_string()).ok(), Some(DeletePolicy::Cascade));
        assert!(parse_delete_policy("archive".to_string()).is_err());
    }
}
