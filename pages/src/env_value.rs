use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};

/// A config value that is either a literal string or a reference to a
/// process environment variable written as `ENV(NAME)`.
///
/// Resolution happens at use, not at parse time, so secrets never end up in
/// debug output of the raw config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvValue(String);

impl EnvValue {
    pub fn new(value: impl Into<String>) -> Self {
        EnvValue(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The literal value, or the referenced environment variable's value.
    /// An unset or empty variable is an error.
    pub fn resolve(&self) -> Result<String, ConfigError> {
        match self.env_name() {
            Some(name) => match std::env::var(name) {
                Ok(value) if !value.is_empty() => Ok(value),
                _ => Err(ConfigError::UnresolvedEnv(name.to_string())),
            },
            None => Ok(self.0.clone()),
        }
    }

    fn env_name(&self) -> Option<&str> {
        self.0.strip_prefix("ENV(")?.strip_suffix(')')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_value() {
        assert_eq!(EnvValue::new("plain").resolve().unwrap(), "plain");
    }

    #[test]
    fn test_env_reference() {
        // Safety: test-local variable name, no concurrent reader depends on it
        unsafe { std::env::set_var("PAGES_TEST_SECRET", "s3cret") };
        assert_eq!(
            EnvValue::new("ENV(PAGES_TEST_SECRET)").resolve().unwrap(),
            "s3cret"
        );
    }

    #[test]
    fn test_unset_env_is_an_error() {
        let err = EnvValue::new("ENV(PAGES_TEST_UNSET_VARIABLE)")
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("PAGES_TEST_UNSET_VARIABLE"));
    }

    #[test]
    fn test_malformed_reference_is_literal() {
        assert_eq!(EnvValue::new("ENV(OOPS").resolve().unwrap(), "ENV(OOPS");
    }
}
