use std::{collections::BTreeSet, error, fmt, time::Duration};

use crate::status::Code;

/// Retry a failed call after a backoff delay
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the original one
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the backoff
    pub max_backoff: Duration,
    /// Factor the backoff grows by after each retry
    pub backoff_multiplier: f64,
    /// Status codes that make a failed attempt worth retrying
    pub retryable_status_codes: BTreeSet<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 1.5,
            retryable_status_codes: [Code::Unavailable].into(),
        }
    }
}

impl RetryPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        if self.initial_backoff.is_zero() || self.max_backoff.is_zero() {
            return Err(ConfigError::ZeroBackoff);
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvertedBackoff);
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(self.backoff_multiplier));
        }
        if self.retryable_status_codes.is_empty() {
            return Err(ConfigError::NoRetryableStatusCodes);
        }
        Ok(())
    }
}

/// Send copies of a call without waiting for the previous ones to fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HedgingPolicy {
    /// Maximum number of copies, including the original one
    pub max_attempts: u32,
    /// Status codes that start the next copy right away instead of failing the call
    pub non_fatal_status_codes: BTreeSet<Code>,
    /// Delay between starting two copies
    pub hedging_delay: Duration,
}

impl Default for HedgingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            non_fatal_status_codes: [Code::Unavailable].into(),
            hedging_delay: Duration::from_millis(10),
        }
    }
}

impl HedgingPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        Ok(())
    }
}

/// Which methods a [MethodConfig] applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodName {
    /// Every method that has no config of its own
    Default,
    /// A single method, by its full identifier, e.g. `/greet.Greeter/Greet`
    Exact(String),
}

impl MethodName {
    /// A single method
    pub fn exact(method: impl Into<String>) -> Self {
        Self::Exact(method.into())
    }
}

/// Resilience settings for a set of methods
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodConfig {
    /// The methods this config applies to
    pub names: Vec<MethodName>,
    /// Retry failed calls
    pub retry_policy: Option<RetryPolicy>,
    /// Hedge calls
    pub hedging_policy: Option<HedgingPolicy>,
    /// Time limit for the whole call, including all attempts
    pub timeout: Option<Duration>,
}

impl MethodConfig {
    /// A config without any policy for the given methods
    pub fn new(names: impl IntoIterator<Item = MethodName>) -> Self {
        Self {
            names: names.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set the hedging policy
    pub fn hedging_policy(mut self, policy: HedgingPolicy) -> Self {
        self.hedging_policy = Some(policy);
        self
    }

    /// Set the time limit for the whole call
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_policy.is_some() && self.hedging_policy.is_some() {
            return Err(ConfigError::ConflictingPolicies);
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        if let Some(policy) = &self.hedging_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Resilience settings for all methods of a service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceConfig {
    /// Method configs. A method name may only appear once across all of them.
    pub method_configs: Vec<MethodConfig>,
}

impl ServiceConfig {
    /// Add a method config
    pub fn method_config(mut self, config: MethodConfig) -> Self {
        self.method_configs.push(config);
        self
    }

    /// Check the config for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for config in &self.method_configs {
            config.validate()?;
            for name in &config.names {
                if !seen.insert(name) {
                    return Err(ConfigError::DuplicateMethodName(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// The config for a method.
    ///
    /// A config that names the method exactly wins over the default config.
    pub fn resolve(&self, method: &str) -> Option<&MethodConfig> {
        let exact = self.method_configs.iter().find(|config| {
            config
                .names
                .iter()
                .any(|name| matches!(name, MethodName::Exact(m) if m == method))
        });
        exact.or_else(|| {
            self.method_configs
                .iter()
                .find(|config| config.names.contains(&MethodName::Default))
        })
    }
}

/// Invalid resilience configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A method config has both a retry and a hedging policy
    ConflictingPolicies,
    /// `max_attempts` is zero
    InvalidMaxAttempts,
    /// A backoff is zero
    ZeroBackoff,
    /// The initial backoff is larger than the max backoff
    InvertedBackoff,
    /// The backoff multiplier is smaller than one or not a number
    InvalidBackoffMultiplier(f64),
    /// A retry policy without any retryable status code
    NoRetryableStatusCodes,
    /// A method is named by more than one method config
    DuplicateMethodName(MethodName),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingPolicies => {
                write!(f, "a method config can not have both a retry and a hedging policy")
            }
            Self::InvalidMaxAttempts => write!(f, "max attempts must be at least 1"),
            Self::ZeroBackoff => write!(f, "backoff must be greater than zero"),
            Self::InvertedBackoff => write!(f, "initial backoff is larger than max backoff"),
            Self::InvalidBackoffMultiplier(x) => {
                write!(f, "backoff multiplier must be a finite number >= 1, got {x}")
            }
            Self::NoRetryableStatusCodes => {
                write!(f, "retry policy needs at least one retryable status code")
            }
            Self::DuplicateMethodName(name) => write!(f, "duplicate method name {name:?}"),
        }
    }
}

impl error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let both = MethodConfig::new([MethodName::Default])
            .retry_policy(RetryPolicy::default())
            .hedging_policy(HedgingPolicy::default());
        let config = ServiceConfig::default().method_config(both);
        assert_eq!(config.validate(), Err(ConfigError::ConflictingPolicies));

        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        let config = ServiceConfig::default()
            .method_config(MethodConfig::new([MethodName::Default]).retry_policy(zero));
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxAttempts));

        let multiplier = RetryPolicy {
            backoff_multiplier: f64::NAN,
            ..Default::default()
        };
        let config = ServiceConfig::default()
            .method_config(MethodConfig::new([MethodName::Default]).retry_policy(multiplier));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackoffMultiplier(_))
        ));

        let inverted = RetryPolicy {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        let config = ServiceConfig::default()
            .method_config(MethodConfig::new([MethodName::Default]).retry_policy(inverted));
        assert_eq!(config.validate(), Err(ConfigError::InvertedBackoff));

        let no_codes = RetryPolicy {
            retryable_status_codes: BTreeSet::new(),
            ..Default::default()
        };
        let config = ServiceConfig::default()
            .method_config(MethodConfig::new([MethodName::Default]).retry_policy(no_codes));
        assert_eq!(config.validate(), Err(ConfigError::NoRetryableStatusCodes));

        let config = ServiceConfig::default()
            .method_config(MethodConfig::new([MethodName::Default]))
            .method_config(MethodConfig::new([MethodName::Default]));
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateMethodName(MethodName::Default))
        );

        let config = ServiceConfig::default()
            .method_config(MethodConfig::new([MethodName::Default]).retry_policy(RetryPolicy::default()))
            .method_config(
                MethodConfig::new([MethodName::exact("/a.A/B")]).hedging_policy(HedgingPolicy::default()),
            );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn resolve_prefers_exact_name() {
        let config = ServiceConfig::default()
            .method_config(MethodConfig::new([MethodName::Default]).timeout(Duration::from_secs(1)))
            .method_config(
                MethodConfig::new([MethodName::exact("/a.A/B")]).timeout(Duration::from_secs(2)),
            );
        let timeout = |method| config.resolve(method).and_then(|c| c.timeout);
        assert_eq!(timeout("/a.A/B"), Some(Duration::from_secs(2)));
        assert_eq!(timeout("/a.A/C"), Some(Duration::from_secs(1)));
        assert!(ServiceConfig::default().resolve("/a.A/B").is_none());
    }
}
