//! Runtime settings, read from `RIDE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Parse { key: &'static str, value: String },

    #[error("price per km must be within [0.1, 10], got {0}")]
    PricePerKm(f64),

    #[error("commission percent must be within [1, 50], got {0}")]
    CommissionPercent(f64),

    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// Fare pricing knobs. Reloadable while the engine is running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub price_per_km: f64,
    pub commission_percent: f64,
}

impl Pricing {
    pub fn new(price_per_km: f64, commission_percent: f64) -> Result<Self, ConfigError> {
        let pricing = Self {
            price_per_km,
            commission_percent,
        };
        pricing.validate()?;
        Ok(pricing)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.1..=10.0).contains(&self.price_per_km) {
            return Err(ConfigError::PricePerKm(self.price_per_km));
        }
        if !(1.0..=50.0).contains(&self.commission_percent) {
            return Err(ConfigError::CommissionPercent(self.commission_percent));
        }
        Ok(())
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            price_per_km: 1.5,
            commission_percent: 20.0,
        }
    }
}

/// Timers for the pending-ride re-announcer and the stale-ride sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchTiming {
    /// A pending ride is re-announced once it is at least this old.
    pub reannounce_after: Duration,
    pub reannounce_every: Duration,
    /// Unaccepted, unpaid rides older than this are deleted.
    pub pending_ttl: Duration,
    pub sweep_every: Duration,
}

impl Default for DispatchTiming {
    fn default() -> Self {
        Self {
            reannounce_after: Duration::from_secs(10),
            reannounce_every: Duration::from_secs(30),
            pending_ttl: Duration::from_secs(10 * 60),
            sweep_every: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub pricing: Pricing,
    pub dispatch: DispatchTiming,
    pub oracle_timeout: Duration,
    pub oracle_attempts: u32,
    pub processor_timeout: Duration,
    pub currency: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pricing: Pricing::default(),
            dispatch: DispatchTiming::default(),
            oracle_timeout: Duration::from_secs(5),
            oracle_attempts: 3,
            processor_timeout: Duration::from_secs(10),
            currency: "CAD".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        let pricing = Pricing::new(
            parse(&lookup, "RIDE_PRICE_PER_KM")?.unwrap_or(defaults.pricing.price_per_km),
            parse(&lookup, "RIDE_COMMISSION_PERCENT")?
                .unwrap_or(defaults.pricing.commission_percent),
        )?;

        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse::<u64>(&lookup, key)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };

        let dispatch = DispatchTiming {
            reannounce_after: secs("RIDE_REANNOUNCE_AFTER_SECS", defaults.dispatch.reannounce_after)?,
            reannounce_every: secs("RIDE_REANNOUNCE_EVERY_SECS", defaults.dispatch.reannounce_every)?,
            pending_ttl: secs("RIDE_PENDING_TTL_SECS", defaults.dispatch.pending_ttl)?,
            sweep_every: secs("RIDE_SWEEP_EVERY_SECS", defaults.dispatch.sweep_every)?,
        };
        if dispatch.reannounce_every.is_zero() {
            return Err(ConfigError::Zero("RIDE_REANNOUNCE_EVERY_SECS"));
        }
        if dispatch.sweep_every.is_zero() {
            return Err(ConfigError::Zero("RIDE_SWEEP_EVERY_SECS"));
        }

        let oracle_attempts =
            parse::<u32>(&lookup, "RIDE_ORACLE_ATTEMPTS")?.unwrap_or(defaults.oracle_attempts);
        if oracle_attempts == 0 {
            return Err(ConfigError::Zero("RIDE_ORACLE_ATTEMPTS"));
        }

        Ok(Self {
            pricing,
            dispatch,
            oracle_timeout: secs("RIDE_ORACLE_TIMEOUT_SECS", defaults.oracle_timeout)?,
            oracle_attempts,
            processor_timeout: secs("RIDE_PROCESSOR_TIMEOUT_SECS", defaults.processor_timeout)?,
            currency: lookup("RIDE_CURRENCY").unwrap_or(defaults.currency),
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.dispatch.reannounce_after, Duration::from_secs(10));
        assert_eq!(settings.dispatch.reannounce_every, Duration::from_secs(30));
        assert_eq!(settings.dispatch.pending_ttl, Duration::from_secs(600));
    }

    #[test]
    fn overrides_are_applied() {
        let settings = Settings::from_lookup(lookup(&[
            ("RIDE_PRICE_PER_KM", "2.25"),
            ("RIDE_COMMISSION_PERCENT", "15"),
            ("RIDE_PENDING_TTL_SECS", "120"),
            ("RIDE_CURRENCY", "USD"),
        ]))
        .unwrap();

        assert_eq!(settings.pricing, Pricing::new(2.25, 15.0).unwrap());
        assert_eq!(settings.dispatch.pending_ttl, Duration::from_secs(120));
        assert_eq!(settings.currency, "USD");
    }

    #[test]
    fn malformed_value_is_reported_with_its_key() {
        let err = Settings::from_lookup(lookup(&[("RIDE_ORACLE_ATTEMPTS", "three")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                key: "RIDE_ORACLE_ATTEMPTS",
                value: "three".to_string()
            }
        );
    }

    #[test]
    fn pricing_bounds_are_enforced() {
        assert_eq!(Pricing::new(0.05, 20.0), Err(ConfigError::PricePerKm(0.05)));
        assert_eq!(
            Pricing::new(1.5, 75.0),
            Err(ConfigError::CommissionPercent(75.0))
        );
        assert!(Pricing::new(10.0, 1.0).is_ok());
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = Settings::from_lookup(lookup(&[("RIDE_ORACLE_ATTEMPTS", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero("RIDE_ORACLE_ATTEMPTS"));
    }
}
