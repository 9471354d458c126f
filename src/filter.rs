//! Ingest filtering: enable flag, exclusion lists and sampling
//!
//! Checks run cheapest first and stop at the first one that rejects the
//! event. None of them have side effects.

use crate::config::Config;
use crate::error::ConfigError;
use crate::event::{EventKind, EventPayload, RawEvent};
use rand::Rng;
use regex::RegexSet;
use std::collections::HashSet;

/// Outcome of running an event through the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Capture,
    Disabled,
    IgnoredType,
    IgnoredPath,
    SampledOut,
}

impl FilterDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Disabled => "disabled",
            Self::IgnoredType => "ignored_type",
            Self::IgnoredPath => "ignored_path",
            Self::SampledOut => "sampled_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestFilter {
    enabled: bool,
    ignored_types: HashSet<String>,
    ignored_paths: RegexSet,
    error_sample_rate: f64,
    performance_sample_rate: f64,
}

impl IngestFilter {
    /// Build from configuration, compiling the path patterns once
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let ignored_paths = RegexSet::new(&config.ignored_path_patterns)
            .map_err(|e| ConfigError::Invalid(format!("invalid ignored_path_patterns: {}", e)))?;

        Ok(Self {
            enabled: config.enabled,
            ignored_types: config.ignored_exception_types.iter().cloned().collect(),
            ignored_paths,
            error_sample_rate: config.sample_rate,
            performance_sample_rate: config.performance_sample_rate,
        })
    }

    pub fn should_capture(&self, event: &RawEvent) -> bool {
        self.decide(event) == FilterDecision::Capture
    }

    pub fn decide(&self, event: &RawEvent) -> FilterDecision {
        self.decide_with(event, || rand::thread_rng().gen::<f64>())
    }

    /// Same as [`decide`](Self::decide) with the sampling draw supplied by the caller
    ///
    /// The draw is only taken once every deterministic check has passed.
    pub fn decide_with(&self, event: &RawEvent, draw: impl FnOnce() -> f64) -> FilterDecision {
        if !self.enabled {
            return FilterDecision::Disabled;
        }

        match &event.payload {
            EventPayload::Error(err) => {
                if self.ignored_types.contains(&err.exception_type) {
                    return FilterDecision::IgnoredType;
                }
            }
            EventPayload::Performance(_) => {
                if let Some(path) = event.context.request_path() {
                    if self.ignored_paths.is_match(path) {
                        return FilterDecision::IgnoredPath;
                    }
                }
            }
        }

        let rate = match event.kind() {
            EventKind::Error => self.error_sample_rate,
            EventKind::Performance => self.performance_sample_rate,
        };

        if sampled_in(rate, draw) {
            FilterDecision::Capture
        } else {
            FilterDecision::SampledOut
        }
    }
}

/// Admit iff a uniform draw in [0, 1) is at most `rate`
///
/// The endpoints are handled without drawing so that a rate of 0 never
/// admits and a rate of 1 always does.
fn sampled_in(rate: f64, draw: impl FnOnce() -> f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    draw() <= rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContext;

    fn filter_with(config: Config) -> IngestFilter {
        IngestFilter::from_config(&config).unwrap()
    }

    #[test]
    fn test_disabled_rejects_everything() {
        let filter = filter_with(Config {
            enabled: false,
            ..Config::default()
        });
        let event = RawEvent::error("RuntimeError", "boom");
        assert_eq!(filter.decide(&event), FilterDecision::Disabled);
    }

    #[test]
    fn test_ignored_type_is_exact_match() {
        let mut config = Config::default();
        config
            .ignored_exception_types
            .insert("ActiveRecord::RecordNotFound".to_string());
        let filter = filter_with(config);

        let ignored = RawEvent::error("ActiveRecord::RecordNotFound", "id=1");
        assert_eq!(filter.decide(&ignored), FilterDecision::IgnoredType);

        let prefixed = RawEvent::error("ActiveRecord::RecordNotFoundExtra", "id=1");
        assert_eq!(filter.decide(&prefixed), FilterDecision::Capture);

        let partial = RawEvent::error("RecordNotFound", "id=1");
        assert_eq!(filter.decide(&partial), FilterDecision::Capture);
    }

    #[test]
    fn test_ignored_paths_apply_to_performance_only() {
        let filter = filter_with(Config {
            ignored_path_patterns: vec!["^/health".to_string(), r"^/assets/".to_string()],
            ..Config::default()
        });

        let health = RawEvent::performance("HealthController#show", 1.0)
            .with_context(EventContext::default().with_request_path("/healthz"));
        assert_eq!(filter.decide(&health), FilterDecision::IgnoredPath);

        let error_on_health = RawEvent::error("RuntimeError", "boom")
            .with_context(EventContext::default().with_request_path("/healthz"));
        assert_eq!(filter.decide(&error_on_health), FilterDecision::Capture);

        let users = RawEvent::performance("UsersController#index", 1.0)
            .with_context(EventContext::default().with_request_path("/users"));
        assert_eq!(filter.decide(&users), FilterDecision::Capture);
    }

    #[test]
    fn test_sampling_uses_independent_rates() {
        let filter = filter_with(Config {
            sample_rate: 0.5,
            performance_sample_rate: 0.1,
            ..Config::default()
        });

        let error = RawEvent::error("RuntimeError", "boom");
        assert_eq!(filter.decide_with(&error, || 0.5), FilterDecision::Capture);
        assert_eq!(filter.decide_with(&error, || 0.51), FilterDecision::SampledOut);

        let perf = RawEvent::performance("UsersController#index", 1.0);
        assert_eq!(filter.decide_with(&perf, || 0.05), FilterDecision::Capture);
        assert_eq!(filter.decide_with(&perf, || 0.2), FilterDecision::SampledOut);
    }

    #[test]
    fn test_sampling_endpoints() {
        let never = filter_with(Config {
            sample_rate: 0.0,
            ..Config::default()
        });
        let event = RawEvent::error("RuntimeError", "boom");
        assert_eq!(never.decide_with(&event, || 0.0), FilterDecision::SampledOut);

        let always = filter_with(Config::default());
        for _ in 0..100 {
            assert!(always.should_capture(&event));
        }
    }

    #[test]
    fn test_short_circuits_before_sampling() {
        let filter = filter_with(Config {
            enabled: false,
            sample_rate: 0.5,
            ..Config::default()
        });
        let event = RawEvent::error("RuntimeError", "boom");
        let decision = filter.decide_with(&event, || panic!("sampling should not run"));
        assert_eq!(decision, FilterDecision::Disabled);
    }
}
