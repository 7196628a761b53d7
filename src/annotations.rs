use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::FaultToleranceConfig;
use crate::crd::AppWrapper;

/* ============================= ANNOTATION KEYS ============================= */

pub const ADMISSION_GRACE_PERIOD: &str = "workload.stochastic.io/admissionGracePeriodDuration";
pub const WARMUP_GRACE_PERIOD: &str = "workload.stochastic.io/warmupGracePeriodDuration";
pub const FAILURE_GRACE_PERIOD: &str = "workload.stochastic.io/failureGracePeriodDuration";
pub const RETRY_PAUSE_PERIOD: &str = "workload.stochastic.io/retryPausePeriodDuration";
pub const RETRY_LIMIT: &str = "workload.stochastic.io/retryLimit";
pub const FORCEFUL_DELETION_GRACE_PERIOD: &str =
    "workload.stochastic.io/forcefulDeletionGracePeriod";
pub const DELETION_ON_FAILURE_GRACE_PERIOD: &str =
    "workload.stochastic.io/deletionOnFailureGracePeriod";
pub const SUCCESS_TTL: &str = "workload.stochastic.io/successTTLDuration";
pub const TERMINAL_EXIT_CODES: &str = "workload.stochastic.io/terminalExitCodes";
pub const RETRYABLE_EXIT_CODES: &str = "workload.stochastic.io/retryableExitCodes";

/* ============================= RESOLUTION ============================= */

/// Grace periods and retry parameters in effect for one AppWrapper:
/// operator defaults overridden by parseable annotations, clamped to the
/// operator's maximum. Malformed values silently fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperParams {
    pub admission_grace_period: Duration,
    pub warmup_grace_period: Duration,
    pub failure_grace_period: Duration,
    pub retry_pause_period: Duration,
    pub retry_limit: i32,
    pub forceful_deletion_grace_period: Duration,
    pub deletion_on_failure_grace_period: Duration,
    pub success_ttl: Duration,
    pub terminal_exit_codes: Option<Vec<i32>>,
    pub retryable_exit_codes: Option<Vec<i32>>,
}

impl WrapperParams {
    pub fn resolve(
        config: &FaultToleranceConfig,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> Self {
        let max = config.grace_period_maximum;
        let duration = |key: &str, default: Duration| -> Duration {
            annotation_duration(annotations, key)
                .unwrap_or(default)
                .min(max)
        };

        // successTTL is bounded by the operator default rather than the grace
        // maximum; an operator default of zero leaves it unbounded.
        let success_ttl = match annotation_duration(annotations, SUCCESS_TTL) {
            Some(ttl) if config.success_ttl > Duration::ZERO => ttl.min(config.success_ttl),
            Some(ttl) => ttl,
            None => config.success_ttl,
        };

        Self {
            admission_grace_period: duration(ADMISSION_GRACE_PERIOD, config.admission_grace_period),
            warmup_grace_period: duration(WARMUP_GRACE_PERIOD, config.warmup_grace_period),
            failure_grace_period: duration(FAILURE_GRACE_PERIOD, config.failure_grace_period),
            retry_pause_period: duration(RETRY_PAUSE_PERIOD, config.retry_pause_period),
            retry_limit: annotation_int(annotations, RETRY_LIMIT).unwrap_or(config.retry_limit),
            forceful_deletion_grace_period: duration(
                FORCEFUL_DELETION_GRACE_PERIOD,
                config.forceful_deletion_grace_period,
            ),
            deletion_on_failure_grace_period: duration(
                DELETION_ON_FAILURE_GRACE_PERIOD,
                config.deletion_on_failure_grace_period,
            ),
            success_ttl,
            terminal_exit_codes: annotation_int_list(annotations, TERMINAL_EXIT_CODES),
            retryable_exit_codes: annotation_int_list(annotations, RETRYABLE_EXIT_CODES),
        }
    }

    pub fn for_wrapper(config: &FaultToleranceConfig, aw: &AppWrapper) -> Self {
        Self::resolve(config, aw.metadata.annotations.as_ref())
    }
}

/* ============================= PARSERS ============================= */

/// Parse a Go-style duration annotation. A leading `-` clamps to zero;
/// anything else unparseable is `None` (caller falls back to the default).
fn annotation_duration(
    annotations: Option<&BTreeMap<String, String>>,
    key: &str,
) -> Option<Duration> {
    let raw = annotations?.get(key)?.trim();
    if let Some(rest) = raw.strip_prefix('-') {
        return humantime::parse_duration(rest).ok().map(|_| Duration::ZERO);
    }
    humantime::parse_duration(raw).ok()
}

fn annotation_int(annotations: Option<&BTreeMap<String, String>>, key: &str) -> Option<i32> {
    annotations?.get(key)?.trim().parse().ok()
}

/// Parse a comma-separated int list, skipping malformed entries.
/// Absent annotation is `None`; a present-but-garbage one is an empty list.
fn annotation_int_list(
    annotations: Option<&BTreeMap<String, String>>,
    key: &str,
) -> Option<Vec<i32>> {
    let raw = annotations?.get(key)?;
    Some(
        raw.split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect(),
    )
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn defaults() -> FaultToleranceConfig {
        FaultToleranceConfig::default()
    }

    #[test]
    fn test_no_annotations_yields_operator_defaults() {
        let params = WrapperParams::resolve(&defaults(), None);
        assert_eq!(params.admission_grace_period, Duration::from_secs(60));
        assert_eq!(params.warmup_grace_period, Duration::from_secs(300));
        assert_eq!(params.retry_limit, 3);
        assert_eq!(params.success_ttl, Duration::ZERO);
        assert_eq!(params.terminal_exit_codes, None);
        assert_eq!(params.retryable_exit_codes, None);
    }

    #[test]
    fn test_duration_override() {
        let a = annotations(&[(FAILURE_GRACE_PERIOD, "2m30s")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.failure_grace_period, Duration::from_secs(150));
    }

    #[test]
    fn test_malformed_duration_falls_back_to_default() {
        let a = annotations(&[(WARMUP_GRACE_PERIOD, "not-a-duration")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.warmup_grace_period, Duration::from_secs(300));
    }

    #[test]
    fn test_negative_duration_clamps_to_zero() {
        let a = annotations(&[(FAILURE_GRACE_PERIOD, "-10s")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.failure_grace_period, Duration::ZERO);
    }

    #[test]
    fn test_duration_clamps_to_grace_period_maximum() {
        let a = annotations(&[(ADMISSION_GRACE_PERIOD, "48h")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(
            params.admission_grace_period,
            defaults().grace_period_maximum
        );
    }

    #[test]
    fn test_retry_limit_override_and_fallback() {
        let a = annotations(&[(RETRY_LIMIT, "0")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.retry_limit, 0);

        let a = annotations(&[(RETRY_LIMIT, "abc")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.retry_limit, 3);
    }

    #[test]
    fn test_terminal_exit_codes_skip_malformed_entries() {
        let a = annotations(&[(TERMINAL_EXIT_CODES, "3,10,abc,42")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.terminal_exit_codes, Some(vec![3, 10, 42]));
    }

    #[test]
    fn test_retryable_exit_codes_skip_malformed_entries() {
        let a = annotations(&[(RETRYABLE_EXIT_CODES, "x,10,20")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.retryable_exit_codes, Some(vec![10, 20]));
    }

    #[test]
    fn test_exit_codes_with_spaces() {
        let a = annotations(&[(TERMINAL_EXIT_CODES, " 1 , 2 ,3 ")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.terminal_exit_codes, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_success_ttl_unbounded_when_operator_default_is_zero() {
        let a = annotations(&[(SUCCESS_TTL, "72h")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(params.success_ttl, Duration::from_secs(72 * 3600));
    }

    #[test]
    fn test_success_ttl_clamps_to_operator_default() {
        let config = FaultToleranceConfig {
            success_ttl: Duration::from_secs(3600),
            ..Default::default()
        };
        let a = annotations(&[(SUCCESS_TTL, "72h")]);
        let params = WrapperParams::resolve(&config, Some(&a));
        assert_eq!(params.success_ttl, Duration::from_secs(3600));

        let a = annotations(&[(SUCCESS_TTL, "10m")]);
        let params = WrapperParams::resolve(&config, Some(&a));
        assert_eq!(params.success_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_deletion_on_failure_defaults_to_zero() {
        let params = WrapperParams::resolve(&defaults(), None);
        assert_eq!(params.deletion_on_failure_grace_period, Duration::ZERO);

        let a = annotations(&[(DELETION_ON_FAILURE_GRACE_PERIOD, "5m")]);
        let params = WrapperParams::resolve(&defaults(), Some(&a));
        assert_eq!(
            params.deletion_on_failure_grace_period,
            Duration::from_secs(300)
        );
    }
}
