//! Descheduling policy objects and admission validation
//!
//! One singleton policy per cluster is enforced by convention: the
//! object must carry the fixed name and namespace, and its time range
//! must parse as a standard cron expression. The validating admission
//! hook calls [`validate_policy`] before a write is accepted, so bad
//! policies never reach the orchestrator.

use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Fixed name of the singleton policy object
pub const POLICY_NAME: &str = "cluster-repack-policy";

/// Fixed namespace of the singleton policy object
pub const POLICY_NAMESPACE: &str = "repacker-system";

/// Policy type discriminator carried on the object
pub const POLICY_TYPE_CONVERGE: &str = "converge";

/// Resources the convergence run is allowed to try to reclaim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfitTarget {
    pub node: u32,
    pub cpu: u32,
    pub mem: u32,
}

/// Convergence strategy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergeSpec {
    #[serde(default)]
    pub disabled: bool,
    /// Cron expression controlling when migration cycles fire
    pub time_range: String,
    #[serde(default)]
    pub profit_target: ProfitTarget,
    pub min_pods: u32,
    pub max_pods: u32,
    pub low_water_level: f64,
    pub high_water_level: f64,
}

/// The operator-facing descheduling policy object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeschedulePolicy {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub policy_type: String,
    pub converge: ConvergeSpec,
}

/// Validation failures surfaced at admission time
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy name must be {expected:?}, got {got:?}")]
    WrongName { expected: &'static str, got: String },
    #[error("policy namespace must be {expected:?}, got {got:?}")]
    WrongNamespace { expected: &'static str, got: String },
    #[error("time range {0:?} is not a valid cron expression: {1}")]
    BadTimeRange(String, String),
    #[error("min_pods ({min}) must not exceed max_pods ({max})")]
    BadBatchBounds { min: u32, max: u32 },
    #[error("water levels must satisfy 0 <= low < high <= 1, got low={low} high={high}")]
    BadWaterLevels { low: f64, high: f64 },
}

/// Parse the policy time range into a cron schedule
///
/// Accepts both five-field (`*/5 * * * *`) and the seven-field form
/// the `cron` crate parses natively; five-field input is widened with
/// a seconds field.
pub fn parse_time_range(expr: &str) -> Result<Schedule, PolicyError> {
    let fields = expr.split_whitespace().count();
    let widened;
    let candidate = if fields == 5 {
        widened = format!("0 {expr}");
        widened.as_str()
    } else {
        expr
    };
    Schedule::from_str(candidate)
        .map_err(|e| PolicyError::BadTimeRange(expr.to_string(), e.to_string()))
}

/// Admission validation for a policy write
pub fn validate_policy(policy: &DeschedulePolicy) -> Result<(), PolicyError> {
    if policy.name != POLICY_NAME {
        return Err(PolicyError::WrongName {
            expected: POLICY_NAME,
            got: policy.name.clone(),
        });
    }
    if policy.namespace != POLICY_NAMESPACE {
        return Err(PolicyError::WrongNamespace {
            expected: POLICY_NAMESPACE,
            got: policy.namespace.clone(),
        });
    }
    parse_time_range(&policy.converge.time_range)?;
    if policy.converge.min_pods > policy.converge.max_pods {
        return Err(PolicyError::BadBatchBounds {
            min: policy.converge.min_pods,
            max: policy.converge.max_pods,
        });
    }
    let (low, high) = (
        policy.converge.low_water_level,
        policy.converge.high_water_level,
    );
    if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
        return Err(PolicyError::BadWaterLevels { low, high });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_policy(time_range: &str) -> DeschedulePolicy {
        DeschedulePolicy {
            name: POLICY_NAME.to_string(),
            namespace: POLICY_NAMESPACE.to_string(),
            policy_type: POLICY_TYPE_CONVERGE.to_string(),
            converge: ConvergeSpec {
                disabled: false,
                time_range: time_range.to_string(),
                profit_target: ProfitTarget {
                    node: 1,
                    cpu: 4,
                    mem: 8,
                },
                min_pods: 1,
                max_pods: 50,
                low_water_level: 0.3,
                high_water_level: 0.8,
            },
        }
    }

    #[test]
    fn valid_policy_passes() {
        assert!(validate_policy(&test_policy("*/5 * * * *")).is_ok());
    }

    #[test]
    fn five_and_seven_field_expressions_parse() {
        assert!(parse_time_range("*/5 * * * *").is_ok());
        assert!(parse_time_range("0 */5 * * * * *").is_ok());
    }

    #[test]
    fn bad_cron_expression_is_rejected() {
        let policy = test_policy("not a cron expr");
        assert!(matches!(
            validate_policy(&policy),
            Err(PolicyError::BadTimeRange(_, _))
        ));
    }

    #[test]
    fn non_singleton_name_is_rejected() {
        let mut policy = test_policy("*/5 * * * *");
        policy.name = "other".to_string();
        assert!(matches!(
            validate_policy(&policy),
            Err(PolicyError::WrongName { .. })
        ));
    }

    #[test]
    fn inverted_water_levels_are_rejected() {
        let mut policy = test_policy("*/5 * * * *");
        policy.converge.low_water_level = 0.9;
        policy.converge.high_water_level = 0.2;
        assert!(matches!(
            validate_policy(&policy),
            Err(PolicyError::BadWaterLevels { .. })
        ));
    }

    #[test]
    fn inverted_batch_bounds_are_rejected() {
        let mut policy = test_policy("*/5 * * * *");
        policy.converge.min_pods = 10;
        policy.converge.max_pods = 2;
        assert!(matches!(
            validate_policy(&policy),
            Err(PolicyError::BadBatchBounds { .. })
        ));
    }
}
