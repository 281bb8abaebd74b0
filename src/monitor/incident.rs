//! Incident model
//!
//! Types shared by the ledger, the stores, and the HTTP layer.

use crate::error::{validation_error, AppError};
use crate::monitor::capture::DatasetKey;
use crate::monitor::diff::SchemaDiff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The rule whose failure an incident tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    SchemaDrift,
    Freshness,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::SchemaDrift => "SCHEMA_DRIFT",
            RuleType::Freshness => "FRESHNESS",
        }
    }
}

/// Incident severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }
}

macro_rules! impl_wire_str {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($ty::$variant.as_str()) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(validation_error(format!(
                    "Unknown {} '{}'",
                    stringify!($ty),
                    s
                )))
            }
        }
    };
}

impl_wire_str!(RuleType { SchemaDrift, Freshness });
impl_wire_str!(Severity { Low, Medium, High });
impl_wire_str!(IncidentStatus { Open, Resolved });

/// Payload of a freshness incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessDetails {
    pub message: String,
    pub observed_at: DateTime<Utc>,
    pub threshold_hours: f64,
    pub age_hours: f64,
}

/// Rule-specific incident payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncidentDetails {
    SchemaDrift(SchemaDiff),
    Freshness(FreshnessDetails),
}

impl IncidentDetails {
    pub fn rule_type(&self) -> RuleType {
        match self {
            IncidentDetails::SchemaDrift(_) => RuleType::SchemaDrift,
            IncidentDetails::Freshness(_) => RuleType::Freshness,
        }
    }
}

/// Ledger key: at most one open incident per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncidentKey {
    pub dataset_key: DatasetKey,
    pub rule_type: RuleType,
}

impl IncidentKey {
    pub fn new(dataset_key: DatasetKey, rule_type: RuleType) -> Self {
        Self {
            dataset_key,
            rule_type,
        }
    }
}

impl fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset_key, self.rule_type)
    }
}

/// A detected, trackable quality problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: Uuid,
    pub dataset_key: DatasetKey,
    pub rule_type: RuleType,
    pub severity: Severity,
    pub details: IncidentDetails,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn open(
        key: &IncidentKey,
        severity: Severity,
        details: IncidentDetails,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_key: key.dataset_key.clone(),
            rule_type: key.rule_type,
            severity,
            details,
            status: IncidentStatus::Open,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn key(&self) -> IncidentKey {
        IncidentKey::new(self.dataset_key.clone(), self.rule_type)
    }

    pub fn is_open(&self) -> bool {
        self.status == IncidentStatus::Open
    }
}

/// Outcome of one rule evaluation against the current state
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    /// No problem detected
    Clear,
    Problem {
        severity: Severity,
        details: IncidentDetails,
    },
}

impl Finding {
    pub fn is_problem(&self) -> bool {
        matches!(self, Finding::Problem { .. })
    }
}

/// What the ledger did in response to a finding
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "incident", rename_all = "camelCase")]
pub enum LedgerAction {
    NoOp,
    Opened(Incident),
    Resolved(Incident),
    /// Only under `RepeatPolicy::RefreshDetails`
    Refreshed(Incident),
}

impl LedgerAction {
    pub fn incident(&self) -> Option<&Incident> {
        match self {
            LedgerAction::NoOp => None,
            LedgerAction::Opened(i) | LedgerAction::Resolved(i) | LedgerAction::Refreshed(i) => {
                Some(i)
            }
        }
    }
}

/// Query over incidents; `None` fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentFilter {
    pub dataset_key: Option<DatasetKey>,
    /// Source connection name, the part of the key before `:`
    pub source: Option<String>,
    pub rule_type: Option<RuleType>,
    pub status: Option<IncidentStatus>,
}

impl IncidentFilter {
    /// Every incident raised on datasets of one source
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        self.dataset_key
            .as_ref()
            .map_or(true, |k| *k == incident.dataset_key)
            && self
                .source
                .as_deref()
                .map_or(true, |s| incident.dataset_key.source() == Some(s))
            && self.rule_type.map_or(true, |r| r == incident.rule_type)
            && self.status.map_or(true, |s| s == incident.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(RuleType::SchemaDrift).unwrap(),
            serde_json::json!("SCHEMA_DRIFT")
        );
        assert_eq!(
            serde_json::to_value(IncidentStatus::Resolved).unwrap(),
            serde_json::json!("RESOLVED")
        );
        assert_eq!("freshness".parse::<RuleType>().unwrap(), RuleType::Freshness);
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!("CRITICAL".parse::<Severity>().is_err());
    }

    #[test]
    fn test_details_are_tagged() {
        let details = IncidentDetails::SchemaDrift(SchemaDiff::default());
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["kind"], "schema_drift");
        assert_eq!(details.rule_type(), RuleType::SchemaDrift);

        let back: IncidentDetails = serde_json::from_value(value).unwrap();
        assert_eq!(back, details);
    }

    #[test]
    fn test_filter_matching() {
        let key = IncidentKey::new(
            DatasetKey::new("warehouse:public.orders").unwrap(),
            RuleType::Freshness,
        );
        let incident = Incident::open(
            &key,
            Severity::Medium,
            IncidentDetails::Freshness(FreshnessDetails {
                message: "stale".to_string(),
                observed_at: Utc::now(),
                threshold_hours: 24.0,
                age_hours: 30.0,
            }),
            Utc::now(),
        );

        let open_for_key = IncidentFilter {
            dataset_key: Some(key.dataset_key.clone()),
            rule_type: Some(key.rule_type),
            status: Some(IncidentStatus::Open),
            ..Default::default()
        };
        assert!(open_for_key.matches(&incident));
        assert!(IncidentFilter::default().matches(&incident));
        assert!(IncidentFilter::for_source("warehouse").matches(&incident));
        assert!(!IncidentFilter::for_source("ware").matches(&incident));
        assert!(!IncidentFilter::for_source("lake").matches(&incident));

        let other_rule = IncidentFilter {
            rule_type: Some(RuleType::SchemaDrift),
            ..Default::default()
        };
        assert!(!other_rule.matches(&incident));
    }
}
