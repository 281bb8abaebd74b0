//! Schema Diff Engine
//!
//! Compares two captures of the same dataset column by column.
//! Pure: no I/O, no clock, no failure modes.

use crate::monitor::capture::{CaptureId, ColumnSpec, SchemaCapture};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Which column-level changes count as drift
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftPolicy {
    /// Treat a flipped `nullable` flag as drift
    #[serde(default)]
    pub nullability_is_drift: bool,
}

/// Which two captures a diff was computed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffProvenance {
    pub from_capture: CaptureId,
    pub to_capture: CaptureId,
    pub from_checksum: String,
    pub to_checksum: String,
}

/// Column-level differences between an older and a newer capture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub type_changed: BTreeSet<String>,
    /// Reported always; counted as drift only under [`DriftPolicy::nullability_is_drift`]
    #[serde(default)]
    pub nullability_changed: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provenance: Option<DiffProvenance>,
}

impl SchemaDiff {
    pub fn has_drift(&self, policy: &DriftPolicy) -> bool {
        self.change_count(policy) > 0
    }

    pub fn change_count(&self, policy: &DriftPolicy) -> usize {
        let nullability = if policy.nullability_is_drift {
            self.nullability_changed.len()
        } else {
            0
        };
        self.added.len() + self.removed.len() + self.type_changed.len() + nullability
    }

    /// Short human-readable summary, e.g. `+1 -0 ~2 nullability:0`
    pub fn summary(&self) -> String {
        format!(
            "+{} -{} ~{} nullability:{}",
            self.added.len(),
            self.removed.len(),
            self.type_changed.len(),
            self.nullability_changed.len()
        )
    }
}

/// The diff engine that compares captures
pub struct DiffEngine;

impl DiffEngine {
    /// Compare two captures; `older` is the previous capture in history
    pub fn diff(older: &SchemaCapture, newer: &SchemaCapture) -> SchemaDiff {
        let mut diff = Self::diff_columns(&older.columns, &newer.columns);
        diff.provenance = Some(DiffProvenance {
            from_capture: older.id,
            to_capture: newer.id,
            from_checksum: older.checksum.clone(),
            to_checksum: newer.checksum.clone(),
        });
        diff
    }

    /// Compare two column lists by name
    pub fn diff_columns(older: &[ColumnSpec], newer: &[ColumnSpec]) -> SchemaDiff {
        // Last write wins on duplicate names; stores reject duplicates anyway
        let from_cols: HashMap<&str, &ColumnSpec> =
            older.iter().map(|c| (c.name.as_str(), c)).collect();
        let to_cols: HashMap<&str, &ColumnSpec> =
            newer.iter().map(|c| (c.name.as_str(), c)).collect();

        let from_keys: HashSet<&str> = from_cols.keys().copied().collect();
        let to_keys: HashSet<&str> = to_cols.keys().copied().collect();

        let added = to_keys
            .difference(&from_keys)
            .map(|name| name.to_string())
            .collect();
        let removed = from_keys
            .difference(&to_keys)
            .map(|name| name.to_string())
            .collect();

        let mut type_changed = BTreeSet::new();
        let mut nullability_changed = BTreeSet::new();
        for name in from_keys.intersection(&to_keys) {
            let from = from_cols[name];
            let to = to_cols[name];
            if from.data_type != to.data_type {
                type_changed.insert(name.to_string());
            }
            if from.nullable != to.nullable {
                nullability_changed.insert(name.to_string());
            }
        }

        SchemaDiff {
            added,
            removed,
            type_changed,
            nullability_changed,
            provenance: None,
        }
    }
}
