//! SQL query constants
//!
//! Contains all SQL used by the metadata stores and the PostgreSQL source.

// ---------------------------------------------------------------------------
// Source introspection
// ---------------------------------------------------------------------------

/// All user tables visible on a monitored database
pub const DISCOVER_TABLES: &str = r#"
    SELECT table_schema, table_name
    FROM information_schema.tables
    WHERE table_type = 'BASE TABLE'
        AND table_schema NOT IN ('pg_catalog', 'information_schema')
        AND table_schema !~ '^pg_toast'
    ORDER BY table_schema, table_name
"#;

/// Columns of one table in ordinal order
pub const TABLE_COLUMNS: &str = r#"
    SELECT column_name, data_type, is_nullable
    FROM information_schema.columns
    WHERE table_schema = $1
        AND table_name = $2
    ORDER BY ordinal_position
"#;

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

pub const CREATE_SCHEMA_CAPTURES: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_captures (
        id BIGSERIAL PRIMARY KEY,
        dataset_key VARCHAR(255) NOT NULL,
        columns JSONB NOT NULL,
        checksum VARCHAR(64) NOT NULL,
        captured_at TIMESTAMPTZ NOT NULL
    )
"#;

pub const CREATE_CAPTURES_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_schema_captures_recency
    ON schema_captures (dataset_key, captured_at DESC, id DESC)
"#;

pub const CREATE_INCIDENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS incidents (
        id UUID PRIMARY KEY,
        dataset_key VARCHAR(255) NOT NULL,
        rule_type VARCHAR(32) NOT NULL,
        severity VARCHAR(16) NOT NULL,
        details JSONB NOT NULL,
        status VARCHAR(16) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        resolved_at TIMESTAMPTZ
    )
"#;

/// At most one open incident per (dataset_key, rule_type)
pub const CREATE_OPEN_INCIDENT_INDEX: &str = r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_incidents_open_key
    ON incidents (dataset_key, rule_type)
    WHERE status = 'OPEN'
"#;

pub const CREATE_INCIDENTS_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_incidents_created_at
    ON incidents (created_at DESC)
"#;

// ---------------------------------------------------------------------------
// Captures
// ---------------------------------------------------------------------------

/// Serializes appends per dataset for the rest of the transaction
pub const LOCK_DATASET: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

pub const INSERT_CAPTURE: &str = r#"
    INSERT INTO schema_captures (dataset_key, columns, checksum, captured_at)
    VALUES ($1, $2, $3, $4)
    RETURNING id
"#;

pub const CAPTURE_HISTORY: &str = r#"
    SELECT id, dataset_key, columns, checksum, captured_at
    FROM schema_captures
    WHERE dataset_key = $1
    ORDER BY captured_at DESC, id DESC
    LIMIT $2
"#;

pub const GET_CAPTURE: &str = r#"
    SELECT id, dataset_key, columns, checksum, captured_at
    FROM schema_captures
    WHERE id = $1
"#;

pub const LIST_DATASETS: &str = r#"
    SELECT DISTINCT dataset_key
    FROM schema_captures
    ORDER BY dataset_key
"#;

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

const INCIDENT_COLUMNS: &str =
    "id, dataset_key, rule_type, severity, details, status, created_at, resolved_at";

pub const FIND_OPEN_INCIDENT: &str = r#"
    SELECT id, dataset_key, rule_type, severity, details, status, created_at, resolved_at
    FROM incidents
    WHERE dataset_key = $1 AND rule_type = $2 AND status = 'OPEN'
"#;

pub const INSERT_INCIDENT: &str = r#"
    INSERT INTO incidents (id, dataset_key, rule_type, severity, details, status, created_at, resolved_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

/// Conditional on the incident still being open
pub const RESOLVE_INCIDENT: &str = r#"
    UPDATE incidents
    SET status = 'RESOLVED', resolved_at = $2
    WHERE id = $1 AND status = 'OPEN'
    RETURNING id, dataset_key, rule_type, severity, details, status, created_at, resolved_at
"#;

pub const REFRESH_INCIDENT: &str = r#"
    UPDATE incidents
    SET severity = $2, details = $3
    WHERE id = $1 AND status = 'OPEN'
    RETURNING id, dataset_key, rule_type, severity, details, status, created_at, resolved_at
"#;

pub const GET_INCIDENT: &str = r#"
    SELECT id, dataset_key, rule_type, severity, details, status, created_at, resolved_at
    FROM incidents
    WHERE id = $1
"#;

/// Build the incident listing query; `None` filters are skipped.
/// Placeholders follow the order dataset key, source prefix, rule type, status.
pub fn list_incidents(dataset_key: bool, source: bool, rule_type: bool, status: bool) -> String {
    let mut clauses = Vec::new();
    let mut n = 0;
    for (enabled, condition) in [
        (dataset_key, "dataset_key = ?"),
        (source, "starts_with(dataset_key, ?)"),
        (rule_type, "rule_type = ?"),
        (status, "status = ?"),
    ] {
        if enabled {
            n += 1;
            clauses.push(condition.replace('?', &format!("${}", n)));
        }
    }

    let mut sql = format!("SELECT {} FROM incidents", INCIDENT_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC");
    sql
}
