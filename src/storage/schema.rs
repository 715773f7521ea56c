//! Shared schema definitions
//!
//! Feature tables belong to their schema providers; only the pieces
//! shared by every module live here: the id-sequence table and the
//! legacy counter layout it replaced.

/// Name of the shared id-counter table
pub const SEQUENCE_TABLE: &str = "sequence";

/// SQL to create the shared sequence table, one row per entity kind
pub const CREATE_SEQUENCE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sequence (
    name TEXT PRIMARY KEY,
    id INTEGER NOT NULL
)
"#;

/// Pre-v14 layouts kept per-feature counters in this table
pub const LEGACY_COUNTERS_TABLE: &str = "counters";

/// Fold legacy counter rows into the sequence table, keeping the
/// larger value when both exist
pub const MERGE_LEGACY_COUNTERS: &str = r#"
INSERT INTO sequence (name, id)
SELECT name, MAX(value) FROM counters GROUP BY name
ON CONFLICT(name) DO UPDATE SET id = MAX(id, excluded.id)
"#;

/// Drop the legacy counter table once merged
pub const DROP_LEGACY_COUNTERS: &str = "DROP TABLE IF EXISTS counters";
