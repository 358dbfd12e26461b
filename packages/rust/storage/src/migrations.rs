//! SQL migration definitions for the listing store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: listings keyed by subject",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per subject; fields_json is canonical (sorted keys)
CREATE TABLE IF NOT EXISTS listings (
    id          TEXT PRIMARY KEY,
    subject_id  TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE(subject_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Dead-letter records (write-once)",
            sql: r#"
CREATE TABLE IF NOT EXISTS dead_letters (
    id          TEXT PRIMARY KEY,
    trace_id    TEXT,
    subject_id  TEXT,
    stage       TEXT NOT NULL,
    reason      TEXT NOT NULL,
    error       TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    failed_at   TEXT NOT NULL,
    record_json TEXT NOT NULL,
    stored_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_stored_at ON dead_letters(stored_at);
CREATE INDEX IF NOT EXISTS idx_dead_letters_subject ON dead_letters(subject_id);

CREATE TRIGGER IF NOT EXISTS dead_letters_no_update BEFORE UPDATE ON dead_letters BEGIN
    SELECT RAISE(ABORT, 'dead-letter records are write-once');
END;

CREATE TRIGGER IF NOT EXISTS dead_letters_no_delete BEFORE DELETE ON dead_letters BEGIN
    SELECT RAISE(ABORT, 'dead-letter records are write-once');
END;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
