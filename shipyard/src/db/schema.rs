//! Database schema definitions.
//!
//! Build descriptors are immutable and shared by checksum. Crates are
//! immutable and reference one descriptor. Ships are the only mutable rows.

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema version tracking table.
pub const SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Raw build file content, deduplicated by SHA-256 checksum.
pub const BUILD_DESCRIPTORS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS build_descriptors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    checksum TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_build_descriptors_name ON build_descriptors(name);
"#;

/// Built crates. `base_image` is a crate name or the root layer sentinel.
pub const CRATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS crates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    tag TEXT NOT NULL,
    base_image TEXT NOT NULL,
    layer_path TEXT NOT NULL,
    digest TEXT NOT NULL UNIQUE,
    size_bytes INTEGER NOT NULL,
    descriptor_id INTEGER NOT NULL REFERENCES build_descriptors(id),
    created_at TEXT NOT NULL,
    UNIQUE (name, tag)
);

CREATE INDEX IF NOT EXISTS idx_crates_name ON crates(name);
"#;

/// Ships. The CHECK keeps `process_id` set exactly while running.
pub const SHIPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    image_id INTEGER NOT NULL REFERENCES crates(id),
    status TEXT NOT NULL,
    process_id INTEGER,
    created_at TEXT NOT NULL,
    started_at TEXT,
    stopped_at TEXT,
    exit_code INTEGER,
    CHECK ((status = 'running') = (process_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_ships_status ON ships(status);
CREATE INDEX IF NOT EXISTS idx_ships_image_id ON ships(image_id);
"#;

/// Get all schema creation statements.
pub fn all_schemas() -> Vec<&'static str> {
    vec![
        SCHEMA_VERSION_TABLE,
        BUILD_DESCRIPTORS_TABLE,
        CRATES_TABLE,
        SHIPS_TABLE,
    ]
}
