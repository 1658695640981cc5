/// Schema for the cache store and the offline mutation queue.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Cache namespaces, named {prefix}-{kind}-v{version}
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Cached responses. `id` grows with every insert or overwrite, so
-- MIN(id) within a namespace is the oldest-inserted surviving entry.
CREATE TABLE IF NOT EXISTS cache_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    validated_at TEXT,
    UNIQUE (namespace, cache_key),
    FOREIGN KEY (namespace) REFERENCES cache_namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_namespace ON cache_entries(namespace, id);

-- Offline mutation queue, FIFO by id
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_attempt_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_mutations_status ON mutations(status, id);
"#;
