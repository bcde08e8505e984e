//! Archive schema. Executed on every open; all statements are idempotent.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY,
    username     TEXT,
    first_name   TEXT,
    last_name    TEXT,
    tags         TEXT,
    avatar       TEXT,
    last_updated TEXT
);

CREATE TABLE IF NOT EXISTS media (
    id          INTEGER PRIMARY KEY,
    type        TEXT NOT NULL,
    url         TEXT,
    title       TEXT,
    description TEXT,
    thumb       TEXT,
    checksum    TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id        INTEGER PRIMARY KEY,
    type      TEXT NOT NULL,
    date      TEXT NOT NULL,
    edit_date TEXT,
    content   TEXT,
    reply_to  INTEGER,
    user_id   INTEGER REFERENCES users(id),
    media_id  INTEGER REFERENCES media(id),
    checksum  TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date);

CREATE TABLE IF NOT EXISTS checkpoints (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    entity          TEXT NOT NULL DEFAULT '',
    context         TEXT NOT NULL DEFAULT 'sync',
    last_message_id INTEGER NOT NULL,
    checkpoint_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_lookup
    ON checkpoints(entity, context, checkpoint_time DESC);

CREATE TABLE IF NOT EXISTS account_channel_access (
    account_phone_number TEXT NOT NULL,
    channel_id           INTEGER NOT NULL,
    channel_name         TEXT,
    access_hash          INTEGER,
    last_seen            TEXT NOT NULL,
    UNIQUE(account_phone_number, channel_id)
);

CREATE TABLE IF NOT EXISTS file_hashes (
    file_id         TEXT PRIMARY KEY,
    sha256_hash     TEXT,
    perceptual_hash TEXT,
    fuzzy_hash      TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_hashes_sha256 ON file_hashes(sha256_hash);

CREATE TABLE IF NOT EXISTS channel_file_inventory (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL,
    file_id    TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    topic_id   INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE(channel_id, file_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_inventory_file ON channel_file_inventory(file_id);

CREATE TABLE IF NOT EXISTS channel_forward_schedule (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id      INTEGER NOT NULL,
    destination     TEXT NOT NULL,
    schedule        TEXT NOT NULL,
    last_message_id INTEGER NOT NULL DEFAULT 0,
    is_enabled      INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_forward_stats (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id        INTEGER NOT NULL,
    messages_forwarded INTEGER NOT NULL,
    files_forwarded    INTEGER NOT NULL,
    bytes_forwarded    INTEGER NOT NULL,
    started_at         TEXT NOT NULL,
    finished_at        TEXT NOT NULL,
    status             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_forward_schedule (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    source          TEXT NOT NULL,
    destination     TEXT NOT NULL,
    schedule        TEXT NOT NULL,
    file_types      TEXT,
    min_file_size   INTEGER,
    max_file_size   INTEGER,
    priority        INTEGER NOT NULL DEFAULT 0,
    last_message_id INTEGER NOT NULL DEFAULT 0,
    is_enabled      INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_forward_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER REFERENCES file_forward_schedule(id),
    message_id  INTEGER NOT NULL,
    file_id     TEXT NOT NULL,
    destination TEXT,
    status      TEXT NOT NULL DEFAULT 'pending',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_status ON file_forward_queue(status);

CREATE TABLE IF NOT EXISTS file_forward_stats (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id     INTEGER NOT NULL,
    files_forwarded INTEGER NOT NULL,
    bytes_forwarded INTEGER NOT NULL,
    started_at      TEXT NOT NULL,
    finished_at     TEXT NOT NULL,
    status          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS category_to_group_mapping (
    category TEXT NOT NULL,
    group_id INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (category, group_id)
);

CREATE TABLE IF NOT EXISTS category_stats (
    category    TEXT PRIMARY KEY,
    files_count INTEGER NOT NULL DEFAULT 0,
    bytes_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sorting_groups (
    group_name TEXT PRIMARY KEY,
    template   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sorting_audit_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    source     TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    file_id    TEXT NOT NULL,
    category   TEXT NOT NULL,
    group_id   INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attribution_stats (
    source_channel_id  INTEGER PRIMARY KEY,
    attributions_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS migration_progress (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    source          TEXT NOT NULL,
    destination     TEXT NOT NULL,
    last_message_id INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'pending',
    updated_at      TEXT NOT NULL
);
"#;
