use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                email       TEXT NOT NULL UNIQUE,
                phone       TEXT UNIQUE,
                password    TEXT,
                google_id   TEXT UNIQUE,
                avatar_url  TEXT,
                is_verified INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE qr_codes (
                id              TEXT PRIMARY KEY,
                owner_id        TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                unique_code     TEXT NOT NULL UNIQUE,
                purpose         TEXT NOT NULL,
                custom_purpose  TEXT,
                template        TEXT,
                status          TEXT NOT NULL DEFAULT 'inactive'
                                CHECK (status IN ('inactive', 'active', 'expired')),
                scan_count      INTEGER NOT NULL DEFAULT 0,
                last_scanned_at TEXT,
                activated_at    TEXT,
                expires_at      TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX idx_qr_owner ON qr_codes(owner_id, created_at);

            CREATE TABLE scan_logs (
                id          TEXT PRIMARY KEY,
                qr_id       TEXT NOT NULL REFERENCES qr_codes(id) ON DELETE CASCADE,
                ip          TEXT,
                user_agent  TEXT,
                scanned_at  TEXT NOT NULL
            );

            CREATE INDEX idx_scan_logs_qr ON scan_logs(qr_id, scanned_at);

            CREATE TABLE chat_sessions (
                id                  TEXT PRIMARY KEY,
                qr_id               TEXT NOT NULL REFERENCES qr_codes(id) ON DELETE CASCADE,
                owner_id            TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                stranger_token_hash TEXT NOT NULL UNIQUE,
                is_active           INTEGER NOT NULL DEFAULT 1,
                created_at          TEXT NOT NULL,
                last_activity_at    TEXT NOT NULL,
                closed_at           TEXT
            );

            CREATE INDEX idx_sessions_owner ON chat_sessions(owner_id, last_activity_at);

            CREATE TABLE chat_messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                session_id  TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
                sender_role TEXT NOT NULL CHECK (sender_role IN ('owner', 'stranger')),
                kind        TEXT NOT NULL DEFAULT 'text'
                            CHECK (kind IN ('text', 'voice', 'location', 'system')),
                content     TEXT NOT NULL,
                media_url   TEXT,
                latitude    REAL,
                longitude   REAL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_messages_session ON chat_messages(session_id, seq);

            CREATE TABLE calls (
                id                TEXT PRIMARY KEY,
                qr_id             TEXT NOT NULL REFERENCES qr_codes(id) ON DELETE CASCADE,
                session_id        TEXT REFERENCES chat_sessions(id) ON DELETE SET NULL,
                caller_id         TEXT NOT NULL,
                callee_id         TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'ringing'
                                  CHECK (status IN ('ringing', 'connected', 'declined', 'ended', 'missed')),
                escalated_to      TEXT,
                escalation_result TEXT NOT NULL DEFAULT 'not_attempted'
                                  CHECK (escalation_result IN ('answered', 'missed', 'not_attempted')),
                started_at        TEXT NOT NULL,
                connected_at      TEXT,
                ended_at          TEXT
            );

            CREATE INDEX idx_calls_qr ON calls(qr_id, started_at);
            CREATE INDEX idx_calls_status ON calls(status, started_at);

            CREATE TABLE emergency_contacts (
                id          TEXT PRIMARY KEY,
                owner_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name        TEXT NOT NULL,
                phone       TEXT NOT NULL,
                relation    TEXT NOT NULL DEFAULT '',
                priority    INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                UNIQUE(owner_id, phone)
            );

            CREATE INDEX idx_contacts_owner ON emergency_contacts(owner_id, priority);

            CREATE TABLE notifications (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                kind        TEXT NOT NULL,
                title       TEXT NOT NULL,
                body        TEXT NOT NULL,
                data        TEXT NOT NULL DEFAULT '{}',
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_notifications_user ON notifications(user_id, created_at);

            CREATE TABLE orders (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                qr_id       TEXT REFERENCES qr_codes(id) ON DELETE SET NULL,
                order_type  TEXT NOT NULL CHECK (order_type IN ('pdf', 'sticker')),
                amount      INTEGER NOT NULL,
                currency    TEXT NOT NULL DEFAULT 'INR',
                status      TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'paid')),
                payment_id  TEXT,
                created_at  TEXT NOT NULL,
                paid_at     TEXT
            );

            CREATE INDEX idx_orders_user ON orders(user_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
