use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                      TEXT PRIMARY KEY,
            username                TEXT NOT NULL UNIQUE,
            password_hash           TEXT NOT NULL,
            email                   TEXT,
            two_factor_enabled      INTEGER NOT NULL DEFAULT 0,
            backup_codes            TEXT,
            failed_login_attempts   INTEGER NOT NULL DEFAULT 0,
            locked_until            TEXT,
            created_at              TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS rooms (
            name        TEXT PRIMARY KEY,
            encrypted   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            username    TEXT NOT NULL,
            content     TEXT NOT NULL,
            room        TEXT NOT NULL,
            timestamp   TEXT NOT NULL,
            encrypted   INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room, timestamp);

        -- At most one live challenge per owner and purpose
        CREATE TABLE IF NOT EXISTS two_factor_challenges (
            owner_id    TEXT NOT NULL,
            purpose     TEXT NOT NULL,
            code        TEXT NOT NULL,
            expires_at  TEXT NOT NULL,
            PRIMARY KEY (owner_id, purpose)
        );

        -- Seed the default general room
        INSERT OR IGNORE INTO rooms (name, encrypted) VALUES ('general', 1);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
