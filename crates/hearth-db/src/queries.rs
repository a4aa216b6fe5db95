use crate::Database;
use crate::models::{ChallengeRow, MessageRow, RoomRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, Row};

/// Backup code hashes are PHC strings, which contain commas.
const BACKUP_CODE_SEPARATOR: &str = "\n";

const USER_COLUMNS: &str = "id, username, password_hash, email, two_factor_enabled, backup_codes, \
                            failed_login_attempts, locked_until, created_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password_hash) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Store the failure count and, once the threshold is hit, the lockout end.
    pub fn set_failed_logins(
        &self,
        id: &str,
        attempts: u32,
        locked_until: Option<&str>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET failed_login_attempts = ?1, locked_until = ?2 WHERE id = ?3",
                rusqlite::params![attempts, locked_until, id],
            )?;
            Ok(())
        })
    }

    pub fn reset_failed_logins(&self, id: &str) -> Result<()> {
        self.set_failed_logins(id, 0, None)
    }

    pub fn set_email(&self, id: &str, email: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute("UPDATE users SET email = ?1 WHERE id = ?2", (email, id))?;
            Ok(())
        })
    }

    pub fn enable_two_factor(&self, id: &str, backup_code_hashes: &[String]) -> Result<()> {
        let joined = join_backup_codes(backup_code_hashes);
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET two_factor_enabled = 1, backup_codes = ?1 WHERE id = ?2",
                (joined, id),
            )?;
            Ok(())
        })
    }

    /// The email is kept for account recovery.
    pub fn disable_two_factor(&self, id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET two_factor_enabled = 0, backup_codes = NULL WHERE id = ?1",
                [id],
            )?;
            conn.execute("DELETE FROM two_factor_challenges WHERE owner_id = ?1", [id])?;
            Ok(())
        })
    }

    /// Replace the backup code list only if it still equals `expected`.
    /// Returns false when another writer got there first.
    pub fn swap_backup_codes(&self, id: &str, expected: &[String], replacement: &[String]) -> Result<bool> {
        let expected = join_backup_codes(expected);
        let replacement = join_backup_codes(replacement);
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE users SET backup_codes = ?1 WHERE id = ?2 AND backup_codes IS ?3",
                (replacement, id, expected),
            )?;
            Ok(n > 0)
        })
    }

    // -- Rooms --

    pub fn list_rooms(&self) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, encrypted, created_at FROM rooms ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RoomRow {
                        name: row.get(0)?,
                        encrypted: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false if the room already exists.
    pub fn create_room(&self, name: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO rooms (name, encrypted) VALUES (?1, 1)",
                [name],
            )?;
            Ok(inserted == 1)
        })
    }

    /// Remove a room and its history. Returns false if no such room.
    pub fn delete_room(&self, name: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute("DELETE FROM rooms WHERE name = ?1", [name])?;
            if removed == 0 {
                return Ok(false);
            }
            conn.execute("DELETE FROM messages WHERE room = ?1", [name])?;
            Ok(true)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &MessageRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, user_id, username, content, room, timestamp, encrypted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    msg.id,
                    msg.user_id,
                    msg.username,
                    msg.content,
                    msg.room,
                    msg.timestamp,
                    msg.encrypted
                ],
            )?;
            Ok(())
        })
    }

    /// The newest `limit` messages of a room, oldest first.
    pub fn get_messages(&self, room: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, username, content, room, timestamp, encrypted
                 FROM messages
                 WHERE room = ?1
                 ORDER BY timestamp DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt
                .query_map(rusqlite::params![room, limit], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        content: row.get(3)?,
                        room: row.get(4)?,
                        timestamp: row.get(5)?,
                        encrypted: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn message_author(&self, id: &str) -> Result<Option<String>> {
        Ok(self.message_origin(id)?.map(|(author, _)| author))
    }

    /// Author id and room of one message.
    pub fn message_origin(&self, id: &str) -> Result<Option<(String, String)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, room FROM messages WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }

    /// Returns true if a row was removed.
    pub fn delete_message(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    pub fn count_messages(&self, room: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM messages WHERE room = ?1", [room], |row| {
                    row.get(0)
                })?;
            Ok(n as u64)
        })
    }

    // -- Two-factor challenges --

    /// Create or overwrite the live challenge for an owner and purpose.
    pub fn upsert_challenge(&self, row: &ChallengeRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO two_factor_challenges (owner_id, purpose, code, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(owner_id, purpose)
                 DO UPDATE SET code = excluded.code, expires_at = excluded.expires_at",
                (&row.owner_id, &row.purpose, &row.code, &row.expires_at),
            )?;
            Ok(())
        })
    }

    pub fn get_challenge(&self, owner_id: &str, purpose: &str) -> Result<Option<ChallengeRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT owner_id, purpose, code, expires_at FROM two_factor_challenges
                 WHERE owner_id = ?1 AND purpose = ?2",
                [owner_id, purpose],
                |row| {
                    Ok(ChallengeRow {
                        owner_id: row.get(0)?,
                        purpose: row.get(1)?,
                        code: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Delete the challenge only if it still holds `code`. Returns true when
    /// this call removed it, so two concurrent redemptions cannot both win.
    pub fn consume_challenge(&self, owner_id: &str, purpose: &str, code: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM two_factor_challenges
                 WHERE owner_id = ?1 AND purpose = ?2 AND code = ?3",
                [owner_id, purpose, code],
            )?;
            Ok(n > 0)
        })
    }

    /// Returns true if a challenge was removed.
    pub fn clear_challenge(&self, owner_id: &str, purpose: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM two_factor_challenges WHERE owner_id = ?1 AND purpose = ?2",
                [owner_id, purpose],
            )?;
            Ok(n > 0)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row([value], map_user).optional()
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    let backup_codes: Option<String> = row.get(5)?;
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        email: row.get(3)?,
        two_factor_enabled: row.get(4)?,
        backup_codes: split_backup_codes(backup_codes.as_deref()),
        failed_login_attempts: row.get(6)?,
        locked_until: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn join_backup_codes(hashes: &[String]) -> Option<String> {
    if hashes.is_empty() {
        None
    } else {
        Some(hashes.join(BACKUP_CODE_SEPARATOR))
    }
}

fn split_backup_codes(stored: Option<&str>) -> Vec<String> {
    stored
        .map(|s| {
            s.split(BACKUP_CODE_SEPARATOR)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
