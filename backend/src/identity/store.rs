//! SQL for identities, sessions and verification tokens.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use site_common::{IdentityUser, UserMetadata, VerifyKind};

use crate::error::Result;

/// An identity with its stored password hash.
pub struct IdentityRecord {
    pub user: IdentityUser,
    pub password_hash: String,
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<IdentityRecord> {
    let metadata: String = row.get(3)?;
    let confirmed: Option<String> = row.get(4)?;
    let created: String = row.get(5)?;
    Ok(IdentityRecord {
        user: IdentityUser {
            id: row.get(0)?,
            email: row.get(1)?,
            user_metadata: serde_json::from_str::<UserMetadata>(&metadata).unwrap_or_default(),
            email_confirmed_at: confirmed.as_deref().map(parse_time),
            created_at: parse_time(&created),
        },
        password_hash: row.get(2)?,
    })
}

const IDENTITY_COLUMNS: &str =
    "id, email, password_hash, user_metadata, email_confirmed_at, created_at";

pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<IdentityRecord>> {
    let sql = format!("SELECT {} FROM identities WHERE email = ?1", IDENTITY_COLUMNS);
    Ok(conn.query_row(&sql, params![email], identity_from_row).optional()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<IdentityRecord>> {
    let sql = format!("SELECT {} FROM identities WHERE id = ?1", IDENTITY_COLUMNS);
    Ok(conn.query_row(&sql, params![id], identity_from_row).optional()?)
}

pub fn insert_identity(conn: &Connection, user: &IdentityUser, password_hash: &str) -> Result<()> {
    let metadata = serde_json::to_string(&user.user_metadata).unwrap_or_else(|_| "{}".to_string());
    conn.execute(
        "INSERT INTO identities (id, email, password_hash, user_metadata, email_confirmed_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user.id,
            user.email,
            password_hash,
            metadata,
            user.email_confirmed_at.map(|t| t.to_rfc3339()),
            user.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn confirm_email(conn: &Connection, user_id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE identities SET email_confirmed_at = COALESCE(email_confirmed_at, ?1) WHERE id = ?2",
        params![at.to_rfc3339(), user_id],
    )?;
    Ok(())
}

pub fn update_password(conn: &Connection, user_id: &str, password_hash: &str) -> Result<()> {
    conn.execute(
        "UPDATE identities SET password_hash = ?1 WHERE id = ?2",
        params![password_hash, user_id],
    )?;
    Ok(())
}

pub fn insert_session(
    conn: &Connection,
    session_id: &str,
    user_id: &str,
    refresh_hash: &str,
    expires_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, user_id, refresh_token_hash, created_at, expires_at, revoked)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![session_id, user_id, refresh_hash, Utc::now().to_rfc3339(), expires_at],
    )?;
    Ok(())
}

/// Live session for a refresh token digest, as `(session_id, user_id)`.
pub fn find_session_by_refresh(
    conn: &Connection,
    refresh_hash: &str,
    now: i64,
) -> Result<Option<(String, String)>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id FROM sessions
             WHERE refresh_token_hash = ?1 AND revoked = 0 AND expires_at > ?2",
            params![refresh_hash, now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

pub fn rotate_refresh(conn: &Connection, session_id: &str, refresh_hash: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET refresh_token_hash = ?1 WHERE id = ?2",
        params![refresh_hash, session_id],
    )?;
    Ok(())
}

pub fn is_session_active(conn: &Connection, session_id: &str, now: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sessions WHERE id = ?1 AND revoked = 0 AND expires_at > ?2",
            params![session_id, now],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn revoke_session(conn: &Connection, session_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sessions SET revoked = 1 WHERE id = ?1 AND revoked = 0",
        params![session_id],
    )?;
    Ok(changed > 0)
}

pub fn revoke_user_sessions(conn: &Connection, user_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE sessions SET revoked = 1 WHERE user_id = ?1 AND revoked = 0",
        params![user_id],
    )?)
}

pub fn insert_verification(
    conn: &Connection,
    token_hash: &str,
    user_id: &str,
    kind: VerifyKind,
    expires_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO verification_tokens (token_hash, user_id, kind, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![token_hash, user_id, kind.as_str(), expires_at],
    )?;
    Ok(())
}

/// Consume a verification token. Returns the user id if it was valid.
pub fn take_verification(
    conn: &Connection,
    token_hash: &str,
    kind: VerifyKind,
    now: i64,
) -> Result<Option<String>> {
    let found: Option<(String, i64)> = conn
        .query_row(
            "SELECT user_id, expires_at FROM verification_tokens WHERE token_hash = ?1 AND kind = ?2",
            params![token_hash, kind.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    conn.execute(
        "DELETE FROM verification_tokens WHERE token_hash = ?1 AND kind = ?2",
        params![token_hash, kind.as_str()],
    )?;

    Ok(found.and_then(|(user_id, expires_at)| (expires_at > now).then_some(user_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn identity(id: &str, email: &str) -> IdentityUser {
        IdentityUser {
            id: id.to_string(),
            email: email.to_string(),
            user_metadata: UserMetadata {
                name: "Ann".to_string(),
                username: "ann".to_string(),
                role: None,
            },
            email_confirmed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_find_identity() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();
        insert_identity(&conn, &identity("u1", "a@x.com"), "hash").unwrap();

        let found = find_by_email(&conn, "a@x.com").unwrap().unwrap();
        assert_eq!(found.user.id, "u1");
        assert_eq!(found.user.user_metadata.username, "ann");
        assert_eq!(found.password_hash, "hash");
        assert!(!found.user.is_confirmed());

        confirm_email(&conn, "u1", Utc::now()).unwrap();
        assert!(find_by_id(&conn, "u1").unwrap().unwrap().user.is_confirmed());
        assert!(find_by_email(&conn, "b@x.com").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();
        insert_identity(&conn, &identity("u1", "a@x.com"), "hash").unwrap();
        assert!(insert_identity(&conn, &identity("u2", "a@x.com"), "hash").is_err());
    }

    #[test]
    fn test_session_lifecycle() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();
        insert_identity(&conn, &identity("u1", "a@x.com"), "hash").unwrap();
        insert_session(&conn, "s1", "u1", "r1", 2_000).unwrap();

        assert!(is_session_active(&conn, "s1", 1_000).unwrap());
        assert!(!is_session_active(&conn, "s1", 2_000).unwrap());
        assert_eq!(
            find_session_by_refresh(&conn, "r1", 1_000).unwrap(),
            Some(("s1".to_string(), "u1".to_string()))
        );

        rotate_refresh(&conn, "s1", "r2").unwrap();
        assert!(find_session_by_refresh(&conn, "r1", 1_000).unwrap().is_none());
        assert!(find_session_by_refresh(&conn, "r2", 1_000).unwrap().is_some());

        assert!(revoke_session(&conn, "s1").unwrap());
        assert!(!revoke_session(&conn, "s1").unwrap());
        assert!(!is_session_active(&conn, "s1", 1_000).unwrap());
    }

    #[test]
    fn test_verification_token_kind_must_match() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();
        insert_identity(&conn, &identity("u1", "a@x.com"), "hash").unwrap();
        insert_verification(&conn, "t1", "u1", VerifyKind::Signup, 2_000).unwrap();

        assert!(take_verification(&conn, "t1", VerifyKind::Recovery, 1_000)
            .unwrap()
            .is_none());
        assert_eq!(
            take_verification(&conn, "t1", VerifyKind::Signup, 1_000).unwrap(),
            Some("u1".to_string())
        );
    }

    #[test]
    fn test_verification_token_expiry() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();
        insert_identity(&conn, &identity("u1", "a@x.com"), "hash").unwrap();
        insert_verification(&conn, "t1", "u1", VerifyKind::Signup, 2_000).unwrap();
        insert_verification(&conn, "t2", "u1", VerifyKind::Signup, 2_000).unwrap();

        assert_eq!(
            take_verification(&conn, "t1", VerifyKind::Signup, 1_000).unwrap(),
            Some("u1".to_string())
        );
        assert!(take_verification(&conn, "t1", VerifyKind::Signup, 1_000).unwrap().is_none());
        assert!(take_verification(&conn, "t2", VerifyKind::Signup, 3_000).unwrap().is_none());
    }
}
