//! SQLite persistence: user rows plus the asynchronous, retrying ban
//! writer pipeline.
//!
//! Ban writes never block a command handler: they enqueue onto small
//! bounded queues drained by dedicated tasks. A failed execution is
//! re-enqueued with a retry counter and dropped (logged) after three
//! attempts.

use crate::bans::far_future_secs;
use crate::user::Userid;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

const BAN_QUEUE_SIZE: usize = 10;
/// Retries after the first attempt; three attempts total.
const MAX_BAN_RETRIES: u8 = 2;

/// A pending ban insert.
#[derive(Debug)]
pub struct InsertBan {
    /// The banning moderator.
    pub uid: Userid,
    pub target: Userid,
    /// Masked IP, stored only for ip bans.
    pub ip: Option<String>,
    pub reason: String,
    /// Unix seconds.
    pub start: i64,
    /// Unix seconds; permanent bans carry the far-future sentinel.
    pub end: i64,
    retries: u8,
}

#[derive(Debug)]
struct DeleteBan {
    target: Userid,
    retries: u8,
}

/// An active ban row.
#[derive(Debug, Clone)]
pub struct BanRow {
    pub target: Userid,
    pub ip: Option<String>,
    /// Unix seconds.
    pub end: i64,
}

/// Database handle with connection pool and ban write queues.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    insert_ban: mpsc::Sender<InsertBan>,
    delete_ban: mpsc::Sender<DeleteBan>,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from
    /// blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection (and its cached statements) can remain
    /// idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Open (or create) the database, run migrations, and start the ban
    /// writer tasks.
    pub async fn connect(path: &str) -> Result<Self, DbError> {
        let pool = if path == ":memory:" {
            let options = SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        warn!(path = %parent.display(), error = %e, "failed to create database directory");
                    }
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "database connected");
        Self::run_migrations(&pool).await?;

        let (insert_tx, insert_rx) = mpsc::channel(BAN_QUEUE_SIZE);
        let (delete_tx, delete_rx) = mpsc::channel(BAN_QUEUE_SIZE);
        tokio::spawn(run_insert_ban(pool.clone(), insert_rx, insert_tx.clone()));
        tokio::spawn(run_delete_ban(pool.clone(), delete_rx, delete_tx.clone()));

        Ok(Self {
            pool,
            insert_ban: insert_tx,
            delete_ban: delete_tx,
        })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
        async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
            )
            .bind(table)
            .fetch_one(pool)
            .await
            .unwrap_or(false)
        }

        if !table_exists(pool, "users").await || !table_exists(pool, "bans").await {
            for statement in include_str!("../migrations/001_init.sql").split(';') {
                let sql = statement.trim();
                if sql.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(sql).execute(pool).await {
                    if !e.to_string().contains("already exists") {
                        warn!(sql = %sql, error = %e, "migration statement failed");
                    }
                }
            }
            info!("database migrations applied (001_init)");
        }
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Insert a user row for a first login; existing rows are untouched.
    pub async fn new_user(&self, uuid: &str, nick: &str, ip: &str) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO users (uuid, nick, features, firstlogin, lastlogin, lastip)
            VALUES (?, ?, '', strftime('%s', 'now'), strftime('%s', 'now'), ?)
            "#,
        )
        .bind(uuid)
        .bind(nick)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve the chat-internal id and feature labels for an external id.
    pub async fn get_user_info(&self, uuid: &str) -> Result<(Userid, Vec<String>), DbError> {
        let row = sqlx::query("SELECT userid, features FROM users WHERE uuid = ?")
            .bind(uuid)
            .fetch_one(&self.pool)
            .await?;
        let id: i64 = row.get("userid");
        let features: String = row.get("features");
        Ok((Userid(id), split_features(&features)))
    }

    /// Record the latest nick, login time and ip for a user.
    pub async fn update_user(&self, id: Userid, nick: &str, ip: &str) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE users SET
                nick = ?,
                lastlogin = strftime('%s', 'now'),
                lastip = ?
            WHERE userid = ?
            "#,
        )
        .bind(nick)
        .bind(ip)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a user id by nick for moderation targets that are offline.
    /// Returns the id and whether the target is protected.
    pub async fn lookup_nick(&self, nick: &str) -> Result<Option<(Userid, bool)>, DbError> {
        let row = sqlx::query("SELECT userid, features FROM users WHERE nick = ? COLLATE NOCASE")
            .bind(nick)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let id: i64 = row.get("userid");
            let features: String = row.get("features");
            let labels = split_features(&features);
            let protected = labels.iter().any(|f| f == "admin" || f == "protected");
            (Userid(id), protected)
        }))
    }

    // ========================================================================
    // Bans
    // ========================================================================

    /// Enqueue a ban insert for the writer task.
    pub async fn queue_insert_ban(
        &self,
        uid: Userid,
        target: Userid,
        ip: Option<String>,
        reason: String,
        start: i64,
        end: i64,
    ) {
        let ban = InsertBan { uid, target, ip, reason, start, end, retries: 0 };
        let _ = self.insert_ban.send(ban).await;
    }

    /// Enqueue expiry of all active bans for `target`.
    pub async fn queue_delete_ban(&self, target: Userid) {
        let _ = self.delete_ban.send(DeleteBan { target, retries: 0 }).await;
    }

    /// The currently active bans, one row per (target, ip) pair.
    pub async fn active_bans(&self) -> Result<Vec<BanRow>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT targetuserid, ipaddress, endtimestamp
            FROM bans
            WHERE endtimestamp IS NULL OR endtimestamp > strftime('%s', 'now')
            GROUP BY targetuserid, ipaddress
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let target: i64 = row.get("targetuserid");
                let ip: Option<String> = row.get("ipaddress");
                let end: Option<i64> = row.get("endtimestamp");
                BanRow {
                    target: Userid(target),
                    ip,
                    end: end.unwrap_or_else(far_future_secs),
                }
            })
            .collect())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Comma-separated feature labels, as stored in the users table.
fn split_features(features: &str) -> Vec<String> {
    features
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

async fn exec_insert_ban(pool: &SqlitePool, ban: &InsertBan) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO bans (userid, targetuserid, ipaddress, reason, starttimestamp, endtimestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(ban.uid.0)
    .bind(ban.target.0)
    .bind(ban.ip.as_deref())
    .bind(&ban.reason)
    .bind(ban.start)
    .bind(ban.end)
    .execute(pool)
    .await?;
    Ok(())
}

async fn exec_delete_ban(pool: &SqlitePool, target: Userid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE bans
        SET endtimestamp = strftime('%s', 'now')
        WHERE
            targetuserid = ? AND
            (
                endtimestamp IS NULL OR
                endtimestamp > strftime('%s', 'now')
            )
        "#,
    )
    .bind(target.0)
    .execute(pool)
    .await?;
    Ok(())
}

async fn run_insert_ban(
    pool: SqlitePool,
    mut rx: mpsc::Receiver<InsertBan>,
    retry: mpsc::Sender<InsertBan>,
) {
    while let Some(mut ban) = rx.recv().await {
        if ban.retries > MAX_BAN_RETRIES {
            warn!(target = %ban.target, "dropping ban insert after retries");
            continue;
        }
        if let Err(e) = exec_insert_ban(&pool, &ban).await {
            warn!(target = %ban.target, error = %e, "unable to insert ban");
            ban.retries += 1;
            let retry = retry.clone();
            tokio::spawn(async move {
                let _ = retry.send(ban).await;
            });
        }
    }
}

async fn run_delete_ban(
    pool: SqlitePool,
    mut rx: mpsc::Receiver<DeleteBan>,
    retry: mpsc::Sender<DeleteBan>,
) {
    while let Some(mut req) = rx.recv().await {
        if req.retries > MAX_BAN_RETRIES {
            warn!(target = %req.target, "dropping ban delete after retries");
            continue;
        }
        if let Err(e) = exec_delete_ban(&pool, req.target).await {
            warn!(target = %req.target, error = %e, "unable to delete ban");
            req.retries += 1;
            let retry = retry.clone();
            tokio::spawn(async move {
                let _ = retry.send(req).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Per-test database file; `:memory:` with a shared cache is visible
    /// process-wide and parallel tests would see each other's rows.
    struct TempDb(PathBuf);

    impl TempDb {
        fn new(tag: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("chatd-db-{tag}-{}.sqlite", std::process::id()));
            let _ = std::fs::remove_file(&path);
            Self(path)
        }

        fn path(&self) -> String {
            self.0.to_string_lossy().into_owned()
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-journal", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    #[tokio::test]
    async fn migrations_and_user_round_trip() {
        let file = TempDb::new("users");
        let db = Database::connect(&file.path()).await.expect("connect");
        db.new_user("uuid-1", "alice", "127.0.0.1").await.expect("insert");
        // second login does not duplicate
        db.new_user("uuid-1", "alice", "127.0.0.1").await.expect("idempotent");

        let (id, features) = db.get_user_info("uuid-1").await.expect("lookup");
        assert!(id.0 > 0);
        assert!(features.is_empty());

        db.update_user(id, "alice2", "127.0.0.2").await.expect("update");
        let found = db.lookup_nick("ALICE2").await.expect("query");
        assert_eq!(found.map(|(uid, _)| uid), Some(id));
    }

    #[tokio::test]
    async fn lookup_nick_reports_protected() {
        let file = TempDb::new("protected");
        let db = Database::connect(&file.path()).await.expect("connect");
        db.new_user("uuid-2", "mod", "127.0.0.1").await.expect("insert");
        sqlx::query("UPDATE users SET features = 'moderator,protected' WHERE uuid = 'uuid-2'")
            .execute(db.pool())
            .await
            .expect("set features");
        let (_, protected) = db.lookup_nick("mod").await.expect("query").expect("found");
        assert!(protected);
    }

    #[tokio::test]
    async fn ban_insert_and_expiry() {
        let file = TempDb::new("bans");
        let db = Database::connect(&file.path()).await.expect("connect");
        let now = chrono::Utc::now().timestamp();
        let ban = InsertBan {
            uid: Userid(1),
            target: Userid(2),
            ip: Some("10.0.0.1".into()),
            reason: "spam".into(),
            start: now,
            end: far_future_secs(),
            retries: 0,
        };
        exec_insert_ban(db.pool(), &ban).await.expect("insert");

        let active = db.active_bans().await.expect("query");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].target, Userid(2));
        assert_eq!(active[0].ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(active[0].end, far_future_secs());

        exec_delete_ban(db.pool(), Userid(2)).await.expect("delete");
        let active = db.active_bans().await.expect("query");
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn queued_ban_insert_lands() {
        let file = TempDb::new("queued");
        let db = Database::connect(&file.path()).await.expect("connect");
        let now = chrono::Utc::now().timestamp();
        db.queue_insert_ban(Userid(1), Userid(3), None, "test".into(), now, now + 3600)
            .await;
        // drain through the writer task
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !db.active_bans().await.expect("query").is_empty() {
                return;
            }
        }
        panic!("queued ban never persisted");
    }

    #[test]
    fn feature_splitting() {
        assert_eq!(split_features(""), Vec::<String>::new());
        assert_eq!(split_features("admin"), vec!["admin"]);
        assert_eq!(split_features("admin, bot ,"), vec!["admin", "bot"]);
    }
}
