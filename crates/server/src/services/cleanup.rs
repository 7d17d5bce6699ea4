use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::{
    config::Config,
    error::{AppError, Result},
    services::mail::Mailer,
};

const RETRY_ATTEMPTS: u32 = 3;

/// Batch maintenance jobs. All operations are idempotent and safe to re-run;
/// the scheduler in `main` guarantees no two runs overlap.
pub struct CleanupService {
    pool: SqlitePool,
    config: Config,
    mailer: Mailer,
}

impl CleanupService {
    pub fn new(pool: SqlitePool, config: Config, mailer: Mailer) -> Self {
        Self { pool, config, mailer }
    }

    /// Paths present under the storage root with no referencing database
    /// row. Dry-run counterpart of [`CleanupService::delete_orphaned_files`].
    pub async fn find_orphaned_files(&self) -> Result<Vec<PathBuf>> {
        let referenced = self.referenced_paths().await?;
        let root = Path::new(&self.config.storage_path);

        let mut present = Vec::new();
        collect_files(root, root, &mut present)?;

        Ok(present
            .into_iter()
            .filter(|rel| !referenced.contains(&path_key(rel)))
            .collect())
    }

    pub async fn delete_orphaned_files(&self) -> Result<usize> {
        let orphans = self.find_orphaned_files().await?;
        let root = Path::new(&self.config.storage_path);

        for rel in &orphans {
            let full = root.join(rel);
            tokio::fs::remove_file(&full)
                .await
                .map_err(|e| AppError::Internal(format!("failed to delete {}: {e}", full.display())))?;
            tracing::info!(path = %rel.display(), "deleted orphaned file");
        }

        Ok(orphans.len())
    }

    async fn referenced_paths(&self) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();

        let avatars = sqlx::query_scalar::<_, String>(
            "SELECT avatar_path FROM users WHERE avatar_path IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        let logos = sqlx::query_scalar::<_, String>(
            "SELECT logo_path FROM projects WHERE logo_path IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        let files = sqlx::query_scalar::<_, String>("SELECT path FROM version_files")
            .fetch_all(&self.pool)
            .await?;

        referenced.extend(avatars);
        referenced.extend(logos);
        referenced.extend(files);
        Ok(referenced)
    }

    /// Warn users whose email was never verified and who are older than the
    /// warning threshold. Stamping `unverified_deletion_warning_sent_at`
    /// makes the batch idempotent; a user whose mail fails to send is left
    /// unstamped for the next run.
    pub async fn warn_unverified_users(&self) -> Result<u64> {
        let threshold =
            (Utc::now() - chrono::Duration::days(self.config.unverified_warning_days)).to_rfc3339();

        let candidates = sqlx::query_as::<_, (String, String)>(
            "SELECT id, email FROM users \
             WHERE email_verified_at IS NULL \
               AND unverified_deletion_warning_sent_at IS NULL \
               AND created_at < ?",
        )
        .bind(&threshold)
        .fetch_all(&self.pool)
        .await?;

        let days_left = self.config.unverified_deletion_days - self.config.unverified_warning_days;
        let mut warned = 0;

        for (id, email) in candidates {
            if let Err(e) = self.mailer.send_unverified_warning(&email, days_left).await {
                tracing::warn!(user = id, "failed to send unverified warning: {e}");
                continue;
            }
            sqlx::query("UPDATE users SET unverified_deletion_warning_sent_at = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(&id)
                .execute(&self.pool)
                .await?;
            warned += 1;
        }

        Ok(warned)
    }

    /// Delete users whose email was never verified within the deletion
    /// threshold, whether or not they were warned.
    pub async fn delete_unverified_users(&self) -> Result<u64> {
        let threshold =
            (Utc::now() - chrono::Duration::days(self.config.unverified_deletion_days)).to_rfc3339();

        let result = sqlx::query(
            "DELETE FROM users WHERE email_verified_at IS NULL AND created_at < ?",
        )
        .bind(&threshold)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Permanently remove soft-deleted projects past the purge window,
    /// including their stored version files.
    pub async fn purge_deleted_projects(&self) -> Result<u64> {
        let threshold =
            (Utc::now() - chrono::Duration::days(self.config.project_purge_days)).to_rfc3339();

        let doomed = sqlx::query_scalar::<_, String>(
            "SELECT id FROM projects WHERE deleted_at IS NOT NULL AND deleted_at < ?",
        )
        .bind(&threshold)
        .fetch_all(&self.pool)
        .await?;

        for id in &doomed {
            let dir = Path::new(&self.config.storage_path).join("versions").join(id);
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                    AppError::Internal(format!("failed to remove {}: {e}", dir.display()))
                })?;
            }
            sqlx::query("DELETE FROM projects WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            tracing::info!(project = id, "purged soft-deleted project");
        }

        Ok(doomed.len() as u64)
    }

    /// One full maintenance pass. Each operation is retried with backoff;
    /// an operation that still fails is reported as a warning and the
    /// remaining operations run anyway.
    pub async fn run_all(&self) {
        if let Err(e) = with_retries("orphan sweep", || self.delete_orphaned_files()).await {
            tracing::warn!("orphan sweep failed after retries: {e}");
        }
        if let Err(e) = with_retries("unverified warning", || self.warn_unverified_users()).await {
            tracing::warn!("unverified warning batch failed after retries: {e}");
        }
        if let Err(e) = with_retries("unverified deletion", || self.delete_unverified_users()).await
        {
            tracing::warn!("unverified deletion batch failed after retries: {e}");
        }
        if let Err(e) = with_retries("project purge", || self.purge_deleted_projects()).await {
            tracing::warn!("project purge failed after retries: {e}");
        }
    }
}

async fn with_retries<F, Fut, T>(name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < RETRY_ATTEMPTS => {
                tracing::warn!(job = name, attempt, "cleanup operation failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| AppError::Internal(format!("failed to list {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| AppError::Internal(format!("failed to read dir entry: {e}")))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

// Stored paths always use forward slashes.
fn path_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_str;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn service(pool: SqlitePool, storage: &Path) -> CleanupService {
        let config = Config::for_tests(storage.to_string_lossy().to_string());
        CleanupService::new(pool, config, Mailer::Disabled)
    }

    async fn seed_user(pool: &SqlitePool, id: &str, created_days_ago: i64, verified: bool) {
        let created = (Utc::now() - chrono::Duration::days(created_days_ago)).to_rfc3339();
        let verified_at = verified.then(now_str);
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, email_verified_at, created_at) \
             VALUES (?, ?, ?, 'x', 'user', ?, ?)",
        )
        .bind(id)
        .bind(id)
        .bind(format!("{id}@example.com"))
        .bind(verified_at)
        .bind(created)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn orphan_sweep_lists_then_deletes_unreferenced_files() {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();

        std::fs::create_dir_all(storage.join("avatars")).unwrap();
        std::fs::write(storage.join("avatars/orphan.png"), b"x").unwrap();
        std::fs::write(storage.join("avatars/kept.png"), b"x").unwrap();

        seed_user(&pool, "u", 0, true).await;
        sqlx::query("UPDATE users SET avatar_path = 'avatars/kept.png' WHERE id = 'u'")
            .execute(&pool)
            .await
            .unwrap();

        let svc = service(pool, storage);

        let orphans = svc.find_orphaned_files().await.unwrap();
        assert_eq!(orphans, vec![PathBuf::from("avatars/orphan.png")]);

        assert_eq!(svc.delete_orphaned_files().await.unwrap(), 1);
        assert!(svc.find_orphaned_files().await.unwrap().is_empty());
        assert!(storage.join("avatars/kept.png").exists());
    }

    #[tokio::test]
    async fn unverified_warning_batch_is_idempotent() {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();

        seed_user(&pool, "old-unverified", 8, false).await;
        seed_user(&pool, "fresh-unverified", 1, false).await;
        seed_user(&pool, "old-verified", 8, true).await;

        let svc = service(pool, dir.path());

        assert_eq!(svc.warn_unverified_users().await.unwrap(), 1);
        // The stamped user is not selected again.
        assert_eq!(svc.warn_unverified_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unverified_users_past_the_deletion_threshold_are_removed() {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();

        seed_user(&pool, "doomed", 15, false).await;
        seed_user(&pool, "warned-but-young", 8, false).await;
        seed_user(&pool, "verified", 20, true).await;

        let svc = service(pool.clone(), dir.path());
        assert_eq!(svc.delete_unverified_users().await.unwrap(), 1);

        let remaining = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn soft_deleted_projects_are_purged_after_the_window() {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();

        let old = (Utc::now() - chrono::Duration::days(15)).to_rfc3339();
        let recent = (Utc::now() - chrono::Duration::days(2)).to_rfc3339();
        for (id, deleted_at) in [("gone", Some(&old)), ("kept", Some(&recent)), ("live", None)] {
            sqlx::query(
                "INSERT INTO projects (id, slug, name, approval_status, deleted_at, created_at, updated_at) \
                 VALUES (?, ?, ?, 'approved', ?, ?, ?)",
            )
            .bind(id)
            .bind(id)
            .bind(id)
            .bind(deleted_at)
            .bind(now_str())
            .bind(now_str())
            .execute(&pool)
            .await
            .unwrap();
        }

        std::fs::create_dir_all(dir.path().join("versions/gone")).unwrap();
        std::fs::write(dir.path().join("versions/gone/a.zip"), b"x").unwrap();

        let svc = service(pool.clone(), dir.path());
        assert_eq!(svc.purge_deleted_projects().await.unwrap(), 1);

        assert!(!dir.path().join("versions/gone").exists());
        let remaining = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 2);
    }
}
