use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::{
    config::Config,
    error::{AppError, Result},
    middleware::auth::AuthUser,
};

/// Stateless checks of current usage against configured ceilings. Every
/// check passes unconditionally for admins. A check fails when usage after
/// the pending operation would exceed the ceiling.
pub struct QuotaChecker<'a> {
    config: &'a Config,
}

impl<'a> QuotaChecker<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Number of not-yet-moderated projects a user may have at once.
    pub async fn ensure_can_create_project(&self, pool: &SqlitePool, user: &AuthUser) -> Result<()> {
        if user.is_admin() {
            return Ok(());
        }

        let pending = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM projects p \
             JOIN memberships m ON m.project_id = p.id \
             WHERE m.user_id = ? AND m.status = 'active' AND m.is_primary = 1 \
               AND p.approval_status = 'pending' AND p.deleted_at IS NULL",
        )
        .bind(&user.id)
        .fetch_one(pool)
        .await?;

        if pending + 1 > self.config.max_pending_projects {
            return Err(AppError::QuotaExceeded(format!(
                "you already have {pending} projects awaiting approval (limit {})",
                self.config.max_pending_projects
            )));
        }

        Ok(())
    }

    /// All limits that apply to a version upload: file count, per-file size,
    /// versions created for the project in the trailing 24 hours, and the
    /// per-project and per-user storage ceilings.
    pub async fn ensure_can_upload_version(
        &self,
        pool: &SqlitePool,
        user: &AuthUser,
        project_id: &str,
        file_sizes: &[i64],
    ) -> Result<()> {
        if user.is_admin() {
            return Ok(());
        }

        if file_sizes.len() as i64 > self.config.max_files_per_version {
            return Err(AppError::QuotaExceeded(format!(
                "a version may contain at most {} files",
                self.config.max_files_per_version
            )));
        }

        for &size in file_sizes {
            if size > self.config.max_file_size_bytes {
                return Err(AppError::QuotaExceeded(format!(
                    "files may be at most {} bytes",
                    self.config.max_file_size_bytes
                )));
            }
        }

        let since = (Utc::now() - Duration::hours(24)).to_rfc3339();
        let recent = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM project_versions WHERE project_id = ? AND created_at > ?",
        )
        .bind(project_id)
        .bind(since)
        .fetch_one(pool)
        .await?;

        if recent + 1 > self.config.max_versions_per_day {
            return Err(AppError::QuotaExceeded(format!(
                "at most {} versions may be published per day",
                self.config.max_versions_per_day
            )));
        }

        let incoming: i64 = file_sizes.iter().sum();

        let project_bytes = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(f.size_bytes), 0) FROM version_files f \
             JOIN project_versions v ON v.id = f.version_id \
             WHERE v.project_id = ?",
        )
        .bind(project_id)
        .fetch_one(pool)
        .await?;

        if project_bytes + incoming > self.config.max_project_storage_bytes {
            return Err(AppError::QuotaExceeded(format!(
                "project storage limit of {} bytes exceeded",
                self.config.max_project_storage_bytes
            )));
        }

        // A user's storage footprint is the sum over projects they own.
        let user_bytes = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(f.size_bytes), 0) FROM version_files f \
             JOIN project_versions v ON v.id = f.version_id \
             JOIN memberships m ON m.project_id = v.project_id \
             WHERE m.user_id = ? AND m.status = 'active' AND m.is_primary = 1",
        )
        .bind(&user.id)
        .fetch_one(pool)
        .await?;

        if user_bytes + incoming > self.config.max_total_storage_bytes {
            return Err(AppError::QuotaExceeded(format!(
                "account storage limit of {} bytes exceeded",
                self.config.max_total_storage_bytes
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{models::Role, now_str};
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

    fn auth(id: &str, role: Role) -> AuthUser {
        AuthUser {
            id: id.to_string(),
            name: id.to_string(),
            email: format!("{id}@example.com"),
            role,
            email_verified: true,
        }
    }

    async fn seed_owned_project(pool: &SqlitePool, id: &str, owner: &str, status: &str) {
        sqlx::query(
            "INSERT INTO projects (id, slug, name, approval_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(id)
        .bind(id)
        .bind(status)
        .bind(now_str())
        .bind(now_str())
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO memberships (id, project_id, user_id, status, role, is_primary, created_at) \
             VALUES (?, ?, ?, 'active', 'owner', 1, ?)",
        )
        .bind(format!("m-{id}"))
        .bind(id)
        .bind(owner)
        .bind(now_str())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn pending_project_ceiling_blocks_the_next_creation() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, created_at) \
             VALUES ('u', 'u', 'u@example.com', 'x', 'user', ?)",
        )
        .bind(now_str())
        .execute(&pool)
        .await
        .unwrap();

        let config = Config::for_tests(String::new());
        let quota = QuotaChecker::new(&config);
        let user = auth("u", Role::User);

        for i in 0..3 {
            seed_owned_project(&pool, &format!("p{i}"), "u", "pending").await;
        }

        let err = quota.ensure_can_create_project(&pool, &user).await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));

        // Approving one frees a slot.
        sqlx::query("UPDATE projects SET approval_status = 'approved' WHERE id = 'p0'")
            .execute(&pool)
            .await
            .unwrap();
        quota.ensure_can_create_project(&pool, &user).await.unwrap();
    }

    #[tokio::test]
    async fn admins_are_exempt_from_quotas() {
        let pool = test_pool().await;
        let config = Config::for_tests(String::new());
        let quota = QuotaChecker::new(&config);
        let admin = auth("root", Role::Admin);

        quota.ensure_can_create_project(&pool, &admin).await.unwrap();
        let huge = vec![config.max_file_size_bytes * 10; 100];
        quota
            .ensure_can_upload_version(&pool, &admin, "p", &huge)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn version_upload_limits_are_enforced() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, created_at) \
             VALUES ('u', 'u', 'u@example.com', 'x', 'user', ?)",
        )
        .bind(now_str())
        .execute(&pool)
        .await
        .unwrap();
        seed_owned_project(&pool, "p", "u", "approved").await;

        let config = Config::for_tests(String::new());
        let quota = QuotaChecker::new(&config);
        let user = auth("u", Role::User);

        // Too many files.
        let sizes = vec![1; (config.max_files_per_version + 1) as usize];
        assert!(matches!(
            quota.ensure_can_upload_version(&pool, &user, "p", &sizes).await,
            Err(AppError::QuotaExceeded(_))
        ));

        // One file over the per-file size limit.
        let sizes = vec![config.max_file_size_bytes + 1];
        assert!(matches!(
            quota.ensure_can_upload_version(&pool, &user, "p", &sizes).await,
            Err(AppError::QuotaExceeded(_))
        ));

        // Within limits.
        quota
            .ensure_can_upload_version(&pool, &user, "p", &[1024])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn daily_version_ceiling_counts_the_trailing_day() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, created_at) \
             VALUES ('u', 'u', 'u@example.com', 'x', 'user', ?)",
        )
        .bind(now_str())
        .execute(&pool)
        .await
        .unwrap();
        seed_owned_project(&pool, "p", "u", "approved").await;

        let config = Config::for_tests(String::new());
        for i in 0..config.max_versions_per_day {
            sqlx::query(
                "INSERT INTO project_versions \
                 (id, project_id, version, release_type, release_date, created_by, created_at) \
                 VALUES (?, 'p', ?, 'release', ?, 'u', ?)",
            )
            .bind(format!("v{i}"))
            .bind(format!("1.0.{i}"))
            .bind(now_str())
            .bind(now_str())
            .execute(&pool)
            .await
            .unwrap();
        }

        let quota = QuotaChecker::new(&config);
        let user = auth("u", Role::User);
        assert!(matches!(
            quota.ensure_can_upload_version(&pool, &user, "p", &[1]).await,
            Err(AppError::QuotaExceeded(_))
        ));
    }
}
