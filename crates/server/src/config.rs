use std::env;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub storage_path: String,
    pub jwt_secret: String,
    pub public_url: String,

    /// New projects skip moderation and go straight to `approved`.
    pub auto_approve_projects: bool,

    // Quota ceilings. All enforced per user or per project, admins exempt.
    pub max_pending_projects: i64,
    pub max_total_storage_bytes: i64,
    pub max_project_storage_bytes: i64,
    pub max_versions_per_day: i64,
    pub max_file_size_bytes: i64,
    pub max_files_per_version: i64,

    // Cleanup thresholds (days).
    pub unverified_warning_days: i64,
    pub unverified_deletion_days: i64,
    pub project_purge_days: i64,
    pub cleanup_interval_secs: u64,

    // Email/password change links.
    pub change_token_ttl_minutes: i64,

    // SMTP; mail is disabled when no host is configured.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub mail_from: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_or("PORT", 3000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./data/modvault.db?mode=rwc".to_string()),
            storage_path: env::var("STORAGE_PATH")
                .unwrap_or_else(|_| "./data/storage".to_string()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "development-secret-change-in-production".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            auto_approve_projects: env_or("AUTO_APPROVE_PROJECTS", false),
            max_pending_projects: env_or("MAX_PENDING_PROJECTS", 3),
            max_total_storage_bytes: env_or("MAX_TOTAL_STORAGE_BYTES", 1024 * 1024 * 1024),
            max_project_storage_bytes: env_or("MAX_PROJECT_STORAGE_BYTES", 256 * 1024 * 1024),
            max_versions_per_day: env_or("MAX_VERSIONS_PER_DAY", 10),
            max_file_size_bytes: env_or("MAX_FILE_SIZE_BYTES", 64 * 1024 * 1024),
            max_files_per_version: env_or("MAX_FILES_PER_VERSION", 10),
            unverified_warning_days: env_or("UNVERIFIED_WARNING_DAYS", 7),
            unverified_deletion_days: env_or("UNVERIFIED_DELETION_DAYS", 14),
            project_purge_days: env_or("PROJECT_PURGE_DAYS", 14),
            cleanup_interval_secs: env_or("CLEANUP_INTERVAL_SECS", 3600),
            change_token_ttl_minutes: env_or("CHANGE_TOKEN_TTL_MINUTES", 60),
            smtp_host: env::var("SMTP_HOST").ok(),
            smtp_port: env_or("SMTP_PORT", 587),
            smtp_username: env::var("SMTP_USERNAME").ok(),
            smtp_password: env::var("SMTP_PASSWORD").ok(),
            mail_from: env::var("MAIL_FROM")
                .unwrap_or_else(|_| "Modvault <noreply@modvault.local>".to_string()),
        }
    }

    #[cfg(test)]
    pub fn for_tests(storage_path: String) -> Self {
        Self {
            port: 0,
            database_url: "sqlite::memory:".to_string(),
            storage_path,
            jwt_secret: "test-secret".to_string(),
            public_url: "http://localhost".to_string(),
            auto_approve_projects: false,
            max_pending_projects: 3,
            max_total_storage_bytes: 1024 * 1024,
            max_project_storage_bytes: 512 * 1024,
            max_versions_per_day: 5,
            max_file_size_bytes: 128 * 1024,
            max_files_per_version: 3,
            unverified_warning_days: 7,
            unverified_deletion_days: 14,
            project_purge_days: 14,
            cleanup_interval_secs: 3600,
            change_token_ttl_minutes: 60,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            mail_from: "Modvault <noreply@modvault.local>".to_string(),
        }
    }
}
