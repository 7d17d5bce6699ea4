use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::{
        models::{ProjectVersion, ReleaseType, VersionDependency, VersionFile},
        now_str,
    },
    error::{AppError, Result},
    middleware::auth::{AuthUser, OptionalAuthUser},
    policy::{self, ProjectAction},
    services::{quota::QuotaChecker, visibility},
    AppState,
};

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/:slug/versions", get(list_versions))
        .route("/:slug/versions/:version", get(get_version))
        .route("/:slug/versions/:version/files/:file_name", get(download_file))
}

pub fn protected_router() -> Router<AppState> {
    Router::new().route("/:slug/versions", post(upload_version))
}

#[derive(Debug, Deserialize)]
pub struct VersionListQuery {
    pub tag: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    #[serde(flatten)]
    pub version: ProjectVersion,
    pub files: Vec<VersionFile>,
    pub tags: Vec<String>,
    pub dependencies: Vec<VersionDependency>,
}

#[derive(Debug, Serialize)]
pub struct VersionListResponse {
    pub versions: Vec<VersionResponse>,
    pub page: i64,
    pub per_page: i64,
}

async fn version_details(state: &AppState, version: ProjectVersion) -> Result<VersionResponse> {
    let files = sqlx::query_as::<_, VersionFile>(
        "SELECT * FROM version_files WHERE version_id = ? ORDER BY name",
    )
    .bind(&version.id)
    .fetch_all(&state.db.pool)
    .await?;

    let tags = sqlx::query_scalar::<_, String>(
        "SELECT t.name FROM tags t \
         JOIN version_tags vt ON vt.tag_id = t.id \
         WHERE vt.version_id = ? ORDER BY t.name",
    )
    .bind(&version.id)
    .fetch_all(&state.db.pool)
    .await?;

    let dependencies = sqlx::query_as::<_, VersionDependency>(
        "SELECT * FROM version_dependencies WHERE version_id = ?",
    )
    .bind(&version.id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(VersionResponse { version, files, tags, dependencies })
}

async fn list_versions(
    State(state): State<AppState>,
    OptionalAuthUser(viewer): OptionalAuthUser,
    Path(slug): Path<String>,
    Query(query): Query<VersionListQuery>,
) -> Result<Json<VersionListResponse>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, viewer.as_ref(), &slug).await?;

    let sort = match query.sort.as_deref() {
        None | Some("release_date") => "v.release_date",
        Some("downloads") => "v.downloads",
        Some(other) => {
            return Err(AppError::Validation(format!("unknown sort field: {other}")));
        }
    };
    let order = match query.order.as_deref() {
        None | Some("desc") => "DESC",
        Some("asc") => "ASC",
        Some(other) => {
            return Err(AppError::Validation(format!("unknown sort order: {other}")));
        }
    };

    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);

    let mut sql = String::from(
        "SELECT DISTINCT v.* FROM project_versions v \
         LEFT JOIN version_tags vt ON vt.version_id = v.id \
         LEFT JOIN tags t ON t.id = vt.tag_id \
         WHERE v.project_id = ?",
    );
    if query.tag.is_some() {
        sql.push_str(" AND t.name = ?");
    }
    if query.from.is_some() {
        sql.push_str(" AND v.release_date >= ?");
    }
    if query.to.is_some() {
        sql.push_str(" AND v.release_date <= ?");
    }
    sql.push_str(&format!(" ORDER BY {sort} {order} LIMIT ? OFFSET ?"));

    let mut q = sqlx::query_as::<_, ProjectVersion>(&sql).bind(&project.id);
    if let Some(tag) = &query.tag {
        q = q.bind(tag);
    }
    if let Some(from) = &query.from {
        q = q.bind(from.to_rfc3339());
    }
    if let Some(to) = &query.to {
        q = q.bind(to.to_rfc3339());
    }

    let rows = q
        .bind(per_page)
        .bind((page - 1) * per_page)
        .fetch_all(&state.db.pool)
        .await?;

    let mut versions = Vec::with_capacity(rows.len());
    for row in rows {
        versions.push(version_details(&state, row).await?);
    }

    Ok(Json(VersionListResponse { versions, page, per_page }))
}

async fn version_by_string(
    state: &AppState,
    project_id: &str,
    version: &str,
) -> Result<ProjectVersion> {
    sqlx::query_as::<_, ProjectVersion>(
        "SELECT * FROM project_versions WHERE project_id = ? AND version = ?",
    )
    .bind(project_id)
    .bind(version)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Version not found".to_string()))
}

async fn get_version(
    State(state): State<AppState>,
    OptionalAuthUser(viewer): OptionalAuthUser,
    Path((slug, version)): Path<(String, String)>,
) -> Result<Json<VersionResponse>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, viewer.as_ref(), &slug).await?;
    let version = version_by_string(&state, &project.id, &version).await?;
    Ok(Json(version_details(&state, version).await?))
}

async fn download_file(
    State(state): State<AppState>,
    OptionalAuthUser(viewer): OptionalAuthUser,
    Path((slug, version, file_name)): Path<(String, String, String)>,
) -> Result<Response> {
    let project = visibility::visible_project_by_slug(&state.db.pool, viewer.as_ref(), &slug).await?;
    let version = version_by_string(&state, &project.id, &version).await?;

    let file = sqlx::query_as::<_, VersionFile>(
        "SELECT * FROM version_files WHERE version_id = ? AND name = ?",
    )
    .bind(&version.id)
    .bind(&file_name)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

    // In-place increment; a read-modify-write here would lose counts under
    // concurrent downloads.
    sqlx::query("UPDATE project_versions SET downloads = downloads + 1 WHERE id = ?")
        .bind(&version.id)
        .execute(&state.db.pool)
        .await?;

    let full = std::path::Path::new(&state.config.storage_path).join(&file.path);
    let contents = tokio::fs::read(&full)
        .await
        .map_err(|_| AppError::NotFound("File not found".to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.name),
        )
        .body(Body::from(contents))
        .map_err(|e| AppError::Internal(format!("failed to build response: {e}")))
}

/// One dependency entry of an uploaded version: either a reference to
/// another hosted project (by slug, optionally pinned to one of its version
/// strings) or an external name/version pair. Exactly one of the two forms.
#[derive(Debug, Deserialize)]
pub struct DependencySpec {
    pub project: Option<String>,
    pub project_version: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
}

struct UploadFields {
    version: String,
    release_type: ReleaseType,
    changelog: String,
    tags: Vec<String>,
    dependencies: Vec<DependencySpec>,
    files: Vec<(String, Vec<u8>)>,
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadFields> {
    let mut fields = UploadFields {
        version: String::new(),
        release_type: ReleaseType::Release,
        changelog: String::new(),
        tags: Vec::new(),
        dependencies: Vec::new(),
        files: Vec::new(),
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "version" => {
                fields.version = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("bad field: {e}")))?;
            }
            "release_type" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("bad field: {e}")))?;
                fields.release_type = ReleaseType::parse(&text).ok_or_else(|| {
                    AppError::Validation(format!("unknown release type: {text}"))
                })?;
            }
            "changelog" => {
                fields.changelog = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("bad field: {e}")))?;
            }
            "tags" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("bad field: {e}")))?;
                fields.tags = text.split(',').map(|t| t.trim().to_string()).collect();
            }
            "dependencies" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("bad field: {e}")))?;
                fields.dependencies = serde_json::from_str(&text).map_err(|e| {
                    AppError::Validation(format!("invalid dependencies payload: {e}"))
                })?;
            }
            "files" => {
                let file_name = field
                    .file_name()
                    .map(|n| n.to_string())
                    .ok_or_else(|| AppError::Validation("file parts need a filename".to_string()))?;
                if file_name.contains('/') || file_name.contains("..") {
                    return Err(AppError::Validation(format!("invalid file name: {file_name}")));
                }
                if fields.files.iter().any(|(existing, _)| existing == &file_name) {
                    return Err(AppError::Validation(format!(
                        "duplicate file name: {file_name}"
                    )));
                }
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("failed to read upload: {e}")))?;
                fields.files.push((file_name, data.to_vec()));
            }
            other => {
                return Err(AppError::Validation(format!("unexpected field: {other}")));
            }
        }
    }

    if fields.version.trim().is_empty() {
        return Err(AppError::Validation("a version string is required".to_string()));
    }
    if fields.files.is_empty() {
        return Err(AppError::Validation("a version needs at least one file".to_string()));
    }

    Ok(fields)
}

async fn upload_version(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
    multipart: Multipart,
) -> Result<Json<VersionResponse>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, Some(&user), &slug).await?;

    let m = policy::membership_for(&state.db.pool, &project.id, &user.id).await?;
    policy::check(&user, ProjectAction::UploadVersion, m)?;

    let fields = read_upload(multipart).await?;

    let duplicate = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM project_versions WHERE project_id = ? AND version = ?",
    )
    .bind(&project.id)
    .bind(fields.version.trim())
    .fetch_one(&state.db.pool)
    .await?;
    if duplicate > 0 {
        return Err(AppError::Validation(format!(
            "version {} already exists",
            fields.version.trim()
        )));
    }

    let sizes: Vec<i64> = fields.files.iter().map(|(_, data)| data.len() as i64).collect();
    QuotaChecker::new(&state.config)
        .ensure_can_upload_version(&state.db.pool, &user, &project.id, &sizes)
        .await?;

    let resolved = resolve_dependencies(&state, &fields.dependencies).await?;

    let version_id = Uuid::new_v4().to_string();
    let now = now_str();

    // Files land on disk before any row exists; a failed write leaves only
    // unreferenced files for the orphan sweep to collect, never a half
    // published version.
    let dir = std::path::Path::new(&state.config.storage_path)
        .join("versions")
        .join(&project.id)
        .join(&version_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| AppError::Internal(format!("failed to create version directory: {e}")))?;

    for (file_name, data) in &fields.files {
        tokio::fs::write(dir.join(file_name), data)
            .await
            .map_err(|e| AppError::Internal(format!("failed to store file: {e}")))?;
    }

    // Version, files, dependencies, and tags commit together.
    let mut tx = state.db.pool.begin().await?;

    sqlx::query(
        "INSERT INTO project_versions \
         (id, project_id, version, release_type, release_date, changelog, created_by, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&version_id)
    .bind(&project.id)
    .bind(fields.version.trim())
    .bind(fields.release_type)
    .bind(&now)
    .bind(&fields.changelog)
    .bind(&user.id)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    for (file_name, data) in &fields.files {
        let rel_path = format!("versions/{}/{}/{}", project.id, version_id, file_name);
        sqlx::query(
            "INSERT INTO version_files (id, version_id, name, path, size_bytes, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&version_id)
        .bind(file_name)
        .bind(&rel_path)
        .bind(data.len() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    for dep in resolved {
        sqlx::query(
            "INSERT INTO version_dependencies \
             (id, version_id, dependency_project_id, dependency_version_id, dependency_name, dependency_version) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&version_id)
        .bind(dep.0)
        .bind(dep.1)
        .bind(dep.2)
        .bind(dep.3)
        .execute(&mut *tx)
        .await?;
    }

    for tag in &fields.tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        sqlx::query("INSERT OR IGNORE INTO tags (id, name) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&tag)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO version_tags (version_id, tag_id) \
             SELECT ?, id FROM tags WHERE name = ?",
        )
        .bind(&version_id)
        .bind(&tag)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE projects SET updated_at = ? WHERE id = ?")
        .bind(&now)
        .bind(&project.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(project = slug, version = fields.version, "version published");

    let version = version_by_string(&state, &project.id, fields.version.trim()).await?;
    Ok(Json(version_details(&state, version).await?))
}

type ResolvedDependency = (Option<String>, Option<String>, Option<String>, Option<String>);

/// Validate the internal-xor-external rule and resolve project slugs to ids.
async fn resolve_dependencies(
    state: &AppState,
    specs: &[DependencySpec],
) -> Result<Vec<ResolvedDependency>> {
    let mut resolved = Vec::with_capacity(specs.len());

    for spec in specs {
        let external = spec.name.is_some() || spec.version.is_some();
        let internal = spec.project.is_some() || spec.project_version.is_some();

        if external == internal {
            return Err(AppError::Validation(
                "a dependency is either a hosted project or an external name/version pair"
                    .to_string(),
            ));
        }

        if external {
            let (Some(name), Some(version)) = (&spec.name, &spec.version) else {
                return Err(AppError::Validation(
                    "external dependencies need both a name and a version".to_string(),
                ));
            };
            resolved.push((None, None, Some(name.clone()), Some(version.clone())));
            continue;
        }

        let slug = spec.project.as_ref().ok_or_else(|| {
            AppError::Validation("a hosted dependency needs a project slug".to_string())
        })?;
        let project_id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM projects WHERE slug = ? AND deleted_at IS NULL",
        )
        .bind(slug)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dependency project not found: {slug}")))?;

        let version_id = match &spec.project_version {
            None => None,
            Some(v) => Some(
                sqlx::query_scalar::<_, String>(
                    "SELECT id FROM project_versions WHERE project_id = ? AND version = ?",
                )
                .bind(&project_id)
                .bind(v)
                .fetch_optional(&state.db.pool)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("dependency version not found: {slug} {v}"))
                })?,
            ),
        };

        resolved.push((Some(project_id), version_id, None, None));
    }

    Ok(resolved)
}
