use axum::{
    extract::{Multipart, Path, Query, State},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    db::{
        models::{ApprovalStatus, Membership, MembershipStatus, Project},
        now_str,
    },
    error::{AppError, Result},
    middleware::auth::{AuthUser, OptionalAuthUser},
    policy::{self, ProjectAction},
    services::{membership, quota::QuotaChecker, slug, visibility},
    AppState,
};

/// Routes reachable without authentication; the viewer is optional and the
/// visibility scope narrows what each viewer sees.
pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects))
        .route("/:slug", get(get_project))
        .route("/:slug/tags", get(list_project_tags))
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_project))
        .route("/:slug", axum::routing::patch(update_project).delete(delete_project))
        .route("/:slug/logo", put(upload_logo))
        .route("/:slug/members", get(list_members).post(invite_member))
}

/// Membership state-machine endpoints, keyed by membership id.
pub fn members_router() -> Router<AppState> {
    Router::new()
        .route("/:id/accept", post(accept_membership))
        .route("/:id/reject", post(reject_membership))
        .route("/:id/primary", post(set_primary_membership))
        .route("/:id", delete(delete_membership))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub q: Option<String>,
    pub tag: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ProjectListResponse {
    pub projects: Vec<Project>,
    pub page: i64,
    pub per_page: i64,
}

fn page_bounds(query: &ListQuery) -> (i64, i64) {
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);
    (page, per_page)
}

async fn list_projects(
    State(state): State<AppState>,
    OptionalAuthUser(viewer): OptionalAuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ProjectListResponse>> {
    let vis = visibility::Visibility::for_viewer(viewer.as_ref());
    let (page, per_page) = page_bounds(&query);

    let mut sql = format!(
        "SELECT DISTINCT p.* FROM projects p \
         LEFT JOIN project_tags pt ON pt.project_id = p.id \
         LEFT JOIN tags t ON t.id = pt.tag_id \
         WHERE {}",
        vis.clause()
    );
    if query.q.is_some() {
        sql.push_str(" AND (p.name LIKE ? OR p.summary LIKE ?)");
    }
    if query.tag.is_some() {
        sql.push_str(" AND t.name = ?");
    }
    sql.push_str(" ORDER BY p.updated_at DESC LIMIT ? OFFSET ?");

    let mut q = sqlx::query_as::<_, Project>(&sql);
    if let Some(id) = vis.user_id() {
        q = q.bind(id.to_string());
    }
    if let Some(search) = &query.q {
        let like = format!("%{search}%");
        q = q.bind(like.clone()).bind(like);
    }
    if let Some(tag) = &query.tag {
        q = q.bind(tag);
    }

    let projects = q
        .bind(per_page)
        .bind((page - 1) * per_page)
        .fetch_all(&state.db.pool)
        .await?;

    Ok(Json(ProjectListResponse { projects, page, per_page }))
}

async fn get_project(
    State(state): State<AppState>,
    OptionalAuthUser(viewer): OptionalAuthUser,
    Path(slug): Path<String>,
) -> Result<Json<Project>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, viewer.as_ref(), &slug).await?;
    Ok(Json(project))
}

async fn list_project_tags(
    State(state): State<AppState>,
    OptionalAuthUser(viewer): OptionalAuthUser,
    Path(slug): Path<String>,
) -> Result<Json<Value>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, viewer.as_ref(), &slug).await?;

    let tags = sqlx::query_scalar::<_, String>(
        "SELECT t.name FROM tags t \
         JOIN project_tags pt ON pt.tag_id = t.id \
         WHERE pt.project_id = ? ORDER BY t.name",
    )
    .bind(&project.id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(json!({ "tags": tags })))
}

/// All known tags, for `/api/tags`.
pub async fn list_tags(State(state): State<AppState>) -> Result<Json<Value>> {
    let tags = sqlx::query_scalar::<_, String>("SELECT name FROM tags ORDER BY name")
        .fetch_all(&state.db.pool)
        .await?;
    Ok(Json(json!({ "tags": tags })))
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

async fn create_project(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateProjectRequest>,
) -> Result<Json<Project>> {
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("Project name is required".to_string()));
    }

    policy::check(&user, ProjectAction::Create, None)?;
    QuotaChecker::new(&state.config)
        .ensure_can_create_project(&state.db.pool, &user)
        .await?;

    let project_id = Uuid::new_v4().to_string();
    let project_slug = slug::unique_slug(&state.db.pool, &body.name).await?;
    let status = if state.config.auto_approve_projects {
        ApprovalStatus::Approved
    } else {
        ApprovalStatus::Pending
    };
    let now = now_str();

    sqlx::query(
        "INSERT INTO projects (id, slug, name, summary, approval_status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&project_id)
    .bind(&project_slug)
    .bind(body.name.trim())
    .bind(&body.summary)
    .bind(status)
    .bind(&now)
    .bind(&now)
    .execute(&state.db.pool)
    .await?;

    membership::bootstrap_owner(&state.db.pool, &project_id, &user.id).await?;
    replace_tags(&state, &project_id, &body.tags).await?;

    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(&project_id)
        .fetch_one(&state.db.pool)
        .await?;

    tracing::info!(project = project_slug, user = user.id, "project created");

    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
}

async fn update_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
    Json(body): Json<UpdateProjectRequest>,
) -> Result<Json<Project>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, Some(&user), &slug).await?;

    let m = policy::membership_for(&state.db.pool, &project.id, &user.id).await?;
    policy::check(&user, ProjectAction::Update, m)?;

    let name = body.name.unwrap_or(project.name);
    if name.trim().is_empty() {
        return Err(AppError::Validation("Project name is required".to_string()));
    }
    let summary = body.summary.unwrap_or(project.summary);

    sqlx::query("UPDATE projects SET name = ?, summary = ?, updated_at = ? WHERE id = ?")
        .bind(name.trim())
        .bind(&summary)
        .bind(now_str())
        .bind(&project.id)
        .execute(&state.db.pool)
        .await?;

    if let Some(tags) = &body.tags {
        replace_tags(&state, &project.id, tags).await?;
    }

    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(&project.id)
        .fetch_one(&state.db.pool)
        .await?;

    Ok(Json(project))
}

/// Soft delete; the cleanup job purges the row and its files after the
/// configured window.
async fn delete_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
) -> Result<Json<Value>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, Some(&user), &slug).await?;

    let m = policy::membership_for(&state.db.pool, &project.id, &user.id).await?;
    policy::check(&user, ProjectAction::Delete, m)?;

    sqlx::query("UPDATE projects SET deleted_at = ? WHERE id = ?")
        .bind(now_str())
        .bind(&project.id)
        .execute(&state.db.pool)
        .await?;

    tracing::info!(project = slug, user = user.id, "project soft-deleted");

    Ok(Json(json!({ "message": "project deleted" })))
}

async fn upload_logo(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Project>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, Some(&user), &slug).await?;

    let m = policy::membership_for(&state.db.pool, &project.id, &user.id).await?;
    policy::check(&user, ProjectAction::Update, m)?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?
        .ok_or_else(|| AppError::Validation("a logo file is required".to_string()))?;

    let data = field
        .bytes()
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read upload: {e}")))?;

    if data.len() as i64 > state.config.max_file_size_bytes && !user.is_admin() {
        return Err(AppError::QuotaExceeded(format!(
            "files may be at most {} bytes",
            state.config.max_file_size_bytes
        )));
    }

    let rel_path = format!("logos/{}.png", project.id);
    let full = std::path::Path::new(&state.config.storage_path).join(&rel_path);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Internal(format!("failed to create logo directory: {e}")))?;
    }
    tokio::fs::write(&full, &data)
        .await
        .map_err(|e| AppError::Internal(format!("failed to store logo: {e}")))?;

    sqlx::query("UPDATE projects SET logo_path = ?, updated_at = ? WHERE id = ?")
        .bind(&rel_path)
        .bind(now_str())
        .bind(&project.id)
        .execute(&state.db.pool)
        .await?;

    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(&project.id)
        .fetch_one(&state.db.pool)
        .await?;

    Ok(Json(project))
}

async fn replace_tags(state: &AppState, project_id: &str, tags: &[String]) -> Result<()> {
    sqlx::query("DELETE FROM project_tags WHERE project_id = ?")
        .bind(project_id)
        .execute(&state.db.pool)
        .await?;

    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        sqlx::query("INSERT OR IGNORE INTO tags (id, name) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&tag)
            .execute(&state.db.pool)
            .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO project_tags (project_id, tag_id) \
             SELECT ?, id FROM tags WHERE name = ?",
        )
        .bind(project_id)
        .bind(&tag)
        .execute(&state.db.pool)
        .await?;
    }

    Ok(())
}

// --- membership endpoints

#[derive(Debug, Serialize)]
pub struct MemberResponse {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub status: MembershipStatus,
    pub role: String,
    pub is_primary: bool,
}

#[derive(Debug, Serialize)]
pub struct MemberListResponse {
    pub members: Vec<MemberResponse>,
}

async fn list_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
) -> Result<Json<MemberListResponse>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, Some(&user), &slug).await?;

    let rows = sqlx::query_as::<_, (String, String, String, MembershipStatus, String, bool)>(
        "SELECT m.id, m.user_id, u.name, m.status, m.role, m.is_primary \
         FROM memberships m JOIN users u ON u.id = m.user_id \
         WHERE m.project_id = ? ORDER BY m.is_primary DESC, u.name ASC",
    )
    .bind(&project.id)
    .fetch_all(&state.db.pool)
    .await?;

    let members = rows
        .into_iter()
        .map(|(id, user_id, user_name, status, role, is_primary)| MemberResponse {
            id,
            user_id,
            user_name,
            status,
            role,
            is_primary,
        })
        .collect();

    Ok(Json(MemberListResponse { members }))
}

#[derive(Debug, Deserialize)]
pub struct InviteMemberRequest {
    pub user_name: String,
    #[serde(default)]
    pub role: String,
}

async fn invite_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
    Json(body): Json<InviteMemberRequest>,
) -> Result<Json<Membership>> {
    let project = visibility::visible_project_by_slug(&state.db.pool, Some(&user), &slug).await?;

    let target = sqlx::query_as::<_, (String, String)>(
        "SELECT id, email FROM users WHERE name = ? AND deactivated_at IS NULL",
    )
    .bind(&body.user_name)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    let (target_id, target_email) = target;
    if target_id == user.id {
        return Err(AppError::Validation(
            "Cannot invite yourself".to_string(),
        ));
    }

    let invited =
        membership::invite(&state.db.pool, &user, &project.id, &target_id, &body.role).await?;

    if let Err(e) = state.mailer.send_member_invitation(&target_email, &project.name).await {
        tracing::warn!(user = target_id, "failed to send invitation mail: {e}");
    }

    Ok(Json(invited))
}

async fn accept_membership(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Membership>> {
    let m = membership::accept(&state.db.pool, &user, &id).await?;
    Ok(Json(m))
}

async fn reject_membership(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Membership>> {
    let m = membership::reject(&state.db.pool, &user, &id).await?;
    Ok(Json(m))
}

async fn delete_membership(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    membership::delete(&state.db.pool, &user, &id).await?;
    Ok(Json(json!({ "message": "membership removed" })))
}

async fn set_primary_membership(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    membership::set_primary(&state.db.pool, &user, &id).await?;
    Ok(Json(json!({ "message": "primary member updated" })))
}
