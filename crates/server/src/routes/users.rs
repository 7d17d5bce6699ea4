use axum::{
    extract::{Multipart, Path, State},
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    db::models::{Project, User},
    error::{AppError, Result},
    middleware::auth::{AuthUser, OptionalAuthUser},
    services::visibility,
    AppState,
};

pub fn public_router() -> Router<AppState> {
    Router::new().route("/:name", get(get_user))
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/", get(me))
        .route("/avatar", put(upload_avatar))
}

#[derive(Debug, Serialize)]
pub struct PublicUserResponse {
    pub name: String,
    pub avatar_path: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub projects: Vec<Project>,
}

/// Public profile: the user plus the projects of theirs the viewer may see.
async fn get_user(
    State(state): State<AppState>,
    OptionalAuthUser(viewer): OptionalAuthUser,
    Path(name): Path<String>,
) -> Result<Json<PublicUserResponse>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE name = ? AND deactivated_at IS NULL",
    )
    .bind(&name)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    let vis = visibility::Visibility::for_viewer(viewer.as_ref());
    let sql = format!(
        "SELECT DISTINCT p.* FROM projects p \
         JOIN memberships m ON m.project_id = p.id \
         WHERE {} AND m.user_id = ? AND m.status = 'active' \
         ORDER BY p.updated_at DESC",
        vis.clause()
    );

    let mut q = sqlx::query_as::<_, Project>(&sql);
    if let Some(id) = vis.user_id() {
        q = q.bind(id.to_string());
    }
    let projects = q.bind(&user.id).fetch_all(&state.db.pool).await?;

    Ok(Json(PublicUserResponse {
        name: user.name,
        avatar_path: user.avatar_path,
        created_at: user.created_at,
        projects,
    }))
}

async fn me(State(state): State<AppState>, user: AuthUser) -> Result<Json<Value>> {
    let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&user.id)
        .fetch_one(&state.db.pool)
        .await?;

    Ok(Json(json!({
        "id": row.id,
        "name": row.name,
        "email": row.email,
        "role": row.role,
        "email_verified": row.email_verified_at.is_some(),
        "avatar_path": row.avatar_path,
        "created_at": row.created_at,
    })))
}

async fn upload_avatar(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?
        .ok_or_else(|| AppError::Validation("an avatar file is required".to_string()))?;

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

    let rel_path = format!("avatars/{}.png", user.id);
    let full = std::path::Path::new(&state.config.storage_path).join(&rel_path);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Internal(format!("failed to create avatar directory: {e}")))?;
    }
    tokio::fs::write(&full, &data)
        .await
        .map_err(|e| AppError::Internal(format!("failed to store avatar: {e}")))?;

    sqlx::query("UPDATE users SET avatar_path = ? WHERE id = ?")
        .bind(&rel_path)
        .bind(&user.id)
        .execute(&state.db.pool)
        .await?;

    Ok(Json(json!({ "avatar_path": rel_path })))
}
