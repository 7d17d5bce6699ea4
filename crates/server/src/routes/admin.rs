use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    db::{
        models::{ApprovalStatus, Project},
        now_str,
    },
    error::{AppError, Result},
    middleware::auth::AuthUser,
    AppState,
};

/// Moderation surface. Sits behind the auth middleware; every handler
/// additionally requires the admin role.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects))
        .route("/projects/:slug/approve", post(approve_project))
        .route("/projects/:slug/reject", post(reject_project))
        .route("/projects/:slug/deactivate", post(deactivate_project))
        .route("/projects/:slug/reactivate", post(reactivate_project))
        .route("/users/:name/deactivate", post(deactivate_user))
        .route("/users/:name/reactivate", post(reactivate_user))
}

fn require_admin(user: &AuthUser) -> Result<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden("admin access required".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct ModerationQuery {
    pub status: Option<String>,
}

async fn list_projects(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ModerationQuery>,
) -> Result<Json<Value>> {
    require_admin(&user)?;

    let status = match query.status.as_deref() {
        None => ApprovalStatus::Pending,
        Some(s) => ApprovalStatus::parse(s)
            .ok_or_else(|| AppError::Validation(format!("unknown status: {s}")))?,
    };

    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE approval_status = ? ORDER BY created_at ASC",
    )
    .bind(status)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(json!({ "projects": projects })))
}

async fn moderate(
    state: &AppState,
    user: &AuthUser,
    slug: &str,
    status: ApprovalStatus,
) -> Result<Json<Value>> {
    require_admin(user)?;

    let updated = sqlx::query(
        "UPDATE projects SET approval_status = ?, updated_at = ? WHERE slug = ? AND deleted_at IS NULL",
    )
    .bind(status)
    .bind(now_str())
    .bind(slug)
    .execute(&state.db.pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("Project not found".to_string()));
    }

    tracing::info!(project = slug, status = status.as_str(), admin = user.id, "project moderated");

    Ok(Json(json!({ "message": format!("project {}", status.as_str()) })))
}

async fn approve_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
) -> Result<Json<Value>> {
    moderate(&state, &user, &slug, ApprovalStatus::Approved).await
}

async fn reject_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
) -> Result<Json<Value>> {
    moderate(&state, &user, &slug, ApprovalStatus::Rejected).await
}

async fn set_project_deactivation(
    state: &AppState,
    user: &AuthUser,
    slug: &str,
    deactivated: bool,
) -> Result<Json<Value>> {
    require_admin(user)?;

    let stamp: Option<String> = deactivated.then(now_str);
    let updated = sqlx::query("UPDATE projects SET deactivated_at = ? WHERE slug = ?")
        .bind(stamp)
        .bind(slug)
        .execute(&state.db.pool)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("Project not found".to_string()));
    }

    Ok(Json(json!({
        "message": if deactivated { "project deactivated" } else { "project reactivated" }
    })))
}

async fn deactivate_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
) -> Result<Json<Value>> {
    set_project_deactivation(&state, &user, &slug, true).await
}

async fn reactivate_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(slug): Path<String>,
) -> Result<Json<Value>> {
    set_project_deactivation(&state, &user, &slug, false).await
}

async fn set_user_deactivation(
    state: &AppState,
    user: &AuthUser,
    name: &str,
    deactivated: bool,
) -> Result<Json<Value>> {
    require_admin(user)?;

    let stamp: Option<String> = deactivated.then(now_str);
    let updated = sqlx::query("UPDATE users SET deactivated_at = ? WHERE name = ?")
        .bind(stamp)
        .bind(name)
        .execute(&state.db.pool)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("User not found".to_string()));
    }

    Ok(Json(json!({
        "message": if deactivated { "user deactivated" } else { "user reactivated" }
    })))
}

async fn deactivate_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    set_user_deactivation(&state, &user, &name, true).await
}

async fn reactivate_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    set_user_deactivation(&state, &user, &name, false).await
}
