use sqlx::SqlitePool;

use crate::{
    db::models::{ApprovalStatus, Project},
    error::{AppError, Result},
    middleware::auth::AuthUser,
};

/// Visibility scope for project queries. Every listing and by-slug fetch
/// composes this into its WHERE clause; there is no implicit interception.
#[derive(Debug, Clone)]
pub enum Visibility {
    /// Admins: every project, including deactivated and soft-deleted ones.
    All,
    /// Authenticated non-admin: public projects plus any project where the
    /// viewer holds an active membership, in any approval status.
    Member(String),
    /// Guests: approved, not deactivated, not soft-deleted.
    Public,
}

impl Visibility {
    pub fn for_viewer(viewer: Option<&AuthUser>) -> Self {
        match viewer {
            Some(user) if user.is_admin() => Visibility::All,
            Some(user) => Visibility::Member(user.id.clone()),
            None => Visibility::Public,
        }
    }

    /// SQL condition over a `projects` table aliased as `p`. The `Member`
    /// variant carries exactly one positional bind (the viewer id), which
    /// must be the first bind of the query; see [`Visibility::user_id`].
    pub fn clause(&self) -> &'static str {
        match self {
            Visibility::All => "1 = 1",
            Visibility::Member(_) => {
                "((p.approval_status = 'approved' AND p.deactivated_at IS NULL) \
                 OR EXISTS (SELECT 1 FROM memberships vm \
                            WHERE vm.project_id = p.id AND vm.user_id = ? \
                              AND vm.status = 'active')) \
                 AND p.deleted_at IS NULL"
            }
            Visibility::Public => {
                "p.approval_status = 'approved' \
                 AND p.deactivated_at IS NULL AND p.deleted_at IS NULL"
            }
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Visibility::Member(id) => Some(id),
            _ => None,
        }
    }
}

/// Pure form of the scope, used where the project row is already loaded.
pub fn can_view(viewer: Option<&AuthUser>, status: ApprovalStatus, is_active_member: bool) -> bool {
    if let Some(user) = viewer {
        if user.is_admin() {
            return true;
        }
    }
    if viewer.is_some() && is_active_member {
        return true;
    }
    matches!(status, ApprovalStatus::Approved)
}

/// Fetch a project by slug with the visibility constraint applied inside the
/// query. A project the viewer may not see is a plain 404.
pub async fn visible_project_by_slug(
    pool: &SqlitePool,
    viewer: Option<&AuthUser>,
    slug: &str,
) -> Result<Project> {
    let vis = Visibility::for_viewer(viewer);
    let sql = format!("SELECT p.* FROM projects p WHERE {} AND p.slug = ?", vis.clause());

    let mut query = sqlx::query_as::<_, Project>(&sql);
    if let Some(id) = vis.user_id() {
        query = query.bind(id.to_string());
    }

    query
        .bind(slug)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Project not found".to_string()))
}
