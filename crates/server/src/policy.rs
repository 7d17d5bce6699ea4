use sqlx::SqlitePool;

use crate::{
    db::models::MembershipStatus,
    error::{AppError, Result},
    middleware::auth::AuthUser,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectAction {
    Create,
    View,
    Update,
    Delete,
    AddMember,
    ManageMembers,
    UploadVersion,
    EditVersion,
}

/// The caller's standing within a project, as read from the memberships
/// table. `None` means no membership row at all.
#[derive(Debug, Clone, Copy)]
pub struct MembershipState {
    pub status: MembershipStatus,
    pub is_primary: bool,
}

impl MembershipState {
    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }

    pub fn is_active_primary(&self) -> bool {
        self.is_active() && self.is_primary
    }
}

/// Capability predicate, admin bypass excluded. Use [`check`] at call sites.
pub fn allows(user: &AuthUser, action: ProjectAction, membership: Option<MembershipState>) -> bool {
    let active = membership.map(|m| m.is_active()).unwrap_or(false);
    let active_primary = membership.map(|m| m.is_active_primary()).unwrap_or(false);

    match action {
        ProjectAction::Create => user.email_verified,
        ProjectAction::View => true,
        ProjectAction::Update => active,
        ProjectAction::Delete => active_primary,
        ProjectAction::AddMember | ProjectAction::ManageMembers => active_primary,
        ProjectAction::UploadVersion | ProjectAction::EditVersion => active,
    }
}

/// Policy dispatcher. Admins pass every check unconditionally; everyone else
/// goes through [`allows`].
pub fn check(
    user: &AuthUser,
    action: ProjectAction,
    membership: Option<MembershipState>,
) -> Result<()> {
    if user.is_admin() {
        return Ok(());
    }

    if allows(user, action, membership) {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "you are not allowed to perform this action".to_string(),
        ))
    }
}

/// Fetch the caller's membership state for a project, if any.
pub async fn membership_for(
    pool: &SqlitePool,
    project_id: &str,
    user_id: &str,
) -> Result<Option<MembershipState>> {
    let row = sqlx::query_as::<_, (MembershipStatus, bool)>(
        "SELECT status, is_primary FROM memberships WHERE project_id = ? AND user_id = ?",
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(status, is_primary)| MembershipState { status, is_primary }))
}
