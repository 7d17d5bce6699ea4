use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::{models::Membership, models::MembershipStatus, now_str},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    policy::{self, ProjectAction},
};

async fn membership_by_id(pool: &SqlitePool, id: &str) -> Result<Membership> {
    sqlx::query_as::<_, Membership>("SELECT * FROM memberships WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Membership not found".to_string()))
}

/// Accept a pending invitation. Only the invited user may accept.
pub async fn accept(pool: &SqlitePool, actor: &AuthUser, membership_id: &str) -> Result<Membership> {
    transition(pool, actor, membership_id, MembershipStatus::Active).await
}

/// Reject a pending invitation. Only the invited user may reject.
pub async fn reject(pool: &SqlitePool, actor: &AuthUser, membership_id: &str) -> Result<Membership> {
    transition(pool, actor, membership_id, MembershipStatus::Rejected).await
}

async fn transition(
    pool: &SqlitePool,
    actor: &AuthUser,
    membership_id: &str,
    to: MembershipStatus,
) -> Result<Membership> {
    let membership = membership_by_id(pool, membership_id).await?;

    if membership.user_id != actor.id && !actor.is_admin() {
        return Err(AppError::Forbidden(
            "only the invited user can respond to an invitation".to_string(),
        ));
    }
    if membership.status != MembershipStatus::Pending {
        return Err(AppError::BadRequest(
            "this invitation has already been answered".to_string(),
        ));
    }

    sqlx::query("UPDATE memberships SET status = ? WHERE id = ?")
        .bind(to)
        .bind(membership_id)
        .execute(pool)
        .await?;

    Ok(Membership { status: to, ..membership })
}

/// Delete a membership. Allowed for the membership's own user or an active
/// primary member of the project; refused when the target is the project's
/// last active primary membership.
pub async fn delete(pool: &SqlitePool, actor: &AuthUser, membership_id: &str) -> Result<()> {
    let membership = membership_by_id(pool, membership_id).await?;

    if membership.user_id != actor.id && !actor.is_admin() {
        let actor_membership = policy::membership_for(pool, &membership.project_id, &actor.id).await?;
        policy::check(actor, ProjectAction::ManageMembers, actor_membership)?;
    }

    // The last-primary guard and the delete run as one conditional statement
    // inside a transaction, so two concurrent deletes cannot both pass the
    // count check and strand the project without an owner.
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query(
        "DELETE FROM memberships WHERE id = ? \
         AND (is_primary = 0 OR status != 'active' \
              OR (SELECT COUNT(*) FROM memberships m2 \
                  WHERE m2.project_id = ? AND m2.status = 'active' AND m2.is_primary = 1) > 1)",
    )
    .bind(membership_id)
    .bind(&membership.project_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    if deleted.rows_affected() == 0 {
        return Err(AppError::Forbidden(
            "cannot remove the last primary member of a project".to_string(),
        ));
    }

    Ok(())
}

/// Make the target membership the project's primary one. The target must be
/// active and not already primary; the actor must be an active primary member
/// of the same project. The previous primary is demoted in the same
/// transaction, so a project holds at most one primary membership.
pub async fn set_primary(pool: &SqlitePool, actor: &AuthUser, membership_id: &str) -> Result<()> {
    let membership = membership_by_id(pool, membership_id).await?;

    if !actor.is_admin() {
        let actor_membership = policy::membership_for(pool, &membership.project_id, &actor.id).await?;
        policy::check(actor, ProjectAction::ManageMembers, actor_membership)?;
    }

    if membership.status != MembershipStatus::Active {
        return Err(AppError::BadRequest(
            "only an active member can become primary".to_string(),
        ));
    }
    if membership.is_primary {
        return Err(AppError::BadRequest(
            "this member is already the primary member".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE memberships SET is_primary = 0 WHERE project_id = ? AND is_primary = 1")
        .bind(&membership.project_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE memberships SET is_primary = 1 WHERE id = ? AND status = 'active'")
        .bind(membership_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

/// Invite a user to a project as a pending member.
pub async fn invite(
    pool: &SqlitePool,
    actor: &AuthUser,
    project_id: &str,
    target_user_id: &str,
    role: &str,
) -> Result<Membership> {
    let actor_membership = policy::membership_for(pool, project_id, &actor.id).await?;
    policy::check(actor, ProjectAction::AddMember, actor_membership)?;

    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM memberships WHERE project_id = ? AND user_id = ?",
    )
    .bind(project_id)
    .bind(target_user_id)
    .fetch_one(pool)
    .await?;
    if existing > 0 {
        return Err(AppError::Validation(
            "this user is already a member of the project".to_string(),
        ));
    }

    let membership = Membership {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        user_id: target_user_id.to_string(),
        status: MembershipStatus::Pending,
        role: role.to_string(),
        is_primary: false,
        created_at: chrono::Utc::now(),
    };

    sqlx::query(
        "INSERT INTO memberships (id, project_id, user_id, status, role, is_primary, created_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(&membership.id)
    .bind(project_id)
    .bind(target_user_id)
    .bind(membership.status)
    .bind(role)
    .bind(now_str())
    .execute(pool)
    .await?;

    Ok(membership)
}

/// First membership of a freshly created project: active, primary, owner.
/// Created out-of-band of the invitation state machine.
pub async fn bootstrap_owner(pool: &SqlitePool, project_id: &str, user_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO memberships (id, project_id, user_id, status, role, is_primary, created_at) \
         VALUES (?, ?, ?, 'active', 'owner', 1, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(project_id)
    .bind(user_id)
    .bind(now_str())
    .execute(pool)
    .await?;
    Ok(())
}
