use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    db::{
        models::{PendingEmailChange, PendingPasswordChange, User},
        now_str,
    },
    error::{AppError, Result},
    middleware::auth::AuthUser,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/verify", get(verify_email))
        .route("/email/authorize", get(authorize_email_change))
        .route("/email/confirm", get(confirm_email_change))
        .route("/password/confirm", post(confirm_password_change))
}

/// Endpoints behind the bearer-token middleware.
pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/email", post(request_email_change))
        .route("/password", post(request_password_change))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserResponse,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub email_verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: usize,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| AppError::Internal("Failed to hash password".to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

fn create_token(user_id: &str, secret: &str) -> Result<String> {
    let expiration = Utc::now()
        .checked_add_signed(chrono::Duration::days(7))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AppError::Internal("Failed to create token".to_string()))
}

fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 {
        return Err(AppError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::Validation("Invalid email address".to_string()));
    }
    Ok(())
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>> {
    validate_email(&body.email)?;
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("Name is required".to_string()));
    }
    validate_password(&body.password)?;

    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM users WHERE email = ? OR name = ?",
    )
    .bind(&body.email)
    .bind(&body.name)
    .fetch_one(&state.db.pool)
    .await?;

    if existing > 0 {
        return Err(AppError::Validation(
            "Email or name already registered".to_string(),
        ));
    }

    let password_hash = hash_password(&body.password)?;
    let user_id = Uuid::new_v4().to_string();
    let verification_token = Uuid::new_v4().to_string();

    sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, role, email_verification_token, created_at) \
         VALUES (?, ?, ?, ?, 'user', ?, ?)",
    )
    .bind(&user_id)
    .bind(&body.name)
    .bind(&body.email)
    .bind(&password_hash)
    .bind(&verification_token)
    .bind(now_str())
    .execute(&state.db.pool)
    .await?;

    if let Err(e) = state.mailer.send_verification(&body.email, &verification_token).await {
        tracing::warn!(user = user_id, "failed to send verification mail: {e}");
    }

    let token = create_token(&user_id, &state.config.jwt_secret)?;

    Ok(Json(AuthResponse {
        token,
        user: UserResponse {
            id: user_id,
            email: body.email,
            name: body.name,
            email_verified: false,
        },
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(&body.email)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !verify_password(&body.password, &user.password_hash)? {
        return Err(AppError::Unauthorized);
    }

    if user.deactivated_at.is_some() {
        return Err(AppError::Forbidden(
            "this account has been deactivated".to_string(),
        ));
    }

    let token = create_token(&user.id, &state.config.jwt_secret)?;

    Ok(Json(AuthResponse {
        token,
        user: UserResponse {
            id: user.id,
            email: user.email,
            name: user.name,
            email_verified: user.email_verified_at.is_some(),
        },
    }))
}

async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Value>> {
    let updated = sqlx::query(
        "UPDATE users SET email_verified_at = ?, email_verification_token = NULL \
         WHERE email_verification_token = ?",
    )
    .bind(now_str())
    .bind(&query.token)
    .execute(&state.db.pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("Unknown verification token".to_string()));
    }

    Ok(Json(json!({ "message": "email verified" })))
}

// --- email change: request (old address) -> authorize -> verify (new address)

#[derive(Debug, Deserialize)]
pub struct EmailChangeRequest {
    pub new_email: String,
}

async fn request_email_change(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<EmailChangeRequest>,
) -> Result<Json<Value>> {
    validate_email(&body.new_email)?;

    let taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
        .bind(&body.new_email)
        .fetch_one(&state.db.pool)
        .await?;
    if taken > 0 {
        return Err(AppError::Validation(
            "this email address is already in use".to_string(),
        ));
    }

    // One active change per user; a new request replaces the old one.
    sqlx::query("DELETE FROM pending_email_changes WHERE user_id = ?")
        .bind(&user.id)
        .execute(&state.db.pool)
        .await?;

    let authorize_token = Uuid::new_v4().to_string();
    let verify_token = Uuid::new_v4().to_string();
    let expires_at = (Utc::now()
        + chrono::Duration::minutes(state.config.change_token_ttl_minutes))
    .to_rfc3339();

    sqlx::query(
        "INSERT INTO pending_email_changes \
         (id, user_id, new_email, authorize_token, verify_token, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&user.id)
    .bind(&body.new_email)
    .bind(&authorize_token)
    .bind(&verify_token)
    .bind(&expires_at)
    .bind(now_str())
    .execute(&state.db.pool)
    .await?;

    if let Err(e) = state
        .mailer
        .send_email_change_authorization(&user.email, &authorize_token)
        .await
    {
        tracing::warn!(user = user.id, "failed to send email change authorization: {e}");
    }

    Ok(Json(json!({ "message": "authorization link sent to your current address" })))
}

async fn authorize_email_change(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Value>> {
    let change = sqlx::query_as::<_, PendingEmailChange>(
        "SELECT * FROM pending_email_changes WHERE authorize_token = ?",
    )
    .bind(&query.token)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Unknown token".to_string()))?;

    expire_email_change(&state, &change).await?;

    if change.authorized_at.is_some() {
        return Err(AppError::BadRequest(
            "this change has already been authorized".to_string(),
        ));
    }

    sqlx::query("UPDATE pending_email_changes SET authorized_at = ? WHERE id = ?")
        .bind(now_str())
        .bind(&change.id)
        .execute(&state.db.pool)
        .await?;

    if let Err(e) = state
        .mailer
        .send_email_change_verification(&change.new_email, &change.verify_token)
        .await
    {
        tracing::warn!(user = change.user_id, "failed to send email change verification: {e}");
    }

    Ok(Json(json!({ "message": "verification link sent to the new address" })))
}

async fn confirm_email_change(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Value>> {
    let change = sqlx::query_as::<_, PendingEmailChange>(
        "SELECT * FROM pending_email_changes WHERE verify_token = ?",
    )
    .bind(&query.token)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Unknown token".to_string()))?;

    expire_email_change(&state, &change).await?;

    if change.authorized_at.is_none() {
        return Err(AppError::BadRequest(
            "the change has not been authorized from the current address yet".to_string(),
        ));
    }

    // The address may have been claimed between the request and this
    // confirmation; a change that can no longer succeed is discarded.
    let taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
        .bind(&change.new_email)
        .fetch_one(&state.db.pool)
        .await?;
    if taken > 0 {
        sqlx::query("DELETE FROM pending_email_changes WHERE id = ?")
            .bind(&change.id)
            .execute(&state.db.pool)
            .await?;
        return Err(AppError::Validation(
            "this email address is already in use".to_string(),
        ));
    }

    sqlx::query("UPDATE users SET email = ? WHERE id = ?")
        .bind(&change.new_email)
        .bind(&change.user_id)
        .execute(&state.db.pool)
        .await?;

    sqlx::query("DELETE FROM pending_email_changes WHERE id = ?")
        .bind(&change.id)
        .execute(&state.db.pool)
        .await?;

    Ok(Json(json!({ "message": "email address updated" })))
}

async fn expire_email_change(state: &AppState, change: &PendingEmailChange) -> Result<()> {
    if change.expires_at < Utc::now() {
        sqlx::query("DELETE FROM pending_email_changes WHERE id = ?")
            .bind(&change.id)
            .execute(&state.db.pool)
            .await?;
        return Err(AppError::ExpiredToken);
    }
    Ok(())
}

// --- password change: request -> confirm with token

async fn request_password_change(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Value>> {
    sqlx::query("DELETE FROM pending_password_changes WHERE user_id = ?")
        .bind(&user.id)
        .execute(&state.db.pool)
        .await?;

    let token = Uuid::new_v4().to_string();
    let expires_at = (Utc::now()
        + chrono::Duration::minutes(state.config.change_token_ttl_minutes))
    .to_rfc3339();

    sqlx::query(
        "INSERT INTO pending_password_changes (id, user_id, token, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&user.id)
    .bind(&token)
    .bind(&expires_at)
    .bind(now_str())
    .execute(&state.db.pool)
    .await?;

    if let Err(e) = state.mailer.send_password_change(&user.email, &token).await {
        tracing::warn!(user = user.id, "failed to send password change mail: {e}");
    }

    Ok(Json(json!({ "message": "confirmation code sent" })))
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeConfirm {
    pub token: String,
    pub new_password: String,
}

async fn confirm_password_change(
    State(state): State<AppState>,
    Json(body): Json<PasswordChangeConfirm>,
) -> Result<Json<Value>> {
    validate_password(&body.new_password)?;

    let change = sqlx::query_as::<_, PendingPasswordChange>(
        "SELECT * FROM pending_password_changes WHERE token = ?",
    )
    .bind(&body.token)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Unknown token".to_string()))?;

    if change.expires_at < Utc::now() {
        sqlx::query("DELETE FROM pending_password_changes WHERE id = ?")
            .bind(&change.id)
            .execute(&state.db.pool)
            .await?;
        return Err(AppError::ExpiredToken);
    }

    let password_hash = hash_password(&body.new_password)?;
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(&password_hash)
        .bind(&change.user_id)
        .execute(&state.db.pool)
        .await?;

    sqlx::query("DELETE FROM pending_password_changes WHERE id = ?")
        .bind(&change.id)
        .execute(&state.db.pool)
        .await?;

    Ok(Json(json!({ "message": "password updated" })))
}
