use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tower::util::ServiceExt;

use modvault_server::{
    config::Config,
    db::Database,
    services::mail::Mailer,
    AppState,
};

fn test_config(storage_path: String) -> Config {
    Config {
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

async fn test_app_at(storage_path: String) -> (Router, SqlitePool) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let state = AppState {
        db: Database { pool: pool.clone() },
        config: test_config(storage_path),
        mailer: Mailer::Disabled,
    };

    (modvault_server::router(state), pool)
}

async fn test_app() -> (Router, SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let (app, pool) = test_app_at(dir.path().to_string_lossy().to_string()).await;
    (app, pool, dir)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn request(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    send(app, request).await
}

async fn get_bytes(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

const BOUNDARY: &str = "modvault-upload";

fn upload_request(
    uri: &str,
    token: &str,
    fields: &[(&str, &str)],
    files: &[(&str, &[u8])],
) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for (file_name, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; \
                 filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn register(app: &Router, name: &str) -> String {
    let (status, body) = request(
        app,
        Method::POST,
        "/api/auth/register",
        None,
        Some(json!({
            "name": name,
            "email": format!("{name}@example.com"),
            "password": "correct horse",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

async fn verify_email(app: &Router, pool: &SqlitePool, name: &str) {
    let token = sqlx::query_scalar::<_, String>(
        "SELECT email_verification_token FROM users WHERE name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .unwrap();

    let (status, _) = request(
        app,
        Method::GET,
        &format!("/api/auth/verify?token={token}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn make_admin(pool: &SqlitePool, name: &str) {
    sqlx::query("UPDATE users SET role = 'admin' WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn project_creation_requires_auth_and_a_verified_email() {
    let (app, pool, _dir) = test_app().await;

    let (status, _) = request(
        &app,
        Method::POST,
        "/api/projects",
        None,
        Some(json!({ "name": "My Mod" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = register(&app, "alice").await;
    let (status, body) = request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&token),
        Some(json!({ "name": "My Mod" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    verify_email(&app, &pool, "alice").await;
    let (status, body) = request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&token),
        Some(json!({ "name": "My Mod" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["slug"], "my-mod");
    assert_eq!(body["approval_status"], "pending");
}

#[tokio::test]
async fn pending_projects_are_invisible_to_guests_and_other_users() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;
    let bob = register(&app, "bob").await;

    let (status, _) = request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "Hidden Gem" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Guest listing: empty.
    let (_, body) = request(&app, Method::GET, "/api/projects", None, None).await;
    assert_eq!(body["projects"].as_array().unwrap().len(), 0);

    // Guest direct fetch: plain 404 with a message body.
    let (status, body) =
        request(&app, Method::GET, "/api/projects/hidden-gem", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    // Another user: also invisible.
    let (status, _) =
        request(&app, Method::GET, "/api/projects/hidden-gem", Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The owner sees it.
    let (status, body) =
        request(&app, Method::GET, "/api/projects/hidden-gem", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approval_status"], "pending");
}

#[tokio::test]
async fn approval_makes_a_project_public() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;
    let admin = register(&app, "root").await;
    make_admin(&pool, "root").await;

    request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "Great Mod", "tags": ["magic", "qol"] })),
    )
    .await;

    // Non-admin cannot moderate.
    let (status, _) = request(
        &app,
        Method::POST,
        "/api/admin/projects/great-mod/approve",
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = request(
        &app,
        Method::POST,
        "/api/admin/projects/great-mod/approve",
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        request(&app, Method::GET, "/api/projects/great-mod", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approval_status"], "approved");

    // Tag filtering on the public listing.
    let (_, body) = request(&app, Method::GET, "/api/projects?tag=magic", None, None).await;
    assert_eq!(body["projects"].as_array().unwrap().len(), 1);
    let (_, body) = request(&app, Method::GET, "/api/projects?tag=unknown", None, None).await;
    assert_eq!(body["projects"].as_array().unwrap().len(), 0);

    // The user's public profile lists the approved project.
    let (status, body) = request(&app, Method::GET, "/api/users/alice", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["projects"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn pending_project_quota_blocks_the_fourth_creation() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;

    for i in 0..3 {
        let (status, _) = request(
            &app,
            Method::POST,
            "/api/projects",
            Some(&alice),
            Some(json!({ "name": format!("Mod {i}") })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "One Too Many" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "quota_exceeded");

    // Approving one frees a slot.
    sqlx::query("UPDATE projects SET approval_status = 'approved' WHERE slug = 'mod-0'")
        .execute(&pool)
        .await
        .unwrap();

    let (status, _) = request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "One Too Many" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn membership_invitation_lifecycle() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;
    let bob = register(&app, "bob").await;

    request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "Team Mod" })),
    )
    .await;

    let (status, body) = request(
        &app,
        Method::POST,
        "/api/projects/team-mod/members",
        Some(&alice),
        Some(json!({ "user_name": "bob", "role": "artist" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let membership_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["status"], "pending");

    // Only bob can accept.
    let (status, _) = request(
        &app,
        Method::POST,
        &format!("/api/members/{membership_id}/accept"),
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/api/members/{membership_id}/accept"),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");

    // Alice holds the only primary membership, so she cannot leave yet.
    let alice_membership = sqlx::query_scalar::<_, String>(
        "SELECT m.id FROM memberships m JOIN users u ON u.id = m.user_id WHERE u.name = 'alice'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let (status, _) = request(
        &app,
        Method::DELETE,
        &format!("/api/members/{alice_membership}"),
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Promote bob, then alice can leave.
    let (status, _) = request(
        &app,
        Method::POST,
        &format!("/api/members/{membership_id}/primary"),
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &app,
        Method::DELETE,
        &format!("/api/members/{alice_membership}"),
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_version_and_user_return_404_bodies() {
    let (app, _pool, _dir) = test_app().await;

    let (status, body) = request(
        &app,
        Method::GET,
        "/api/projects/nope/versions/1.0.0",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = request(&app, Method::GET, "/api/users/ghost", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("not found") || body["code"] == "not_found");
}

#[tokio::test]
async fn version_upload_download_and_counter() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;
    request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "My Mod" })),
    )
    .await;
    sqlx::query("UPDATE projects SET approval_status = 'approved'")
        .execute(&pool)
        .await
        .unwrap();

    let (status, body) = send(
        &app,
        upload_request(
            "/api/projects/my-mod/versions",
            &alice,
            &[
                ("version", "1.0.0"),
                ("release_type", "beta"),
                ("changelog", "first release"),
                ("tags", "tools"),
            ],
            &[("mod.zip", b"zip bytes")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "1.0.0");
    assert_eq!(body["release_type"], "beta");
    assert_eq!(body["downloads"], 0);
    assert_eq!(body["files"][0]["name"], "mod.zip");
    assert_eq!(body["tags"][0], "tools");

    // Guests can download an approved project's files; each download bumps
    // the counter.
    let uri = "/api/projects/my-mod/versions/1.0.0/files/mod.zip";
    let (status, data) = get_bytes(&app, uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(data, b"zip bytes");
    let (status, _) = get_bytes(&app, uri).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(
        &app,
        Method::GET,
        "/api/projects/my-mod/versions/1.0.0",
        None,
        None,
    )
    .await;
    assert_eq!(body["downloads"], 2);

    let (_, body) =
        request(&app, Method::GET, "/api/projects/my-mod/versions", None, None).await;
    assert_eq!(body["versions"].as_array().unwrap().len(), 1);

    // The same version string cannot be published twice.
    let (status, _) = send(
        &app,
        upload_request(
            "/api/projects/my-mod/versions",
            &alice,
            &[("version", "1.0.0")],
            &[("other.zip", b"x")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn version_dependencies_resolve_hosted_projects_and_keep_external_pairs() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;
    for name in ["Lib Mod", "App Mod"] {
        request(
            &app,
            Method::POST,
            "/api/projects",
            Some(&alice),
            Some(json!({ "name": name })),
        )
        .await;
    }

    let (status, _) = send(
        &app,
        upload_request(
            "/api/projects/lib-mod/versions",
            &alice,
            &[("version", "1.0.0")],
            &[("lib.zip", b"x")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let deps = r#"[
        {"project": "lib-mod", "project_version": "1.0.0"},
        {"name": "sdk", "version": "2.1"}
    ]"#;
    let (status, body) = send(
        &app,
        upload_request(
            "/api/projects/app-mod/versions",
            &alice,
            &[("version", "1.0.0"), ("dependencies", deps)],
            &[("app.zip", b"x")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let deps = body["dependencies"].as_array().unwrap();
    assert_eq!(deps.len(), 2);
    let hosted = deps.iter().find(|d| d["dependency_name"].is_null()).unwrap();
    assert!(hosted["dependency_project_id"].is_string());
    assert!(hosted["dependency_version_id"].is_string());
    let external = deps.iter().find(|d| d["dependency_name"] == "sdk").unwrap();
    assert_eq!(external["dependency_version"], "2.1");

    // One entry mixing both forms is rejected.
    let (status, body) = send(
        &app,
        upload_request(
            "/api/projects/app-mod/versions",
            &alice,
            &[
                ("version", "2.0.0"),
                ("dependencies", r#"[{"project": "lib-mod", "name": "sdk", "version": "1"}]"#),
            ],
            &[("app.zip", b"x")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation");

    // Unknown hosted dependency slugs are a 404.
    let (status, _) = send(
        &app,
        upload_request(
            "/api/projects/app-mod/versions",
            &alice,
            &[("version", "2.0.0"), ("dependencies", r#"[{"project": "nope"}]"#)],
            &[("app.zip", b"x")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_upload_leaves_no_version_behind() {
    // A regular file where the storage root should be makes every disk
    // write fail before any row is inserted.
    let dir = tempfile::tempdir().unwrap();
    let blocked = dir.path().join("storage");
    std::fs::write(&blocked, b"").unwrap();
    let (app, pool) = test_app_at(blocked.to_string_lossy().to_string()).await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;
    request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "My Mod" })),
    )
    .await;

    let (status, _) = send(
        &app,
        upload_request(
            "/api/projects/my-mod/versions",
            &alice,
            &[("version", "1.0.0")],
            &[("mod.zip", b"x")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM project_versions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);

    let (_, body) = request(
        &app,
        Method::GET,
        "/api/projects/my-mod/versions",
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(body["versions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn duplicate_file_names_in_one_upload_are_rejected() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;
    request(
        &app,
        Method::POST,
        "/api/projects",
        Some(&alice),
        Some(json!({ "name": "My Mod" })),
    )
    .await;

    let (status, body) = send(
        &app,
        upload_request(
            "/api/projects/my-mod/versions",
            &alice,
            &[("version", "1.0.0")],
            &[("mod.zip", b"x"), ("mod.zip", b"y")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation");

    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM project_versions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn email_change_cannot_take_an_address_claimed_meanwhile() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;

    let (status, _) = request(
        &app,
        Method::POST,
        "/api/auth/email",
        Some(&alice),
        Some(json!({ "new_email": "eve@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (authorize_token, verify_token) = sqlx::query_as::<_, (String, String)>(
        "SELECT authorize_token, verify_token FROM pending_email_changes",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let (status, _) = request(
        &app,
        Method::GET,
        &format!("/api/auth/email/authorize?token={authorize_token}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Someone else registers the target address before the confirmation.
    register(&app, "eve").await;

    let (status, body) = request(
        &app,
        Method::GET,
        &format!("/api/auth/email/confirm?token={verify_token}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation");

    let email = sqlx::query_scalar::<_, String>("SELECT email FROM users WHERE name = 'alice'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(email, "alice@example.com");

    // The dead pending change is discarded.
    let pending = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pending_email_changes")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(pending, 0);
}

#[tokio::test]
async fn email_change_requires_both_stages() {
    let (app, pool, _dir) = test_app().await;

    let alice = register(&app, "alice").await;
    verify_email(&app, &pool, "alice").await;

    let (status, _) = request(
        &app,
        Method::POST,
        "/api/auth/email",
        Some(&alice),
        Some(json!({ "new_email": "new@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (authorize_token, verify_token) = sqlx::query_as::<_, (String, String)>(
        "SELECT authorize_token, verify_token FROM pending_email_changes",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    // Confirming before authorizing fails.
    let (status, _) = request(
        &app,
        Method::GET,
        &format!("/api/auth/email/confirm?token={verify_token}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &app,
        Method::GET,
        &format!("/api/auth/email/authorize?token={authorize_token}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &app,
        Method::GET,
        &format!("/api/auth/email/confirm?token={verify_token}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let email = sqlx::query_scalar::<_, String>("SELECT email FROM users WHERE name = 'alice'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(email, "new@example.com");
}
