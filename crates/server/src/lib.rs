use axum::{middleware as axum_middleware, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod policy;
pub mod routes;
pub mod services;

#[derive(Clone)]
pub struct AppState {
    pub db: db::Database,
    pub config: config::Config,
    pub mailer: services::mail::Mailer,
}

/// The full application router: public read API, authenticated surface, and
/// the admin moderation endpoints.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .nest(
            "/projects",
            routes::projects::protected_router().merge(routes::versions::protected_router()),
        )
        .nest("/members", routes::projects::members_router())
        .nest("/me", routes::users::protected_router())
        .nest("/auth", routes::auth::protected_router())
        .nest("/admin", routes::admin::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    let public = Router::new()
        .nest("/auth", routes::auth::router())
        .nest(
            "/projects",
            routes::projects::public_router().merge(routes::versions::public_router()),
        )
        .nest("/users", routes::users::public_router())
        .route("/tags", get(routes::projects::list_tags));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", public.merge(protected))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn health_check() -> &'static str {
    "OK"
}
