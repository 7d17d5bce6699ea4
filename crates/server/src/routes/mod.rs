pub mod admin;
pub mod auth;
pub mod projects;
pub mod users;
pub mod versions;
