use sqlx::SqlitePool;

use crate::error::{AppError, Result};

/// Lowercased, hyphen-separated form of a project name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_hyphen = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Derive a slug from a project name, suffixing a counter on collision.
pub async fn unique_slug(pool: &SqlitePool, name: &str) -> Result<String> {
    let base = slugify(name);
    if base.is_empty() {
        return Err(AppError::Validation(
            "project name must contain at least one letter or digit".to_string(),
        ));
    }

    let mut candidate = base.clone();
    let mut counter = 2;
    loop {
        let taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects WHERE slug = ?")
            .bind(&candidate)
            .fetch_one(pool)
            .await?;
        if taken == 0 {
            return Ok(candidate);
        }
        candidate = format!("{base}-{counter}");
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_normalizes_names() {
        assert_eq!(slugify("My Great Mod!"), "my-great-mod");
        assert_eq!(slugify("  spaced   out  "), "spaced-out");
        assert_eq!(slugify("Already-Fine-123"), "already-fine-123");
        assert_eq!(slugify("???"), "");
    }
}
