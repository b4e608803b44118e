use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DbBackend, DbConn, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
    entity::prelude::TimeUnixTimestamp,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{info, instrument};

use crate::{config::db_conn_capsule, orm::post};

/// How long a post stays visible after it is created.
pub const POST_RETENTION: Duration = Duration::days(7);

pub fn post_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn PostRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(PostRepositoryImpl { db })
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn insert_post(&self, new_post: NewPost) -> anyhow::Result<Post>;

    /// Returns every post with `expires_at > now`, newest first.
    async fn list_unexpired_posts(&self, now: OffsetDateTime) -> anyhow::Result<Vec<Post>>;

    /// Deletes every post with `expires_at <= now` in one transaction and returns what was deleted.
    /// Rows already removed by a concurrent call are simply not returned.
    async fn delete_expired_posts(&self, now: OffsetDateTime) -> anyhow::Result<Vec<Post>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Post {
    pub id: i32,
    pub description: String,
    pub image: Option<String>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPost {
    pub description: Description,
    pub image: Option<String>,
    pub created_at: OffsetDateTime,
}

impl NewPost {
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at + POST_RETENTION
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Description(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptionValidationError {
    #[error("description must be longer than {min} characters, got {actual}")]
    TooShort { min: usize, actual: usize },
    #[error("description must be at most {max} characters, got {actual}")]
    TooLong { max: usize, actual: usize },
}

impl Description {
    const MIN_EXCLUSIVE_LEN: usize = 5;
    const MAX_LEN: usize = 500;

    /// The lower bound applies to the trimmed text; the upper bound to the text as submitted.
    ///
    /// # Errors
    /// Will return [`Err`] if the description is too short or too long.
    pub fn new(description: String) -> Result<Self, DescriptionValidationError> {
        let trimmed_len = description.trim().chars().count();
        if trimmed_len <= Self::MIN_EXCLUSIVE_LEN {
            return Err(DescriptionValidationError::TooShort {
                min: Self::MIN_EXCLUSIVE_LEN,
                actual: trimmed_len,
            });
        }

        let len = description.chars().count();
        if len > Self::MAX_LEN {
            return Err(DescriptionValidationError::TooLong {
                max: Self::MAX_LEN,
                actual: len,
            });
        }

        Ok(Self(description))
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<post::Model> for Post {
    fn from(
        post::Model {
            id,
            description,
            image,
            created_at,
            expires_at,
        }: post::Model,
    ) -> Self {
        Self {
            id,
            description,
            image,
            created_at: created_at.0,
            expires_at: expires_at.0,
        }
    }
}

/// Creates the `posts` table (and its expiry index) when missing.
///
/// # Errors
/// Will return [`Err`] if the backend is unsupported or a statement fails.
#[instrument(skip(db))]
pub async fn create_posts_table(db: &DbConn) -> anyhow::Result<()> {
    let create_table = match db.get_database_backend() {
        DbBackend::Sqlite => {
            "CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL,
                image TEXT,
                created_at BIGINT NOT NULL,
                expires_at BIGINT NOT NULL
            )"
        }
        DbBackend::Postgres => {
            "CREATE TABLE IF NOT EXISTS posts (
                id SERIAL PRIMARY KEY,
                description TEXT NOT NULL,
                image TEXT,
                created_at BIGINT NOT NULL,
                expires_at BIGINT NOT NULL
            )"
        }
        backend => bail!("Unsupported database backend: {backend:?}"),
    };

    db.execute_unprepared(create_table)
        .await
        .context("Failed to create posts table")?;
    db.execute_unprepared("CREATE INDEX IF NOT EXISTS posts_expires_at_idx ON posts (expires_at)")
        .await
        .context("Failed to create posts expiry index")?;

    info!("posts table is ready");
    Ok(())
}

struct PostRepositoryImpl {
    db: DbConn,
}

#[async_trait]
impl PostRepository for PostRepositoryImpl {
    #[instrument(skip(self))]
    async fn insert_post(&self, new_post: NewPost) -> anyhow::Result<Post> {
        let expires_at = new_post.expires_at();
        let to_insert = post::ActiveModel {
            id: NotSet,
            description: Set(new_post.description.into_inner()),
            image: Set(new_post.image),
            created_at: Set(TimeUnixTimestamp(new_post.created_at)),
            expires_at: Set(TimeUnixTimestamp(expires_at)),
        };
        let inserted = to_insert
            .insert(&self.db)
            .await
            .context("Failed to insert post")?;
        Ok(inserted.into())
    }

    #[instrument(skip(self))]
    async fn list_unexpired_posts(&self, now: OffsetDateTime) -> anyhow::Result<Vec<Post>> {
        let posts = post::Entity::find()
            .filter(post::Column::ExpiresAt.gt(TimeUnixTimestamp(now)))
            .order_by_desc(post::Column::Id)
            .all(&self.db)
            .await
            .context("Failed to list unexpired posts")?;
        Ok(posts.into_iter().map(Post::from).collect())
    }

    #[instrument(skip(self))]
    async fn delete_expired_posts(&self, now: OffsetDateTime) -> anyhow::Result<Vec<Post>> {
        let txn = self
            .db
            .begin()
            .await
            .context("Failed to begin sweep transaction")?;

        let expired = post::Entity::find()
            .filter(post::Column::ExpiresAt.lte(TimeUnixTimestamp(now)))
            .all(&txn)
            .await
            .context("Failed to find expired posts")?;

        if !expired.is_empty() {
            let deleted = post::Entity::delete_many()
                .filter(post::Column::Id.is_in(expired.iter().map(|model| model.id)))
                .exec(&txn)
                .await
                .context("Failed to delete expired posts")?;
            info!(rows_affected = deleted.rows_affected, "Deleted expired posts");
        }

        txn.commit()
            .await
            .context("Failed to commit sweep transaction")?;

        Ok(expired.into_iter().map(Post::from).collect())
    }
}
