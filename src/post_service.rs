use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use rearch::CapsuleHandle;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::{
    post_repo::{
        Description, DescriptionValidationError, NewPost, Post, PostRepository,
        post_repository_capsule,
    },
    uploads::{UploadStore, upload_store_capsule},
};

const TEST_POST_DESCRIPTION: &str = "TEST POST – SHOULD SHOW";

#[derive(Debug)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub struct CreatePostPayload {
    pub description: String,
    pub image: Option<UploadedFile>,
}

pub fn post_service_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn PostService> {
    let post_repo = Arc::clone(get.as_ref(post_repository_capsule));
    let upload_store = Arc::clone(get.as_ref(upload_store_capsule));
    Arc::new(PostServiceImpl {
        post_repo,
        upload_store,
    })
}

#[async_trait]
pub trait PostService: Send + Sync {
    /// Sweeps expired posts, then returns the rest newest first.
    async fn list_posts(&self) -> anyhow::Result<Vec<Post>>;

    /// Deletes expired posts along with their uploads and returns the deleted posts.
    async fn sweep_expired_posts(&self) -> anyhow::Result<Vec<Post>>;

    async fn create_post(&self, payload: CreatePostPayload) -> Result<Post, CreatePostError>;

    async fn add_test_post(&self) -> anyhow::Result<Post>;
}

#[derive(Debug, Error)]
pub enum CreatePostError {
    #[error("invalid description: {0}")]
    InvalidDescription(#[from] DescriptionValidationError),
    #[error("internal error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

struct PostServiceImpl {
    post_repo: Arc<dyn PostRepository>,
    upload_store: Arc<dyn UploadStore>,
}

#[async_trait]
impl PostService for PostServiceImpl {
    #[instrument(skip(self))]
    async fn list_posts(&self) -> anyhow::Result<Vec<Post>> {
        self.sweep_expired_posts().await?;
        self.post_repo
            .list_unexpired_posts(OffsetDateTime::now_utc())
            .await
    }

    #[instrument(skip(self))]
    async fn sweep_expired_posts(&self) -> anyhow::Result<Vec<Post>> {
        let expired = self
            .post_repo
            .delete_expired_posts(OffsetDateTime::now_utc())
            .await?;

        // NOTE: rows are already gone at this point; a file we fail to remove stays orphaned
        for image in expired.iter().filter_map(|post| post.image.as_deref()) {
            if let Err(err) = self.upload_store.remove(image).await {
                warn!(?err, image, "Failed to remove upload of expired post");
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired posts");
        }
        Ok(expired)
    }

    #[instrument(skip_all, fields(has_image = payload.image.is_some()))]
    async fn create_post(&self, payload: CreatePostPayload) -> Result<Post, CreatePostError> {
        let CreatePostPayload { description, image } = payload;
        let description = Description::new(description)?;

        let image = match image {
            Some(UploadedFile { file_name, bytes }) => Some(
                self.upload_store
                    .save(&file_name, &bytes)
                    .await
                    .map_err(CreatePostError::Internal)?,
            ),
            None => None,
        };

        let new_post = NewPost {
            description,
            image,
            created_at: OffsetDateTime::now_utc(),
        };
        self.post_repo
            .insert_post(new_post)
            .await
            .map_err(CreatePostError::Internal)
    }

    #[instrument(skip(self))]
    async fn add_test_post(&self) -> anyhow::Result<Post> {
        let new_post = NewPost {
            description: Description::new(TEST_POST_DESCRIPTION.to_owned())?,
            image: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.post_repo.insert_post(new_post).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mockall::{mock, predicate::*};
    use time::Duration;

    use crate::post_repo::POST_RETENTION;

    use super::*;

    mock! {
        PostRepository {}

        #[async_trait]
        impl PostRepository for PostRepository {
            async fn insert_post(&self, new_post: NewPost) -> anyhow::Result<Post>;
            async fn list_unexpired_posts(&self, now: OffsetDateTime) -> anyhow::Result<Vec<Post>>;
            async fn delete_expired_posts(&self, now: OffsetDateTime) -> anyhow::Result<Vec<Post>>;
        }
    }

    mock! {
        UploadStore {}

        #[async_trait]
        impl UploadStore for UploadStore {
            async fn save(&self, original_name: &str, bytes: &[u8]) -> anyhow::Result<String>;
            async fn remove(&self, file_name: &str) -> anyhow::Result<()>;
        }
    }

    fn service(post_repo: MockPostRepository, upload_store: MockUploadStore) -> PostServiceImpl {
        PostServiceImpl {
            post_repo: Arc::new(post_repo),
            upload_store: Arc::new(upload_store),
        }
    }

    fn stored(new_post: NewPost) -> Post {
        Post {
            id: 1,
            expires_at: new_post.expires_at(),
            created_at: new_post.created_at,
            image: new_post.image,
            description: new_post.description.into_inner(),
        }
    }

    fn expired_post(id: i32, image: Option<&str>) -> Post {
        let created_at = OffsetDateTime::now_utc() - Duration::days(8);
        Post {
            id,
            description: "old news".to_owned(),
            image: image.map(ToOwned::to_owned),
            created_at,
            expires_at: created_at + POST_RETENTION,
        }
    }

    fn payload(description: &str, image: Option<(&str, &'static str)>) -> CreatePostPayload {
        CreatePostPayload {
            description: description.to_owned(),
            image: image.map(|(file_name, bytes)| UploadedFile {
                file_name: file_name.to_owned(),
                bytes: Bytes::from_static(bytes.as_bytes()),
            }),
        }
    }

    #[tokio::test]
    async fn test_create_post_too_short_persists_nothing() {
        let mut post_repo = MockPostRepository::new();
        post_repo.expect_insert_post().never();
        let mut upload_store = MockUploadStore::new();
        upload_store.expect_save().never();

        let result = service(post_repo, upload_store)
            .create_post(payload("Hi", Some(("cat.png", "meow"))))
            .await
            .unwrap_err();

        assert!(matches!(
            result,
            CreatePostError::InvalidDescription(DescriptionValidationError::TooShort { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_post_too_long_persists_nothing() {
        let mut post_repo = MockPostRepository::new();
        post_repo.expect_insert_post().never();
        let mut upload_store = MockUploadStore::new();
        upload_store.expect_save().never();

        let result = service(post_repo, upload_store)
            .create_post(payload(&"x".repeat(501), None))
            .await
            .unwrap_err();

        assert!(matches!(
            result,
            CreatePostError::InvalidDescription(DescriptionValidationError::TooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_post_without_image() {
        let mut post_repo = MockPostRepository::new();
        post_repo
            .expect_insert_post()
            .withf(|new_post| {
                new_post.image.is_none()
                    && new_post.description == Description::new("Hello world".to_owned()).unwrap()
            })
            .once()
            .return_once(|new_post| Ok(stored(new_post)));
        let mut upload_store = MockUploadStore::new();
        upload_store.expect_save().never();

        let post = service(post_repo, upload_store)
            .create_post(payload("Hello world", None))
            .await
            .unwrap();

        assert_eq!(post.image, None);
        assert_eq!(post.expires_at - post.created_at, Duration::days(7));
    }

    #[tokio::test]
    async fn test_create_post_with_image_stores_generated_name() {
        let mut upload_store = MockUploadStore::new();
        upload_store
            .expect_save()
            .withf(|original_name, bytes| original_name == "cat.png" && bytes == b"meow")
            .once()
            .return_once(|_, _| Ok("0b9f6c1e.png".to_owned()));
        let mut post_repo = MockPostRepository::new();
        post_repo
            .expect_insert_post()
            .withf(|new_post| new_post.image.as_deref() == Some("0b9f6c1e.png"))
            .once()
            .return_once(|new_post| Ok(stored(new_post)));

        let post = service(post_repo, upload_store)
            .create_post(payload("A picture of my cat", Some(("cat.png", "meow"))))
            .await
            .unwrap();

        assert_eq!(post.image.as_deref(), Some("0b9f6c1e.png"));
    }

    #[tokio::test]
    async fn test_create_post_upload_failure_is_internal() {
        let mut upload_store = MockUploadStore::new();
        upload_store
            .expect_save()
            .once()
            .return_once(|_, _| Err(anyhow::anyhow!("disk full")));
        let mut post_repo = MockPostRepository::new();
        post_repo.expect_insert_post().never();

        let result = service(post_repo, upload_store)
            .create_post(payload("A picture of my cat", Some(("cat.png", "meow"))))
            .await
            .unwrap_err();

        assert!(matches!(result, CreatePostError::Internal(err) if err.to_string() == "disk full"));
    }

    #[tokio::test]
    async fn test_sweep_removes_uploads_of_expired_posts() {
        let mut post_repo = MockPostRepository::new();
        post_repo
            .expect_delete_expired_posts()
            .once()
            .return_once(|_| Ok(vec![expired_post(1, Some("a.png")), expired_post(2, None)]));
        let mut upload_store = MockUploadStore::new();
        upload_store
            .expect_remove()
            .with(eq("a.png"))
            .once()
            .return_once(|_| Ok(()));

        let swept = service(post_repo, upload_store)
            .sweep_expired_posts()
            .await
            .unwrap();

        assert_eq!(swept.iter().map(|post| post.id).collect::<Vec<_>>(), [1, 2]);
    }

    #[tokio::test]
    async fn test_sweep_ignores_upload_removal_failure() {
        let mut post_repo = MockPostRepository::new();
        post_repo
            .expect_delete_expired_posts()
            .once()
            .return_once(|_| Ok(vec![expired_post(1, Some("a.png")), expired_post(2, Some("b.png"))]));
        let mut upload_store = MockUploadStore::new();
        upload_store
            .expect_remove()
            .with(eq("a.png"))
            .once()
            .return_once(|_| Err(anyhow::anyhow!("permission denied")));
        upload_store
            .expect_remove()
            .with(eq("b.png"))
            .once()
            .return_once(|_| Ok(()));

        let swept = service(post_repo, upload_store)
            .sweep_expired_posts()
            .await
            .unwrap();

        assert_eq!(swept.len(), 2);
    }

    #[tokio::test]
    async fn test_list_posts_sweeps_first() {
        let mut seq = mockall::Sequence::new();
        let mut post_repo = MockPostRepository::new();
        post_repo
            .expect_delete_expired_posts()
            .once()
            .in_sequence(&mut seq)
            .return_once(|_| Ok(Vec::new()));
        let fresh = stored(NewPost {
            description: Description::new("still here".to_owned()).unwrap(),
            image: None,
            created_at: OffsetDateTime::now_utc(),
        });
        post_repo
            .expect_list_unexpired_posts()
            .once()
            .in_sequence(&mut seq)
            .return_once({
                let fresh = fresh.clone();
                move |_| Ok(vec![fresh])
            });

        let posts = service(post_repo, MockUploadStore::new())
            .list_posts()
            .await
            .unwrap();

        assert_eq!(posts, vec![fresh]);
    }

    #[tokio::test]
    async fn test_list_posts_sweep_failure_propagates() {
        let mut post_repo = MockPostRepository::new();
        post_repo
            .expect_delete_expired_posts()
            .once()
            .return_once(|_| Err(anyhow::anyhow!("db down")));
        post_repo.expect_list_unexpired_posts().never();

        let err = service(post_repo, MockUploadStore::new())
            .list_posts()
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "db down");
    }

    #[tokio::test]
    async fn test_add_test_post() {
        let mut post_repo = MockPostRepository::new();
        post_repo
            .expect_insert_post()
            .once()
            .return_once(|new_post| Ok(stored(new_post)));

        let post = service(post_repo, MockUploadStore::new())
            .add_test_post()
            .await
            .unwrap();

        assert_eq!(post.description, TEST_POST_DESCRIPTION);
        assert_eq!(post.image, None);
    }
}
