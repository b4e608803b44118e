use axum::{
    Json,
    extract::{Multipart, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth_service::{AuthService, LoginError},
    post_service::{CreatePostError, CreatePostPayload, PostService, UploadedFile},
    session::{Session, SessionUser},
};

#[derive(Serialize)]
pub struct Status {
    status: String,
}

#[derive(Serialize)]
pub struct Error {
    error: String,
    error_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[instrument(skip_all)]
pub async fn create_post(
    post_service: &dyn PostService,
    user: Option<&SessionUser>,
    multipart: Multipart,
) -> Response {
    if user.is_none() {
        return Redirect::to("/login").into_response();
    }

    let payload = match read_create_post_form(multipart).await {
        Ok(payload) => payload,
        Err(multipart_error) => {
            let err_uuid = Uuid::new_v4();
            info!(?err_uuid, %multipart_error, "User submitted a malformed post form");
            return (
                StatusCode::BAD_REQUEST,
                Json(Error {
                    error: multipart_error.body_text(),
                    error_id: err_uuid.to_string(),
                }),
            )
                .into_response();
        }
    };

    match post_service.create_post(payload).await {
        Ok(post) => {
            info!(post_id = post.id, "Created post");
            Redirect::to("/").into_response()
        }
        Err(CreatePostError::InvalidDescription(error)) => {
            info!(%error, "Rejected post");
            Redirect::to("/new-post").into_response()
        }
        Err(CreatePostError::Internal(error)) => internal_error(&error).into_response(),
    }
}

/// Browsers send an empty `image` part when no file was picked; that counts as no image.
pub async fn read_create_post_form(
    mut multipart: Multipart,
) -> Result<CreatePostPayload, MultipartError> {
    let mut description = String::new();
    let mut image = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(ToOwned::to_owned);
        match name.as_deref() {
            Some("description") => description = field.text().await?,
            Some("image") => {
                let file_name = field.file_name().unwrap_or_default().to_owned();
                let bytes = field.bytes().await?;
                if !file_name.is_empty() && !bytes.is_empty() {
                    image = Some(UploadedFile { file_name, bytes });
                }
            }
            _ => {}
        }
    }

    Ok(CreatePostPayload { description, image })
}

/// Finishes a login once the identity provider sends the browser back.
#[instrument(skip_all)]
pub async fn auth_callback(
    auth_service: &dyn AuthService,
    session: Session,
    query: AuthCallbackQuery,
) -> Response {
    let Some(code) = query.code else {
        warn!(error = ?query.error, "Identity provider did not return an authorization code");
        return (session.abandon_login(), Redirect::to("/")).into_response();
    };

    let login_result = auth_service
        .complete_login(session.oauth_state(), query.state.as_deref(), &code)
        .await;

    match login_result {
        Ok(user) => (session.log_in(user), Redirect::to("/")).into_response(),
        Err(LoginError::StateMismatch) => {
            let err_uuid = Uuid::new_v4();
            info!(?err_uuid, "Login callback state did not match the session");
            (
                StatusCode::BAD_REQUEST,
                session.abandon_login(),
                Json(Error {
                    error: LoginError::StateMismatch.to_string(),
                    error_id: err_uuid.to_string(),
                }),
            )
                .into_response()
        }
        Err(LoginError::Provider(error)) => {
            let err_uuid = Uuid::new_v4();
            error!(?err_uuid, ?error, "Identity provider failed during login");
            (
                StatusCode::BAD_GATEWAY,
                session.abandon_login(),
                Json(Error {
                    error: "Login failed".to_owned(),
                    error_id: err_uuid.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn add_test_post(post_service: &dyn PostService) -> Response {
    match post_service.add_test_post().await {
        Ok(post) => {
            info!(post_id = post.id, "Added test post");
            Json(Status {
                status: "Post added".to_owned(),
            })
            .into_response()
        }
        Err(error) => internal_error(&error).into_response(),
    }
}

pub fn internal_error(error: &anyhow::Error) -> (StatusCode, Json<Error>) {
    let err_uuid = Uuid::new_v4();
    error!(?err_uuid, ?error, "Encountered an error during a request");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Error {
            error: "Internal server error".to_owned(),
            error_id: err_uuid.to_string(),
        }),
    )
}
