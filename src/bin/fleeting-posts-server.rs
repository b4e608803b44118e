use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing,
};
use fleeting_posts::{
    auth_service::auth_service_capsule,
    config,
    identity::{AuthorizeUrl, GoogleIdentityProvider},
    pages::page_renderer_capsule,
    post_service::post_service_capsule,
    session::{Session, session_settings_capsule},
    web::{self, AuthCallbackQuery, internal_error},
};
use rearch::Container;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, instrument};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    if let Err(err) = dotenvy::dotenv() {
        debug!(?err, "No .env file loaded");
    }

    let container = config::init_container().await?;
    // NOTE: read eagerly so missing configuration fails at startup instead of on first request
    let _ = container.read((
        session_settings_capsule,
        auth_service_capsule,
        page_renderer_capsule,
    ));

    let app = Router::new()
        .route("/", routing::get(home))
        .route("/new-post", routing::get(new_post))
        .route(
            "/create-post",
            routing::post(create_post).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/login", routing::get(login))
        .route(
            GoogleIdentityProvider::CALLBACK_PATH,
            routing::get(auth_callback),
        )
        .route("/logout", routing::get(logout))
        .route("/add-test-post", routing::get(add_test_post))
        .nest_service(
            "/static",
            ServeDir::new(container.read(config::static_dir_capsule)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(container.clone());

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument(skip_all)]
async fn home(State(container): State<Container>, session: Session) -> Response {
    let (post_service, renderer) = container.read((post_service_capsule, page_renderer_capsule));

    let posts = match post_service.list_posts().await {
        Ok(posts) => posts,
        Err(error) => return internal_error(&error).into_response(),
    };

    renderer
        .render_home(posts, session.user(), OffsetDateTime::now_utc())
        .map_or_else(
            |error| internal_error(&error).into_response(),
            |html| Html(html).into_response(),
        )
}

#[instrument(skip_all)]
async fn new_post(State(container): State<Container>, session: Session) -> Response {
    let Some(user) = session.user() else {
        return Redirect::to("/login").into_response();
    };

    container
        .read(page_renderer_capsule)
        .render_create_post(user)
        .map_or_else(
            |error| internal_error(&error).into_response(),
            |html| Html(html).into_response(),
        )
}

async fn create_post(
    State(container): State<Container>,
    session: Session,
    multipart: Multipart,
) -> Response {
    let post_service = container.read(post_service_capsule);
    web::create_post(post_service.as_ref(), session.user(), multipart).await
}

#[instrument(skip_all)]
async fn login(State(container): State<Container>, session: Session) -> impl IntoResponse {
    let AuthorizeUrl { url, state } = container.read(auth_service_capsule).start_login();
    (session.begin_login(state), Redirect::to(url.as_str()))
}

async fn auth_callback(
    State(container): State<Container>,
    session: Session,
    Query(query): Query<AuthCallbackQuery>,
) -> Response {
    let auth_service = container.read(auth_service_capsule);
    web::auth_callback(auth_service.as_ref(), session, query).await
}

#[instrument(skip_all)]
async fn logout(session: Session) -> impl IntoResponse {
    (session.clear(), Redirect::to("/"))
}

async fn add_test_post(State(container): State<Container>) -> Response {
    let post_service = container.read(post_service_capsule);
    web::add_test_post(post_service.as_ref()).await
}
