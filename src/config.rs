use std::{
    env::{self, VarError},
    path::PathBuf,
};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use tracing::{info, instrument, warn};
use url::Url;

use crate::post_repo::create_posts_table;

/// # Errors
/// Will return [`Err`] if the connection to the database fails
/// or the `posts` table cannot be created.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!(?db_connection_options, "Connecting to database");
    let db = Database::connect(db_connection_options).await?;
    create_posts_table(&db).await?;
    set_db_conn(db);

    info!("Container initialized");
    Ok(container)
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
fn required_env_var(name: &str) -> String {
    env::var(name).unwrap_or_else(|err| match err {
        VarError::NotPresent => panic!("{name} is not set"),
        VarError::NotUnicode(actual) => {
            panic!("{name} is invalid unicode: {}", actual.display());
        }
    })
}

/// # Panics
/// Panics when environment variable is invalid.
fn optional_env_var(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) => {
            info!(value, "{name} environment variable set");
            value
        }
        Err(VarError::NotPresent) => {
            warn!(
                value = default,
                "{name} environment variable not set; defaulting to {default}"
            );
            default.to_owned()
        }
        Err(VarError::NotUnicode(actual)) => {
            panic!("{name} environment variable is invalid: {}", actual.display());
        }
    }
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    required_env_var("DB_URL").into()
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    optional_env_var("ADDR", "127.0.0.1:8000")
}

/// Root directory served under `/static`.
///
/// # Panics
/// Panics when environment variable is invalid.
pub fn static_dir_capsule(_: CapsuleHandle) -> PathBuf {
    optional_env_var("STATIC_DIR", "static").into()
}

pub fn upload_dir_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> PathBuf {
    get.as_ref(static_dir_capsule).join("uploads")
}

/// The externally visible base URL of this server, used to build OAuth redirect URIs.
///
/// # Panics
/// Panics when environment variable is invalid or is not a URL.
pub fn public_url_capsule(_: CapsuleHandle) -> Url {
    const ENV_VAR_NAME: &str = "PUBLIC_URL";
    let public_url = optional_env_var(ENV_VAR_NAME, "http://localhost:8000");
    Url::parse(&public_url)
        .unwrap_or_else(|err| panic!("{ENV_VAR_NAME} is not a valid URL ({public_url}): {err}"))
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
pub fn secret_key_capsule(_: CapsuleHandle) -> String {
    required_env_var("SECRET_KEY")
}

#[derive(Clone)]
pub struct GoogleCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// # Panics
/// Panics when either environment variable is not set or is invalid.
pub fn google_credentials_capsule(_: CapsuleHandle) -> GoogleCredentials {
    GoogleCredentials {
        client_id: required_env_var("GOOGLE_CLIENT_ID"),
        client_secret: required_env_var("GOOGLE_CLIENT_SECRET"),
    }
}
