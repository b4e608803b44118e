use anyhow::Context;
use fleeting_posts::{config, post_service::post_service_capsule};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    if let Err(err) = dotenvy::dotenv() {
        debug!(?err, "No .env file loaded");
    }

    let container = config::init_container().await?;

    let swept = container
        .read(post_service_capsule)
        .sweep_expired_posts()
        .await
        .context("Failed to sweep expired posts")?;
    info!(count = swept.len(), "Sweep finished");
    Ok(())
}
