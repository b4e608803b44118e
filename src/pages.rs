use std::sync::Arc;

use anyhow::Context as _;
use rearch::CapsuleHandle;
use serde::Serialize;
use tera::{Context, Tera};
use time::{
    Duration, OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description,
};
use tracing::instrument;

use crate::{post_repo::Post, session::SessionUser};

const BASE_TEMPLATE: &str = "base.html";
const HOME_TEMPLATE: &str = "home.html";
const CREATE_POST_TEMPLATE: &str = "create_post.html";

const CREATED_AT_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute] UTC");

/// # Panics
/// Panics if the embedded templates fail to parse.
pub fn page_renderer_capsule(_: CapsuleHandle) -> Arc<PageRenderer> {
    Arc::new(PageRenderer::new().expect("embedded templates should parse"))
}

pub struct PageRenderer {
    tera: Tera,
}

#[derive(Debug, Serialize)]
struct PostView {
    id: i32,
    description: String,
    image_url: Option<String>,
    created_at: String,
    expires_in: String,
}

#[derive(Serialize)]
struct HomePage<'a> {
    posts: Vec<PostView>,
    user: Option<&'a SessionUser>,
}

#[derive(Serialize)]
struct CreatePostPage<'a> {
    user: &'a SessionUser,
}

impl PageRenderer {
    /// # Errors
    /// Will return [`Err`] if a template does not parse.
    pub fn new() -> tera::Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (BASE_TEMPLATE, include_str!("../templates/base.html")),
            (HOME_TEMPLATE, include_str!("../templates/home.html")),
            (
                CREATE_POST_TEMPLATE,
                include_str!("../templates/create_post.html"),
            ),
        ])?;
        Ok(Self { tera })
    }

    /// # Errors
    /// Will return [`Err`] if rendering fails.
    #[instrument(skip_all, fields(posts = posts.len()))]
    pub fn render_home(
        &self,
        posts: Vec<Post>,
        user: Option<&SessionUser>,
        now: OffsetDateTime,
    ) -> anyhow::Result<String> {
        let posts = posts
            .into_iter()
            .map(|post| PostView::new(post, now))
            .collect::<anyhow::Result<_>>()?;
        self.render(HOME_TEMPLATE, &HomePage { posts, user })
    }

    /// # Errors
    /// Will return [`Err`] if rendering fails.
    pub fn render_create_post(&self, user: &SessionUser) -> anyhow::Result<String> {
        self.render(CREATE_POST_TEMPLATE, &CreatePostPage { user })
    }

    fn render(&self, template: &str, page: &impl Serialize) -> anyhow::Result<String> {
        let context = Context::from_serialize(page)
            .with_context(|| format!("Failed to build context for {template}"))?;
        self.tera
            .render(template, &context)
            .with_context(|| format!("Failed to render {template}"))
    }
}

impl PostView {
    fn new(post: Post, now: OffsetDateTime) -> anyhow::Result<Self> {
        Ok(Self {
            id: post.id,
            image_url: post.image.map(|image| format!("/static/uploads/{image}")),
            created_at: post
                .created_at
                .format(CREATED_AT_FORMAT)
                .context("Failed to format post creation time")?,
            expires_in: humanize_remaining(post.expires_at - now),
            description: post.description,
        })
    }
}

fn humanize_remaining(remaining: Duration) -> String {
    let plural = |count: i64, unit: &str| {
        if count == 1 {
            format!("1 {unit}")
        } else {
            format!("{count} {unit}s")
        }
    };

    if remaining.whole_days() >= 1 {
        plural(remaining.whole_days(), "day")
    } else if remaining.whole_hours() >= 1 {
        plural(remaining.whole_hours(), "hour")
    } else if remaining.whole_minutes() >= 1 {
        plural(remaining.whole_minutes(), "minute")
    } else {
        "less than a minute".to_owned()
    }
}
