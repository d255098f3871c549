use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub reply_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub post_id: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One page of a cursor-paginated listing. A missing `next_cursor` means the
/// listing is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A unit of text handed to the analyzer: the post body itself or one comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub post_id: String,
    /// Post id for the post body, comment id for comments.
    pub source_id: String,
    pub text: String,
    pub author: String,
}

impl AnalysisContext {
    pub fn from_post(post: &Post) -> Self {
        Self {
            post_id: post.id.clone(),
            source_id: post.id.clone(),
            text: post.text.clone(),
            author: post.author.clone(),
        }
    }

    pub fn from_comment(comment: &Comment) -> Self {
        Self {
            post_id: comment.post_id.clone(),
            source_id: comment.id.clone(),
            text: comment.text.clone(),
            author: comment.author.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// -1.0 (negative) ..= 1.0 (positive).
    pub sentiment: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub event_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub recent_events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEvent {
    pub id: String,
    pub post_id: String,
    pub source_id: String,
    pub sentiment: f64,
    pub keywords: Vec<String>,
    pub event_type: String,
    pub tags: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

impl DerivedEvent {
    pub fn new(ctx: &AnalysisContext, result: AnalysisResult) -> Self {
        Self {
            id: derived_event_id(&ctx.post_id, &ctx.source_id),
            post_id: ctx.post_id.clone(),
            source_id: ctx.source_id.clone(),
            sentiment: result.sentiment,
            keywords: result.keywords,
            event_type: result.event_type,
            tags: result.tags,
            analyzed_at: Utc::now(),
        }
    }
}

/// Stable id so a re-delivered task upserts the same row.
pub fn derived_event_id(post_id: &str, source_id: &str) -> String {
    let name = format!("{post_id}/{source_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Unit of work published to the task queue: harvest one post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestTask {
    pub id: String,
    pub post: Post,
    pub enqueued_at: DateTime<Utc>,
}

impl HarvestTask {
    pub fn new(post: Post) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            post,
            enqueued_at: Utc::now(),
        }
    }
}
