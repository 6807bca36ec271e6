//! Record types for the hosted tables and their change feed.
//!
//! Three logical tables live in the record store:
//!
//! - `users`    - one profile per identity (`users.id` is the identity id)
//! - `posts`    - blog posts (`posts.user_id -> users.id`)
//! - `comments` - post comments (`comments.post_id -> posts.id`, `comments.user_id -> users.id`)
//!
//! Rows travel as JSON objects. The typed structs below are the canonical
//! shapes; [`RecordQuery`] is the filter/order/limit grammar used on the REST
//! surface (`col=eq.value`, `order=col.desc`, `limit=n`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Role;

/// A hosted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Posts,
    Users,
    Comments,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Posts, Table::Users, Table::Comments];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Posts => "posts",
            Table::Users => "users",
            Table::Comments => "comments",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Columns in storage order. The first column is always the primary key.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Posts => &[
                "id",
                "user_id",
                "title",
                "slug",
                "excerpt",
                "content",
                "category",
                "published",
                "created_at",
                "updated_at",
            ],
            Table::Users => &["id", "email", "name", "username", "role", "created_at"],
            Table::Comments => &["id", "post_id", "user_id", "author_name", "content", "created_at"],
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    /// Column holding the owning user id, used for row ownership checks.
    pub fn owner_column(&self) -> &'static str {
        match self {
            Table::Users => "id",
            Table::Posts | Table::Comments => "user_id",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Profile row in the `users` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Profile fields supplied by the client; `created_at` is set by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub username: String,
    pub role: Role,
}

/// Blog post row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub user_id: String,
    pub title: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub published: bool,
}

/// Partial update of a post. Only the fields that are set are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
}

/// Comment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    #[serde(default)]
    pub author_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewComment {
    pub post_id: String,
    pub user_id: String,
    pub author_name: String,
    pub content: String,
}

/// Kind of row change published on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// The row after the change (before it, for deletes).
    pub record: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind, record: serde_json::Value) -> Self {
        Self {
            table,
            kind,
            record,
            at: Utc::now(),
        }
    }
}

/// Sort direction for [`RecordQuery::order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

/// Equality filters, ordering and limit for a select/update/delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// `(column, value)` pairs, all of which must match.
    pub filters: Vec<(String, String)>,
    pub order: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order = Some((column.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Encode as query-string pairs.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(col, val)| (col.clone(), format!("eq.{}", val)))
            .collect();
        if let Some((col, dir)) = &self.order {
            let dir = match dir {
                Direction::Asc => "asc",
                Direction::Desc => "desc",
            };
            pairs.push(("order".to_string(), format!("{}.{}", col, dir)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }

    /// Decode from query-string pairs. Unknown reserved keys and malformed
    /// values are reported as errors; non-filter keys listed in `ignore` are skipped.
    pub fn from_pairs<'a, I>(pairs: I, ignore: &[&str]) -> Result<Self, String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut query = RecordQuery::new();
        for (key, value) in pairs {
            if ignore.contains(&key) {
                continue;
            }
            match key {
                "order" => {
                    let (col, dir) = value
                        .rsplit_once('.')
                        .ok_or_else(|| format!("invalid order: {}", value))?;
                    let dir = match dir {
                        "asc" => Direction::Asc,
                        "desc" => Direction::Desc,
                        other => return Err(format!("invalid order direction: {}", other)),
                    };
                    query.order = Some((col.to_string(), dir));
                }
                "limit" => {
                    let limit = value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid limit: {}", value))?;
                    query.limit = Some(limit);
                }
                column => {
                    let val = value
                        .strip_prefix("eq.")
                        .ok_or_else(|| format!("unsupported filter for {}: {}", column, value))?;
                    query.filters.push((column.to_string(), val.to_string()));
                }
            }
        }
        Ok(query)
    }
}
