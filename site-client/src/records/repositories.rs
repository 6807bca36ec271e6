//! Typed repositories over [`RecordStore`].

use std::sync::Arc;

use serde_json::{json, Value};

use site_common::{
    Comment, Direction, NewComment, NewPost, NewProfile, Post, PostPatch, RecordQuery, Role,
    Table, UserProfile,
};

use super::{decode_first, decode_rows, RecordStore, UpsertMode};
use crate::error::RecordError;

fn to_row<T: serde::Serialize>(value: &T) -> Result<Value, RecordError> {
    Ok(serde_json::to_value(value)?)
}

/// Profiles in the `users` table.
#[derive(Clone)]
pub struct ProfileRepository {
    store: Arc<dyn RecordStore>,
}

impl ProfileRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// The profile for `id`, or `None` when no row exists.
    pub async fn get(&self, id: &str) -> Result<Option<UserProfile>, RecordError> {
        let query = RecordQuery::new().eq("id", id).limit(1);
        let rows = self.store.select(Table::Users, &query).await?;
        Ok(decode_rows(rows)?.into_iter().next())
    }

    /// Create or overwrite the profile row keyed by `profile.id`.
    pub async fn upsert(&self, profile: &NewProfile) -> Result<UserProfile, RecordError> {
        let rows = self
            .store
            .upsert(Table::Users, to_row(profile)?, UpsertMode::Merge)
            .await?;
        decode_first(rows, &format!("profile {}", profile.id))
    }

    /// Create the profile row unless one already exists. Returns `true` when
    /// a row was created.
    pub async fn create_if_missing(&self, profile: &NewProfile) -> Result<bool, RecordError> {
        let rows = self
            .store
            .upsert(Table::Users, to_row(profile)?, UpsertMode::IgnoreDuplicates)
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn list(&self) -> Result<Vec<UserProfile>, RecordError> {
        let query = RecordQuery::new().order_by("created_at", Direction::Desc);
        decode_rows(self.store.select(Table::Users, &query).await?)
    }

    /// Change a user's role. Only admins are allowed to do this.
    pub async fn set_role(&self, id: &str, role: Role) -> Result<UserProfile, RecordError> {
        let query = RecordQuery::new().eq("id", id);
        let rows = self
            .store
            .update(Table::Users, &query, json!({ "role": role }))
            .await?;
        decode_first(rows, &format!("profile {}", id))
    }
}

/// Blog posts.
#[derive(Clone)]
pub struct PostRepository {
    store: Arc<dyn RecordStore>,
}

impl PostRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Published posts, newest first.
    pub async fn list_published(&self, limit: Option<usize>) -> Result<Vec<Post>, RecordError> {
        let mut query = RecordQuery::new()
            .eq("published", "true")
            .order_by("created_at", Direction::Desc);
        query.limit = limit;
        decode_rows(self.store.select(Table::Posts, &query).await?)
    }

    /// Every post by `user_id`, drafts included.
    pub async fn list_by_author(&self, user_id: &str) -> Result<Vec<Post>, RecordError> {
        let query = RecordQuery::new()
            .eq("user_id", user_id)
            .order_by("created_at", Direction::Desc);
        decode_rows(self.store.select(Table::Posts, &query).await?)
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<Post>, RecordError> {
        let query = RecordQuery::new().eq("slug", slug).limit(1);
        let rows = self.store.select(Table::Posts, &query).await?;
        Ok(decode_rows(rows)?.into_iter().next())
    }

    pub async fn create(&self, post: &NewPost) -> Result<Post, RecordError> {
        let rows = self.store.insert(Table::Posts, to_row(post)?).await?;
        decode_first(rows, &format!("post {}", post.slug))
    }

    /// Apply `patch` to post `id`. No version check: concurrent updates land
    /// in the order the store receives them.
    pub async fn update(&self, id: &str, patch: &PostPatch) -> Result<Post, RecordError> {
        let query = RecordQuery::new().eq("id", id);
        let rows = self.store.update(Table::Posts, &query, to_row(patch)?).await?;
        decode_first(rows, &format!("post {}", id))
    }

    /// Delete a post's comments, then the post.
    ///
    /// The two deletes are independent calls. If the second fails the
    /// comments are already gone.
    pub async fn delete_with_comments(&self, id: &str) -> Result<(), RecordError> {
        let comments = RecordQuery::new().eq("post_id", id);
        let removed = self.store.delete(Table::Comments, &comments).await?;
        tracing::debug!("Deleted {} comments of post {}", removed.len(), id);

        let post = RecordQuery::new().eq("id", id);
        let rows = self.store.delete(Table::Posts, &post).await?;
        if rows.is_empty() {
            return Err(RecordError::NotFound(format!("post {}", id)));
        }
        Ok(())
    }
}

/// Post comments.
#[derive(Clone)]
pub struct CommentRepository {
    store: Arc<dyn RecordStore>,
}

impl CommentRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Comments on `post_id`, oldest first.
    pub async fn list_for_post(&self, post_id: &str) -> Result<Vec<Comment>, RecordError> {
        let query = RecordQuery::new()
            .eq("post_id", post_id)
            .order_by("created_at", Direction::Asc);
        decode_rows(self.store.select(Table::Comments, &query).await?)
    }

    pub async fn create(&self, comment: &NewComment) -> Result<Comment, RecordError> {
        let rows = self.store.insert(Table::Comments, to_row(comment)?).await?;
        decode_first(rows, "comment")
    }

    pub async fn delete(&self, id: &str) -> Result<(), RecordError> {
        let query = RecordQuery::new().eq("id", id);
        let rows = self.store.delete(Table::Comments, &query).await?;
        if rows.is_empty() {
            return Err(RecordError::NotFound(format!("comment {}", id)));
        }
        Ok(())
    }
}
