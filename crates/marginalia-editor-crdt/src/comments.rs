//! Comment threads and the service that stores them.
//!
//! Threads live outside the replicated document. The only link between the
//! two is the thread id, used as the `thread:<id>` anchor mark.

use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use tokio::sync::watch;

use marginalia_editor_core::Document;

use crate::error::CommentError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: SmolStr,
    pub author: SmolStr,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentThread {
    pub id: SmolStr,
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub resolved: bool,
}

/// The external comment-thread service.
pub trait CommentService {
    /// Create a thread whose first comment is `body`. The returned id is what
    /// gets bound as the anchor.
    fn create_thread(
        &self,
        author: &str,
        body: &str,
    ) -> impl Future<Output = Result<CommentThread, CommentError>> + Send;

    fn list_threads(&self) -> impl Future<Output = Vec<CommentThread>> + Send;

    fn reply(
        &self,
        thread_id: &str,
        author: &str,
        body: &str,
    ) -> impl Future<Output = Result<Comment, CommentError>> + Send;

    fn edit_comment(
        &self,
        thread_id: &str,
        comment_id: &str,
        body: &str,
    ) -> impl Future<Output = Result<(), CommentError>> + Send;

    /// Delete a comment. Deleting the last comment deletes the thread.
    fn delete_comment(
        &self,
        thread_id: &str,
        comment_id: &str,
    ) -> impl Future<Output = Result<(), CommentError>> + Send;

    fn set_resolved(
        &self,
        thread_id: &str,
        resolved: bool,
    ) -> impl Future<Output = Result<(), CommentError>> + Send;
}

/// In-process comment service. Subscribers see every change to the list.
#[derive(Debug)]
pub struct MemoryCommentService {
    threads: watch::Sender<Vec<CommentThread>>,
    next_id: AtomicU64,
}

impl Default for MemoryCommentService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCommentService {
    pub fn new() -> Self {
        let (threads, _) = watch::channel(Vec::new());
        Self {
            threads,
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive the thread list now and after every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<CommentThread>> {
        self.threads.subscribe()
    }

    fn mint(&self, prefix: &str) -> SmolStr {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format_smolstr!("{prefix}_{n}")
    }

    fn comment(&self, author: &str, body: &str) -> Result<Comment, CommentError> {
        if body.trim().is_empty() {
            return Err(CommentError::EmptyBody);
        }
        Ok(Comment {
            id: self.mint("c"),
            author: SmolStr::new(author),
            body: body.to_string(),
            created_at: Utc::now(),
        })
    }

    fn with_thread<R>(
        &self,
        thread_id: &str,
        f: impl FnOnce(&mut Vec<CommentThread>, usize) -> Result<R, CommentError>,
    ) -> Result<R, CommentError> {
        let mut result = Err(CommentError::UnknownThread(SmolStr::new(thread_id)));
        self.threads.send_if_modified(|threads| {
            let Some(idx) = threads.iter().position(|t| t.id == thread_id) else {
                return false;
            };
            result = f(threads, idx);
            result.is_ok()
        });
        result
    }
}

impl CommentService for MemoryCommentService {
    async fn create_thread(&self, author: &str, body: &str) -> Result<CommentThread, CommentError> {
        let comment = self.comment(author, body)?;
        let thread = CommentThread {
            id: self.mint("th"),
            comments: vec![comment],
            resolved: false,
        };
        tracing::debug!(thread_id = %thread.id, "created comment thread");
        self.threads.send_modify(|threads| threads.push(thread.clone()));
        Ok(thread)
    }

    async fn list_threads(&self) -> Vec<CommentThread> {
        self.threads.borrow().clone()
    }

    async fn reply(&self, thread_id: &str, author: &str, body: &str) -> Result<Comment, CommentError> {
        let comment = self.comment(author, body)?;
        self.with_thread(thread_id, |threads, idx| {
            threads[idx].comments.push(comment.clone());
            Ok(comment)
        })
    }

    async fn edit_comment(
        &self,
        thread_id: &str,
        comment_id: &str,
        body: &str,
    ) -> Result<(), CommentError> {
        if body.trim().is_empty() {
            return Err(CommentError::EmptyBody);
        }
        self.with_thread(thread_id, |threads, idx| {
            let comment = threads[idx]
                .comments
                .iter_mut()
                .find(|c| c.id == comment_id)
                .ok_or_else(|| unknown_comment(thread_id, comment_id))?;
            comment.body = body.to_string();
            Ok(())
        })
    }

    async fn delete_comment(&self, thread_id: &str, comment_id: &str) -> Result<(), CommentError> {
        self.with_thread(thread_id, |threads, idx| {
            let comments = &mut threads[idx].comments;
            let pos = comments
                .iter()
                .position(|c| c.id == comment_id)
                .ok_or_else(|| unknown_comment(thread_id, comment_id))?;
            comments.remove(pos);
            if comments.is_empty() {
                threads.remove(idx);
            }
            Ok(())
        })
    }

    async fn set_resolved(&self, thread_id: &str, resolved: bool) -> Result<(), CommentError> {
        self.with_thread(thread_id, |threads, idx| {
            threads[idx].resolved = resolved;
            Ok(())
        })
    }
}

fn unknown_comment(thread: &str, comment: &str) -> CommentError {
    CommentError::UnknownComment {
        thread: SmolStr::new(thread),
        comment: SmolStr::new(comment),
    }
}

/// Threads split by whether their anchor is still in the document.
///
/// Unanchored threads are shown in a flat list instead of inline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadOverview {
    pub anchored: Vec<(CommentThread, Vec<Range<usize>>)>,
    pub unanchored: Vec<CommentThread>,
}

impl ThreadOverview {
    pub fn new(threads: impl IntoIterator<Item = CommentThread>, doc: &Document) -> Self {
        let mut ranges = doc.thread_ranges();
        let mut overview = Self::default();
        for thread in threads {
            match ranges.remove(&thread.id) {
                Some(found) if !found.is_empty() => overview.anchored.push((thread, found)),
                _ => overview.unanchored.push(thread),
            }
        }
        // Document order for the inline list.
        overview
            .anchored
            .sort_by_key(|(_, ranges)| ranges.first().map(|r| r.start));
        overview
    }
}
