//! Per-request resolver context.
//!
//! A GraphQL server builds one [`RequestContext`] per HTTP request, and one
//! per WebSocket connection for subscriptions. Field resolvers reach the
//! loaders through it, e.g. `Comment.user` resolves with
//! [`RequestContext::comment_author`].

use std::sync::Arc;

use futures::future::{try_join, try_join_all, TryFutureExt};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::LoaderConfig,
    error::{ConfigError, StoreResult},
    model::{Comment, ScripturePassage, Session, SessionParticipant, User},
    registry::Loaders,
    store::DataStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Request,
    Connection,
}

/// A top-level comment with its author and direct replies.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread {
    pub comment: Comment,
    pub author: Option<User>,
    pub replies: Vec<Comment>,
}

pub struct RequestContext {
    scope: Scope,
    viewer: Option<Uuid>,
    store: Arc<dyn DataStore>,
    pub loaders: Loaders,
}

impl RequestContext {
    /// Context for one query or mutation request.
    pub fn for_request(
        store: Arc<dyn DataStore>,
        config: &LoaderConfig,
        viewer: Option<Uuid>,
    ) -> Result<Self, ConfigError> {
        Self::new(Scope::Request, store, config, viewer)
    }

    /// Context for a subscription connection. Its loaders live as long as the
    /// connection.
    pub fn for_connection(
        store: Arc<dyn DataStore>,
        config: &LoaderConfig,
        viewer: Option<Uuid>,
    ) -> Result<Self, ConfigError> {
        Self::new(Scope::Connection, store, config, viewer)
    }

    fn new(
        scope: Scope,
        store: Arc<dyn DataStore>,
        config: &LoaderConfig,
        viewer: Option<Uuid>,
    ) -> Result<Self, ConfigError> {
        let loaders = Loaders::with_config(Arc::clone(&store), config)?;
        debug!(?scope, ?viewer, "built resolver context");

        Ok(Self {
            scope,
            viewer,
            store,
            loaders,
        })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// The authenticated user, if any.
    pub fn viewer(&self) -> Option<Uuid> {
        self.viewer
    }

    /// The store handle, for mutations. Reads should go through the loaders.
    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub async fn comment_author(&self, comment: &Comment) -> StoreResult<Option<User>> {
        self.loaders.users.load(comment.user_id).await
    }

    pub async fn session_leader(&self, session: &Session) -> StoreResult<Option<User>> {
        self.loaders.users.load(session.leader_id).await
    }

    pub async fn session_passages(&self, session_id: Uuid) -> StoreResult<Vec<ScripturePassage>> {
        self.loaders.passages_by_session.load(session_id).await
    }

    pub async fn session_participants(&self, session_id: Uuid) -> StoreResult<Vec<SessionParticipant>> {
        self.loaders.participants_by_session.load(session_id).await
    }

    /// The discussion on a passage: its top-level comments, oldest first,
    /// each with its author and replies. Loads one level at a time, so this
    /// costs at most three store queries however many comments there are.
    ///
    /// With a manual batch window, someone must call
    /// [`Loaders::dispatch_all`] for each level while this is pending.
    pub async fn passage_thread(&self, passage_id: Uuid) -> StoreResult<Vec<CommentThread>> {
        let comments = self.loaders.comments_by_passage.load(passage_id).await?;

        try_join_all(comments.into_iter().map(|comment| {
            let author = self.loaders.users.load(comment.user_id);
            let replies = self.loaders.replies_by_parent.load(comment.id);

            try_join(author, replies).map_ok(move |(author, replies)| CommentThread {
                comment,
                author,
                replies,
            })
        }))
        .await
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("scope", &self.scope)
            .field("viewer", &self.viewer)
            .field("loaders", &self.loaders)
            .finish()
    }
}
