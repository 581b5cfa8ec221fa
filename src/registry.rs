use std::sync::Arc;

use tracing::debug;

use crate::{
    config::LoaderConfig,
    entity::{self, ListLoader, PointLoader},
    error::ConfigError,
    model::{Comment, ScripturePassage, Session, SessionParticipant, User},
    store::DataStore,
};

/// The full set of entity loaders for one request (or one subscription
/// connection).
///
/// Build a new set for every request and drop it when the request is done.
/// Nothing is shared between two sets, not even their caches, so one request
/// can never observe rows another request loaded.
pub struct Loaders {
    pub users: PointLoader<User>,
    pub sessions: PointLoader<Session>,
    pub passages: PointLoader<ScripturePassage>,
    pub comments: PointLoader<Comment>,
    pub passages_by_session: ListLoader<ScripturePassage>,
    pub participants_by_session: ListLoader<SessionParticipant>,
    pub comments_by_passage: ListLoader<Comment>,
    pub replies_by_parent: ListLoader<Comment>,
}

impl Loaders {
    /// Build a loader set with the default configuration.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self::build(store, &LoaderConfig::default())
    }

    /// Build a loader set, rejecting an invalid configuration before any
    /// loader exists.
    pub fn with_config(store: Arc<dyn DataStore>, config: &LoaderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(store, config))
    }

    fn build(store: Arc<dyn DataStore>, config: &LoaderConfig) -> Self {
        debug!(window = ?config.window, cache = config.cache, "creating loaders");

        Self {
            users: entity::user_loader(Arc::clone(&store), config),
            sessions: entity::session_loader(Arc::clone(&store), config),
            passages: entity::passage_loader(Arc::clone(&store), config),
            comments: entity::comment_loader(Arc::clone(&store), config),
            passages_by_session: entity::passages_by_session_loader(Arc::clone(&store), config),
            participants_by_session: entity::participants_by_session_loader(Arc::clone(&store), config),
            comments_by_passage: entity::comments_by_passage_loader(Arc::clone(&store), config),
            replies_by_parent: entity::replies_by_parent_loader(store, config),
        }
    }

    /// Close the current batch of every loader. With a manual window, call
    /// this once per level of the result tree.
    pub fn dispatch_all(&self) {
        self.users.dispatch();
        self.sessions.dispatch();
        self.passages.dispatch();
        self.comments.dispatch();
        self.passages_by_session.dispatch();
        self.participants_by_session.dispatch();
        self.comments_by_passage.dispatch();
        self.replies_by_parent.dispatch();
    }

    /// Drop every memoized value, e.g. after a mutation changed rows this
    /// request has already loaded.
    pub fn clear_all(&self) {
        self.users.clear_all();
        self.sessions.clear_all();
        self.passages.clear_all();
        self.comments.clear_all();
        self.passages_by_session.clear_all();
        self.participants_by_session.clear_all();
        self.comments_by_passage.clear_all();
        self.replies_by_parent.clear_all();
    }
}

impl std::fmt::Debug for Loaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loaders")
            .field("users", &self.users.cached_len())
            .field("sessions", &self.sessions.cached_len())
            .field("passages", &self.passages.cached_len())
            .field("comments", &self.comments.cached_len())
            .finish_non_exhaustive()
    }
}
