//! The entity loaders: one [`Loader`] per table and access pattern, each
//! closing over the request's [`DataStore`] handle.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use uuid::Uuid;

use crate::{
    batch::BatchRules,
    config::LoaderConfig,
    data::{KeySet, ValueSet},
    error::StoreError,
    loader::Loader,
    model::{Comment, ScripturePassage, Session, SessionParticipant, User},
    store::{Column, DataStore, FindMany, Record},
    window::BatchWindow,
};

pub type FetchFuture<Value> = BoxFuture<'static, Result<ValueSet<Value, StoreError>, StoreError>>;

/// A boxed batch function, so that every entity loader has a nameable type.
pub type FetchFn<Value> = Box<dyn Fn(KeySet<Uuid>) -> FetchFuture<Value> + Send + Sync>;

pub type EntityLoader<Value> = Loader<Uuid, FetchFn<Value>, BatchWindow>;

/// Loads rows by primary key. A key with no row resolves to `None`.
pub type PointLoader<Row> = EntityLoader<Option<Row>>;

/// Loads the children of a parent key. A key with no children resolves to an
/// empty list.
pub type ListLoader<Row> = EntityLoader<Vec<Row>>;

fn build<Value: Clone>(config: &LoaderConfig, batcher: FetchFn<Value>) -> EntityLoader<Value> {
    let rules = BatchRules {
        batcher,
        window: config.batch_window(),
        max_keys: config.max_keys(),
    };

    if config.cache {
        Loader::new(rules)
    } else {
        Loader::uncached(rules)
    }
}

async fn fetch_by_id<Row: Record>(
    store: Arc<dyn DataStore>,
    keys: KeySet<Uuid>,
) -> Result<ValueSet<Option<Row>, StoreError>, StoreError> {
    let rows = Row::find_many(&*store, FindMany::by(Column::Id, keys.to_vec())).await?;
    Ok(keys.lookup(rows))
}

/// A loader for `Row` by primary key: one `id IN (...)` query per batch.
pub fn point_loader<Row: Record>(store: Arc<dyn DataStore>, config: &LoaderConfig) -> PointLoader<Row> {
    build(
        config,
        Box::new(move |keys: KeySet<Uuid>| fetch_by_id::<Row>(Arc::clone(&store), keys).boxed()),
    )
}

/// The shape of a one-to-many lookup.
pub struct ListShape<Row> {
    /// Column holding the parent key
    pub foreign_key: Column,
    /// Only rows with no parent comment
    pub top_level_only: bool,
    /// Secondary order of each group
    pub order_by: Column,
    pub parent_of: fn(&Row) -> Option<&Uuid>,
    pub compare: fn(&Row, &Row) -> Ordering,
}

impl<Row> Clone for ListShape<Row> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Row> Copy for ListShape<Row> {}

async fn fetch_children<Row: Record>(
    store: Arc<dyn DataStore>,
    shape: ListShape<Row>,
    keys: KeySet<Uuid>,
) -> Result<ValueSet<Vec<Row>, StoreError>, StoreError> {
    let mut query = FindMany::by(shape.foreign_key, keys.to_vec()).order_by(shape.order_by);
    if shape.top_level_only {
        query = query.top_level_only();
    }

    let rows = Row::find_many(&*store, query).await?;
    Ok(keys.group_by(rows, shape.parent_of, shape.compare))
}

/// A loader for the `Row`s belonging to each parent key: one
/// `foreign_key IN (...)` query per batch, grouped by parent and sorted.
pub fn list_loader<Row: Record>(
    store: Arc<dyn DataStore>,
    config: &LoaderConfig,
    shape: ListShape<Row>,
) -> ListLoader<Row> {
    build(
        config,
        Box::new(move |keys: KeySet<Uuid>| fetch_children(Arc::clone(&store), shape, keys).boxed()),
    )
}

pub fn user_loader(store: Arc<dyn DataStore>, config: &LoaderConfig) -> PointLoader<User> {
    point_loader(store, config)
}

pub fn session_loader(store: Arc<dyn DataStore>, config: &LoaderConfig) -> PointLoader<Session> {
    point_loader(store, config)
}

pub fn passage_loader(store: Arc<dyn DataStore>, config: &LoaderConfig) -> PointLoader<ScripturePassage> {
    point_loader(store, config)
}

pub fn comment_loader(store: Arc<dyn DataStore>, config: &LoaderConfig) -> PointLoader<Comment> {
    point_loader(store, config)
}

/// Passages of each session, in display order.
pub fn passages_by_session_loader(
    store: Arc<dyn DataStore>,
    config: &LoaderConfig,
) -> ListLoader<ScripturePassage> {
    list_loader::<ScripturePassage>(
        store,
        config,
        ListShape {
            foreign_key: Column::SessionId,
            top_level_only: false,
            order_by: Column::Order,
            parent_of: |passage| Some(&passage.session_id),
            compare: |a, b| a.order.cmp(&b.order),
        },
    )
}

/// Participants of each session, earliest joiner first.
pub fn participants_by_session_loader(
    store: Arc<dyn DataStore>,
    config: &LoaderConfig,
) -> ListLoader<SessionParticipant> {
    list_loader::<SessionParticipant>(
        store,
        config,
        ListShape {
            foreign_key: Column::SessionId,
            top_level_only: false,
            order_by: Column::JoinedAt,
            parent_of: |participant| Some(&participant.session_id),
            compare: |a, b| a.joined_at.cmp(&b.joined_at),
        },
    )
}

/// Top-level comments of each passage, oldest first. Replies are left to
/// [`replies_by_parent_loader`].
pub fn comments_by_passage_loader(store: Arc<dyn DataStore>, config: &LoaderConfig) -> ListLoader<Comment> {
    list_loader::<Comment>(
        store,
        config,
        ListShape {
            foreign_key: Column::PassageId,
            top_level_only: true,
            order_by: Column::CreatedAt,
            parent_of: |comment| Some(&comment.passage_id),
            compare: |a, b| a.created_at.cmp(&b.created_at),
        },
    )
}

/// Direct replies to each comment, oldest first. Top-level comments have no
/// parent and so are never grouped under any key.
pub fn replies_by_parent_loader(store: Arc<dyn DataStore>, config: &LoaderConfig) -> ListLoader<Comment> {
    list_loader::<Comment>(
        store,
        config,
        ListShape {
            foreign_key: Column::ParentId,
            top_level_only: false,
            order_by: Column::CreatedAt,
            parent_of: |comment| comment.parent_id.as_ref(),
            compare: |a, b| a.created_at.cmp(&b.created_at),
        },
    )
}
