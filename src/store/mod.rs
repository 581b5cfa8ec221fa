//! The data store seam.
//!
//! Loaders only ever ask the store one kind of question: "every row of this
//! table whose `column` is one of these keys", optionally restricted to
//! top-level rows and ordered by a secondary column. How the store answers
//! (SQL, an ORM, memory) is up to the adapter; retries and logging of store
//! failures belong there too, not in the loaders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::data::KeyedEntry;
use crate::error::StoreResult;
use crate::model::{Comment, ScripturePassage, Session, SessionParticipant, User};

pub mod memory;

pub use memory::{MemoryStore, QueryRecord};

/// A column that loaders filter or order by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Id,
    SessionId,
    PassageId,
    ParentId,
    UserId,
    Order,
    CreatedAt,
    JoinedAt,
}

/// A column value, as seen by adapters that evaluate queries themselves.
/// `None` stands for SQL `NULL` / a column the table doesn't have.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cell {
    Id(Uuid),
    Int(i32),
    Time(DateTime<Utc>),
}

/// `SELECT * FROM <table> WHERE <column> IN (<keys>) [AND parent_id IS NULL]
/// [ORDER BY <order_by> ASC]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindMany {
    pub column: Column,
    pub keys: Vec<Uuid>,
    pub top_level_only: bool,
    pub order_by: Option<Column>,
}

impl FindMany {
    pub fn by(column: Column, keys: Vec<Uuid>) -> Self {
        Self {
            column,
            keys,
            top_level_only: false,
            order_by: None,
        }
    }

    /// Restrict to rows whose `parent_id` is null.
    pub fn top_level_only(mut self) -> Self {
        self.top_level_only = true;
        self
    }

    pub fn order_by(mut self, column: Column) -> Self {
        self.order_by = Some(column);
        self
    }
}

/// The persistence layer, shared read-only by every loader of a request.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn find_users(&self, query: FindMany) -> StoreResult<Vec<User>>;

    async fn find_sessions(&self, query: FindMany) -> StoreResult<Vec<Session>>;

    async fn find_passages(&self, query: FindMany) -> StoreResult<Vec<ScripturePassage>>;

    async fn find_comments(&self, query: FindMany) -> StoreResult<Vec<Comment>>;

    async fn find_participants(&self, query: FindMany) -> StoreResult<Vec<SessionParticipant>>;
}

/// A row type with a table in the [`DataStore`]. Lets the entity loaders be
/// written once for every table.
pub trait Record: KeyedEntry<Uuid> + Clone + Send + Sync + 'static {
    const TABLE: &'static str;

    fn find_many(store: &dyn DataStore, query: FindMany) -> BoxFuture<'_, StoreResult<Vec<Self>>>;

    fn column(&self, column: Column) -> Option<Cell>;
}

impl Record for User {
    const TABLE: &'static str = "users";

    fn find_many(store: &dyn DataStore, query: FindMany) -> BoxFuture<'_, StoreResult<Vec<Self>>> {
        store.find_users(query)
    }

    fn column(&self, column: Column) -> Option<Cell> {
        match column {
            Column::Id => Some(Cell::Id(self.id)),
            Column::CreatedAt => Some(Cell::Time(self.created_at)),
            _ => None,
        }
    }
}

impl Record for Session {
    const TABLE: &'static str = "sessions";

    fn find_many(store: &dyn DataStore, query: FindMany) -> BoxFuture<'_, StoreResult<Vec<Self>>> {
        store.find_sessions(query)
    }

    fn column(&self, column: Column) -> Option<Cell> {
        match column {
            Column::Id => Some(Cell::Id(self.id)),
            Column::UserId => Some(Cell::Id(self.leader_id)),
            Column::CreatedAt => Some(Cell::Time(self.created_at)),
            _ => None,
        }
    }
}

impl Record for ScripturePassage {
    const TABLE: &'static str = "scripture_passages";

    fn find_many(store: &dyn DataStore, query: FindMany) -> BoxFuture<'_, StoreResult<Vec<Self>>> {
        store.find_passages(query)
    }

    fn column(&self, column: Column) -> Option<Cell> {
        match column {
            Column::Id => Some(Cell::Id(self.id)),
            Column::SessionId => Some(Cell::Id(self.session_id)),
            Column::Order => Some(Cell::Int(self.order)),
            Column::CreatedAt => Some(Cell::Time(self.created_at)),
            _ => None,
        }
    }
}

impl Record for Comment {
    const TABLE: &'static str = "comments";

    fn find_many(store: &dyn DataStore, query: FindMany) -> BoxFuture<'_, StoreResult<Vec<Self>>> {
        store.find_comments(query)
    }

    fn column(&self, column: Column) -> Option<Cell> {
        match column {
            Column::Id => Some(Cell::Id(self.id)),
            Column::SessionId => Some(Cell::Id(self.session_id)),
            Column::PassageId => Some(Cell::Id(self.passage_id)),
            Column::ParentId => self.parent_id.map(Cell::Id),
            Column::UserId => Some(Cell::Id(self.user_id)),
            Column::CreatedAt => Some(Cell::Time(self.created_at)),
            _ => None,
        }
    }
}

impl Record for SessionParticipant {
    const TABLE: &'static str = "session_participants";

    fn find_many(store: &dyn DataStore, query: FindMany) -> BoxFuture<'_, StoreResult<Vec<Self>>> {
        store.find_participants(query)
    }

    fn column(&self, column: Column) -> Option<Cell> {
        match column {
            Column::Id => Some(Cell::Id(self.id)),
            Column::SessionId => Some(Cell::Id(self.session_id)),
            Column::UserId => Some(Cell::Id(self.user_id)),
            Column::JoinedAt => Some(Cell::Time(self.joined_at)),
            _ => None,
        }
    }
}
