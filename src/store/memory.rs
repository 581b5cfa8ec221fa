//! An in-process [`DataStore`], used by the test suite and as the reference
//! for how an adapter should answer a [`FindMany`].

use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Cell, Column, DataStore, FindMany, Record};
use crate::error::{StoreError, StoreResult};
use crate::model::{Comment, ScripturePassage, Session, SessionParticipant, User};

/// One query the store has answered (or failed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub table: &'static str,
    pub query: FindMany,
}

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    sessions: Vec<Session>,
    passages: Vec<ScripturePassage>,
    comments: Vec<Comment>,
    participants: Vec<SessionParticipant>,
}

/// Rows are kept in insertion order, and queries without an `order_by`
/// return them in that order. Every query is recorded, so tests can assert
/// exactly how many round trips a sequence of loads cost.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    log: Mutex<Vec<QueryRecord>>,
    failure: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.tables.write().unwrap().users.push(user);
    }

    pub fn insert_session(&self, session: Session) {
        self.tables.write().unwrap().sessions.push(session);
    }

    pub fn insert_passage(&self, passage: ScripturePassage) {
        self.tables.write().unwrap().passages.push(passage);
    }

    pub fn insert_comment(&self, comment: Comment) {
        self.tables.write().unwrap().comments.push(comment);
    }

    pub fn insert_participant(&self, participant: SessionParticipant) {
        self.tables.write().unwrap().participants.push(participant);
    }

    /// Every query answered so far, oldest first.
    pub fn queries(&self) -> Vec<QueryRecord> {
        self.log.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Queries made against one table.
    pub fn queries_for(&self, table: &str) -> Vec<QueryRecord> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.table == table)
            .cloned()
            .collect()
    }

    pub fn reset_queries(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Make every following query fail with `error`, until [`recover`] is
    /// called.
    ///
    /// [`recover`]: MemoryStore::recover
    pub fn fail_with(&self, error: StoreError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    fn run<R: Record>(&self, query: FindMany, table: impl Fn(&Tables) -> &Vec<R>) -> StoreResult<Vec<R>> {
        debug!(
            table = R::TABLE,
            column = ?query.column,
            keys = query.keys.len(),
            top_level_only = query.top_level_only,
            "find_many"
        );

        self.log.lock().unwrap().push(QueryRecord {
            table: R::TABLE,
            query: query.clone(),
        });

        if let Some(error) = self.failure.lock().unwrap().clone() {
            warn!(table = R::TABLE, %error, "injected store failure");
            return Err(error);
        }

        let tables = self.tables.read().unwrap();
        Ok(select(table(&tables), &query))
    }
}

/// Evaluate a [`FindMany`] over a slice of rows.
fn select<R: Record>(rows: &[R], query: &FindMany) -> Vec<R> {
    let keys: HashSet<_> = query.keys.iter().collect();

    let mut found: Vec<R> = rows
        .iter()
        .filter(|row| match row.column(query.column) {
            Some(Cell::Id(ref id)) => keys.contains(id),
            _ => false,
        })
        .filter(|row| !query.top_level_only || row.column(Column::ParentId).is_none())
        .cloned()
        .collect();

    if let Some(order_by) = query.order_by {
        found.sort_by_key(|row| row.column(order_by));
    }

    found
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn find_users(&self, query: FindMany) -> StoreResult<Vec<User>> {
        self.run(query, |tables| &tables.users)
    }

    async fn find_sessions(&self, query: FindMany) -> StoreResult<Vec<Session>> {
        self.run(query, |tables| &tables.sessions)
    }

    async fn find_passages(&self, query: FindMany) -> StoreResult<Vec<ScripturePassage>> {
        self.run(query, |tables| &tables.passages)
    }

    async fn find_comments(&self, query: FindMany) -> StoreResult<Vec<Comment>> {
        self.run(query, |tables| &tables.comments)
    }

    async fn find_participants(&self, query: FindMany) -> StoreResult<Vec<SessionParticipant>> {
        self.run(query, |tables| &tables.participants)
    }
}
