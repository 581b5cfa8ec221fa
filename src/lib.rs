//! Studyloader is the data-loading layer of a collaborative Bible-study
//! GraphQL API, built on a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader). It collapses
//! the many single-row lookups made by independent field resolvers into one
//! batched query per table, then hands each resolver its own row, without
//! the resolver knowing anything about the batch.
//!
//! ## Overview
//!
//! The core is a batch function: an async function that takes a [`KeySet`]
//! of every key requested during one batch window and returns a
//! [`ValueSet`] with a result for each of them. The only way to create a
//! [`ValueSet`] is through the methods on [`KeySet`], so a batch function
//! can't forget a key or hand a value to the wrong requester.
//!
//! ```
//! use std::collections::HashMap;
//! use futures::{executor::block_on, future};
//! use studyloader::{BatchController, BatchRules, BatchWindow, KeySet, ValueSet};
//!
//! async fn batch_get_names(ids: KeySet<u32>) -> Result<ValueSet<Option<String>, String>, String> {
//!     // One round trip for every id in the batch
//!     let names: HashMap<u32, String> = ids
//!         .keys()
//!         .filter(|id| **id != 0)
//!         .map(|id| (*id, format!("user {}", id)))
//!         .collect();
//!
//!     Ok(ids.into_values(|id| names.get(id).cloned()))
//! }
//!
//! let controller = BatchController::new(BatchRules {
//!     batcher: batch_get_names,
//!     window: BatchWindow::Tick,
//!     max_keys: None,
//! });
//!
//! let (first, missing) = block_on(future::join(controller.load(1), controller.load(0)));
//! assert_eq!(first, Ok(Some("user 1".to_string())));
//! assert_eq!(missing, Ok(None));
//! ```
//!
//! The [`BatchController`] is configured with 3 fields:
//! - The `batcher` is the batch function.
//! - `window` defines how long a batch collects keys. [`BatchWindow::Tick`]
//!   closes once the current executor pass is done; [`BatchWindow::Delay`]
//!   after a fixed time; [`BatchWindow::Manual`] only on an explicit
//!   [`dispatch`](BatchController::dispatch). Any `Fn() -> impl Future` works
//!   as well.
//! - `max_keys` is an optional maximum number of keys per batch. The batch
//!   is dispatched as soon as it is reached, regardless of the window.
//!
//! A [`Loader`] puts a memoization cache in front of a controller, so that a
//! key requested twice in one request is fetched once. The entity loaders of
//! one request are collected in [`Loaders`], and a [`RequestContext`] hands
//! them to resolvers:
//!
//! ```
//! use std::sync::Arc;
//! use futures::executor::block_on;
//! use studyloader::{Loaders, MemoryStore};
//! use uuid::Uuid;
//!
//! let store = Arc::new(MemoryStore::new());
//! let loaders = Loaders::new(store.clone());
//!
//! let missing = block_on(loaders.users.load(Uuid::new_v4()));
//! assert_eq!(missing, Ok(None));
//! assert_eq!(store.query_count(), 1);
//! ```
//!
//! ## Design notes
//!
//! ### Poll-driven batches
//!
//! All of the asynchronous work is driven through polling [`BatchFuture`].
//! The batch function is not scheduled in any runtime or run in the
//! background; it is driven directly in the foreground by whichever
//! `BatchFuture` holds the driver role. The other futures of the batch are
//! woken only when the results are ready, or when the driver is dropped and
//! one of them has to take over.
//!
//! ### Request scoping
//!
//! Loader caches never evict on their own and are never shared. Build a fresh
//! [`Loaders`] (or [`RequestContext`]) per request and drop it afterwards;
//! two requests never see each other's rows.
//!
//! ### Failures
//!
//! If a batch function returns `Err`, every future of that batch resolves to
//! a clone of that error. A [`Loader`] doesn't memoize such a failure: the
//! next `load` of those keys fetches them again. Errors for a single key go
//! through [`KeySet::into_results`], reach only that key's future, and stay
//! cached.

mod batch;
mod cache;
mod config;
mod context;
mod data;
pub mod entity;
mod error;
mod loader;
mod model;
mod registry;
pub mod store;
mod wakerset;
mod window;

pub use batch::{BatchController, BatchFn, BatchFuture, BatchRules};
pub use cache::LoaderCache;
pub use config::{LoaderConfig, WindowMode, MAX_WINDOW_MS};
pub use context::{CommentThread, RequestContext, Scope};
pub use data::{ArityError, KeySet, KeyedEntry, ValueSet};
pub use entity::{EntityLoader, FetchFn, FetchFuture, ListLoader, ListShape, PointLoader};
pub use error::{ConfigError, StoreError, StoreResult};
pub use loader::{LoadFuture, Loader};
pub use model::{Comment, ScripturePassage, Session, SessionParticipant, User, UserRole};
pub use registry::Loaders;
pub use store::{Cell, Column, DataStore, FindMany, MemoryStore, QueryRecord, Record};
pub use window::{BatchWindow, Window, WindowDelay};
