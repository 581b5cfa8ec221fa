//! These tests run the entity loaders of a request against the in-memory
//! store, counting the queries each sequence of loads costs.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::{executor, future, FutureExt};
use studyloader::{
    Column, Comment, CommentThread, ConfigError, LoaderConfig, Loaders, MemoryStore, RequestContext,
    ScripturePassage, Session, SessionParticipant, StoreError, User, UserRole, WindowMode,
};
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 19, 0, 0).unwrap() + Duration::minutes(minute)
}

fn user(name: &str) -> User {
    User {
        id: Uuid::new_v4(),
        email: format!("{}@example.org", name.to_lowercase()),
        name: Some(name.to_string()),
        role: UserRole::Member,
        created_at: at(0),
        updated_at: at(0),
    }
}

fn session(leader: &User, title: &str) -> Session {
    Session {
        id: Uuid::new_v4(),
        title: title.to_string(),
        description: None,
        scheduled_date: at(60),
        leader_id: leader.id,
        created_at: at(0),
        updated_at: at(0),
    }
}

fn passage(session: &Session, book: &str, order: i32) -> ScripturePassage {
    ScripturePassage {
        id: Uuid::new_v4(),
        session_id: session.id,
        book: book.to_string(),
        chapter: 1,
        verse_start: 1,
        verse_end: Some(12),
        content: format!("{} 1:1-12", book),
        order,
        created_at: at(0),
        updated_at: at(0),
    }
}

fn comment(passage: &ScripturePassage, author: &User, parent: Option<&Comment>, minute: i64) -> Comment {
    Comment {
        id: Uuid::new_v4(),
        passage_id: passage.id,
        session_id: passage.session_id,
        user_id: author.id,
        content: format!("{} at minute {}", author.email, minute),
        parent_id: parent.map(|parent| parent.id),
        created_at: at(minute),
        updated_at: at(minute),
    }
}

fn participant(session: &Session, user: &User, minute: i64) -> SessionParticipant {
    SessionParticipant {
        id: Uuid::new_v4(),
        session_id: session.id,
        user_id: user.id,
        role: UserRole::Member,
        joined_at: at(minute),
    }
}

/// A small study group: one session with two passages, and a discussion on
/// the first passage.
struct Fixture {
    store: Arc<MemoryStore>,
    alice: User,
    bob: User,
    session: Session,
    genesis: ScripturePassage,
    john: ScripturePassage,
    first: Comment,
    second: Comment,
    replies: Vec<Comment>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        let alice = user("Alice");
        let bob = user("Bob");
        let session = session(&alice, "Beginnings");

        // Inserted out of display order
        let john = passage(&session, "John", 2);
        let genesis = passage(&session, "Genesis", 1);

        let second = comment(&genesis, &alice, None, 5);
        let first = comment(&genesis, &bob, None, 1);
        let replies = vec![
            comment(&genesis, &alice, Some(&first), 7),
            comment(&genesis, &bob, Some(&first), 6),
            comment(&genesis, &bob, Some(&second), 8),
        ];

        store.insert_user(alice.clone());
        store.insert_user(bob.clone());
        store.insert_session(session.clone());
        store.insert_passage(john.clone());
        store.insert_passage(genesis.clone());
        store.insert_comment(second.clone());
        store.insert_comment(first.clone());
        replies.iter().cloned().for_each(|reply| store.insert_comment(reply));
        store.insert_comment(comment(&john, &alice, None, 3));
        store.insert_participant(participant(&session, &bob, 10));
        store.insert_participant(participant(&session, &alice, 2));

        Self {
            store,
            alice,
            bob,
            session,
            genesis,
            john,
            first,
            second,
            replies,
        }
    }

    fn loaders(&self) -> Loaders {
        Loaders::new(self.store.clone())
    }

    fn loaders_with(&self, config: LoaderConfig) -> Loaders {
        Loaders::with_config(self.store.clone(), &config).unwrap()
    }
}

#[test]
fn point_loads_share_one_query() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();
    let missing = Uuid::new_v4();

    let users = executor::block_on(loaders.users.load_many(vec![fixture.bob.id, missing, fixture.alice.id]));

    assert_eq!(
        users,
        vec![Ok(Some(fixture.bob.clone())), Ok(None), Ok(Some(fixture.alice.clone()))]
    );

    let queries = fixture.store.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].table, "users");
    assert_eq!(queries[0].query.column, Column::Id);
    assert_eq!(queries[0].query.keys, vec![fixture.bob.id, missing, fixture.alice.id]);
}

#[test]
fn each_table_gets_its_own_batch() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();

    let (user, session, passage, comment) = executor::block_on(future::join4(
        loaders.users.load(fixture.alice.id),
        loaders.sessions.load(fixture.session.id),
        loaders.passages.load(fixture.john.id),
        loaders.comments.load(fixture.first.id),
    ));

    assert_eq!(user, Ok(Some(fixture.alice.clone())));
    assert_eq!(session, Ok(Some(fixture.session.clone())));
    assert_eq!(passage, Ok(Some(fixture.john.clone())));
    assert_eq!(comment, Ok(Some(fixture.first.clone())));

    assert_eq!(fixture.store.query_count(), 4);
    for table in ["users", "sessions", "scripture_passages", "comments"] {
        assert_eq!(fixture.store.queries_for(table).len(), 1, "{}", table);
    }
}

#[test]
fn repeated_keys_are_fetched_once() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();

    let first = executor::block_on(loaders.users.load_many(vec![fixture.alice.id, fixture.alice.id]));
    let again = executor::block_on(loaders.users.load(fixture.alice.id));

    assert_eq!(first[0], first[1]);
    assert_eq!(again, first[0]);

    let queries = fixture.store.queries_for("users");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query.keys, vec![fixture.alice.id]);
}

#[test]
fn uncached_loaders_pass_duplicates_through() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders_with(LoaderConfig {
        cache: false,
        ..LoaderConfig::default()
    });

    let users = executor::block_on(loaders.users.load_many(vec![fixture.alice.id, fixture.bob.id, fixture.alice.id]));

    assert_eq!(users[0], Ok(Some(fixture.alice.clone())));
    assert_eq!(users[2], Ok(Some(fixture.alice.clone())));
    assert_eq!(
        fixture.store.queries()[0].query.keys,
        vec![fixture.alice.id, fixture.bob.id, fixture.alice.id]
    );
}

#[test]
fn passages_are_grouped_and_ordered() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();
    let empty_session = Uuid::new_v4();

    let results = executor::block_on(
        loaders
            .passages_by_session
            .load_many(vec![fixture.session.id, empty_session]),
    );

    assert_eq!(
        results,
        vec![Ok(vec![fixture.genesis.clone(), fixture.john.clone()]), Ok(Vec::new())]
    );

    let queries = fixture.store.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query.column, Column::SessionId);
    assert_eq!(queries[0].query.order_by, Some(Column::Order));
}

#[test]
fn participants_are_ordered_by_join_time() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();

    let participants = executor::block_on(loaders.participants_by_session.load(fixture.session.id)).unwrap();
    let users: Vec<Uuid> = participants.iter().map(|participant| participant.user_id).collect();

    assert_eq!(users, vec![fixture.alice.id, fixture.bob.id]);
}

#[test]
fn comments_and_replies_are_partitioned() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();

    let top_level = executor::block_on(loaders.comments_by_passage.load(fixture.genesis.id)).unwrap();
    assert_eq!(top_level, vec![fixture.first.clone(), fixture.second.clone()]);
    assert!(top_level.iter().all(|comment| !comment.is_reply()));

    let replies = executor::block_on(
        loaders
            .replies_by_parent
            .load_many(vec![fixture.first.id, fixture.second.id, fixture.replies[0].id]),
    );

    assert_eq!(
        replies,
        vec![
            Ok(vec![fixture.replies[1].clone(), fixture.replies[0].clone()]),
            Ok(vec![fixture.replies[2].clone()]),
            Ok(Vec::new()),
        ]
    );

    let comment_queries = fixture.store.queries_for("comments");
    assert_eq!(comment_queries.len(), 2);
    assert!(comment_queries[0].query.top_level_only);
    assert_eq!(comment_queries[1].query.column, Column::ParentId);
}

#[test]
fn loader_sets_are_isolated() {
    let fixture = Fixture::new();
    let first_request = fixture.loaders();

    let before = executor::block_on(first_request.passages_by_session.load(fixture.session.id)).unwrap();
    assert_eq!(before.len(), 2);

    let revelation = passage(&fixture.session, "Revelation", 3);
    fixture.store.insert_passage(revelation.clone());

    // The first request keeps its memoized answer
    let cached = executor::block_on(first_request.passages_by_session.load(fixture.session.id)).unwrap();
    assert_eq!(cached, before);

    // A new request sees the new row
    let second_request = fixture.loaders();
    let after = executor::block_on(second_request.passages_by_session.load(fixture.session.id)).unwrap();
    assert_eq!(after.last(), Some(&revelation));
    assert_eq!(fixture.store.queries_for("scripture_passages").len(), 2);

    // Clearing the first set makes it fetch again
    first_request.clear_all();
    let refreshed = executor::block_on(first_request.passages_by_session.load(fixture.session.id)).unwrap();
    assert_eq!(refreshed, after);
}

#[test]
fn store_failures_reach_every_key() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();
    let outage = StoreError::Unavailable("connection refused".to_string());

    fixture.store.fail_with(outage.clone());
    let results = executor::block_on(loaders.users.load_many(vec![fixture.alice.id, fixture.bob.id]));
    assert_eq!(results, vec![Err(outage.clone()), Err(outage.clone())]);

    // A failed batch isn't memoized, so the same loaders fetch again once
    // the store is back
    assert_eq!(loaders.users.cached_len(), 0);
    fixture.store.recover();
    assert_eq!(
        executor::block_on(loaders.users.load(fixture.alice.id)),
        Ok(Some(fixture.alice.clone()))
    );

    let queries = fixture.store.queries_for("users");
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1].query.keys, vec![fixture.alice.id]);
}

#[test]
fn abandoned_loads_leave_the_batch() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders();

    let waker = futures::task::noop_waker();
    let mut ctx = std::task::Context::from_waker(&waker);

    let mut alice = loaders.users.load(fixture.alice.id);
    assert!(alice.poll_unpin(&mut ctx).is_pending());

    let bob = loaders.users.load(fixture.bob.id);
    drop(alice);

    assert_eq!(executor::block_on(bob), Ok(Some(fixture.bob.clone())));

    let queries = fixture.store.queries_for("users");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query.keys, vec![fixture.bob.id]);
}

#[test]
fn key_limit_splits_batches() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders_with(LoaderConfig {
        max_batch_size: 2,
        ..LoaderConfig::default()
    });

    let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    let results = executor::block_on(loaders.users.load_many(ids.clone()));
    assert!(results.iter().all(|result| result == &Ok(None)));

    let sizes: Vec<usize> = fixture
        .store
        .queries_for("users")
        .iter()
        .map(|record| record.query.keys.len())
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[test]
fn manual_window_dispatches_per_level() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders_with(LoaderConfig {
        window: WindowMode::Manual,
        ..LoaderConfig::default()
    });

    let users = loaders.users.load_many(vec![fixture.alice.id, fixture.bob.id]);
    let passages = loaders.passages_by_session.load(fixture.session.id);
    assert_eq!(fixture.store.query_count(), 0);

    loaders.dispatch_all();

    let (users, passages) = executor::block_on(future::join(users, passages));
    assert_eq!(users.len(), 2);
    assert_eq!(passages.unwrap().len(), 2);
    assert_eq!(fixture.store.query_count(), 2);
}

#[test]
fn timer_window_batches_like_tick() {
    let fixture = Fixture::new();
    let loaders = fixture.loaders_with(LoaderConfig {
        window: WindowMode::Delay,
        window_ms: 5,
        ..LoaderConfig::default()
    });

    let users = executor::block_on(loaders.users.load_many(vec![fixture.alice.id, fixture.bob.id]));
    assert_eq!(users, vec![Ok(Some(fixture.alice.clone())), Ok(Some(fixture.bob.clone()))]);
    assert_eq!(fixture.store.query_count(), 1);
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let fixture = Fixture::new();
    let config = LoaderConfig {
        window: WindowMode::Delay,
        window_ms: 0,
        ..LoaderConfig::default()
    };

    assert!(matches!(
        Loaders::with_config(fixture.store.clone(), &config),
        Err(ConfigError::Validation(_))
    ));
    assert!(RequestContext::for_request(fixture.store.clone(), &config, None).is_err());
}

#[test]
fn context_resolves_session_fields() {
    let fixture = Fixture::new();
    let context = RequestContext::for_request(fixture.store.clone(), &LoaderConfig::default(), Some(fixture.bob.id))
        .unwrap();

    assert_eq!(context.viewer(), Some(fixture.bob.id));

    let (leader, passages, participants) = executor::block_on(future::join3(
        context.session_leader(&fixture.session),
        context.session_passages(fixture.session.id),
        context.session_participants(fixture.session.id),
    ));

    assert_eq!(leader, Ok(Some(fixture.alice.clone())));
    assert_eq!(passages.unwrap().len(), 2);
    assert_eq!(participants.unwrap().len(), 2);

    // Three loaders, three queries
    assert_eq!(fixture.store.query_count(), 3);
}

#[test]
fn passage_thread_loads_one_level_at_a_time() {
    let fixture = Fixture::new();
    let context = RequestContext::for_connection(fixture.store.clone(), &LoaderConfig::default(), None).unwrap();

    let thread = executor::block_on(context.passage_thread(fixture.genesis.id)).unwrap();

    assert_eq!(
        thread,
        vec![
            CommentThread {
                comment: fixture.first.clone(),
                author: Some(fixture.bob.clone()),
                replies: vec![fixture.replies[1].clone(), fixture.replies[0].clone()],
            },
            CommentThread {
                comment: fixture.second.clone(),
                author: Some(fixture.alice.clone()),
                replies: vec![fixture.replies[2].clone()],
            },
        ]
    );

    // Top-level comments, then authors and replies side by side
    assert_eq!(fixture.store.query_count(), 3);
    let users = fixture.store.queries_for("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].query.keys, vec![fixture.bob.id, fixture.alice.id]);

    // The authors are memoized for the rest of the connection
    let author = executor::block_on(context.comment_author(&fixture.replies[0])).unwrap();
    assert_eq!(author, Some(fixture.alice.clone()));
    assert_eq!(fixture.store.query_count(), 3);
}
