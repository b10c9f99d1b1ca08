use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use async_resource_core::{Fingerprint, ResourceStore, StoreError};
use thiserror::Error;

use crate::{
    loader::{initialize_data_reader, preload, InitError, Resources},
    reader::{Read, Status},
    source::SourceFn,
};

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: u32,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Post {
    id: u32,
    title: String,
}

#[derive(Debug, Error, PartialEq)]
#[error("User {0} not found")]
struct NotFound(u32);

fn user(id: u32) -> User {
    User {
        id,
        name: "test name".to_string(),
    }
}

/// Fake API that counts how often each of its endpoints gets called.
struct TestApi {
    request_count: Arc<AtomicU32>,
}

impl TestApi {
    fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU32::new(0)),
        }
    }

    fn get_request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    fn users(&self) -> SourceFn<(u32,), User, NotFound> {
        let count = self.request_count.clone();
        SourceFn::new(move |(id,): (u32,)| {
            count.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                Ok(user(id))
            }
        })
    }

    fn posts(&self) -> SourceFn<(u32,), Post, NotFound> {
        let count = self.request_count.clone();
        SourceFn::new(move |(id,): (u32,)| {
            count.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                Ok(Post {
                    id,
                    title: "some title".to_string(),
                })
            }
        })
    }

    fn missing_users(&self) -> SourceFn<(u32,), User, NotFound> {
        let count = self.request_count.clone();
        SourceFn::new(move |(id,): (u32,)| {
            count.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                Err(NotFound(id))
            }
        })
    }
}

#[tokio::test]
async fn creates_new_data_reader() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();

    let reader = resources.initialize(&api.users(), (1,)).unwrap();

    let Read::Suspended(suspension) = reader.read() else {
        panic!("Expected a fresh reader to suspend, got: {:?}", reader.read());
    };
    suspension.await;

    assert_eq!(reader.read().ok(), Some(user(1)));
}

#[tokio::test]
async fn creates_erroneous_data_reader() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();

    let reader = resources.initialize(&api.missing_users(), (1,)).unwrap();
    let err = reader.resolve().await.unwrap_err();

    assert_eq!(err.to_string(), "User 1 not found");
    assert_eq!(reader.status(), Status::Failed);
    for _ in 0..3 {
        assert_eq!(reader.read().err().unwrap().as_source(), Some(&NotFound(1)));
    }
}

#[tokio::test]
async fn accepts_projection() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();

    let reader = resources.initialize(&users, (1,)).unwrap();
    reader.resolve().await.unwrap();

    assert_eq!(reader.read_with(|u| u.id).ok(), Some(1));
    assert_eq!(
        reader.read_with(|u| u.name.to_uppercase()).ok(),
        Some("TEST NAME".to_string())
    );
    assert_eq!(api.get_request_count(), 1);
}

#[tokio::test]
async fn reader_is_cached_and_reused() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();

    let reader = resources.initialize(&users, (1,)).unwrap();
    reader.resolve().await.unwrap();

    let similar = resources.initialize(&users, (1,)).unwrap();

    // Already resolved, so the read doesn't suspend
    assert_eq!(similar.read().ok(), Some(user(1)));
    assert_eq!(similar, reader);
    assert_eq!(api.get_request_count(), 1);
}

#[tokio::test]
async fn concurrent_requests_invoke_once() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();

    let a = resources.initialize(&users, (1,)).unwrap();
    let b = resources.initialize(&users, (1,)).unwrap();

    assert_eq!(api.get_request_count(), 1);
    assert!(a.ptr_eq(&b));
    assert_eq!(a.resolve().await.unwrap(), user(1));
    assert_eq!(b.resolve().await.unwrap(), user(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_across_threads_invoke_once() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();

    let tasks = (0..16)
        .map(|_| {
            let resources = resources.clone();
            let users = users.clone();
            tokio::spawn(async move { resources.initialize(&users, (7,)).unwrap() })
        })
        .collect::<Vec<_>>();

    let mut readers = Vec::new();
    for task in tasks {
        readers.push(task.await.unwrap());
    }

    assert_eq!(api.get_request_count(), 1);
    assert!(readers.iter().all(|r| r.ptr_eq(&readers[0])));
    assert_eq!(readers[0].resolve().await.unwrap(), user(7));
}

#[tokio::test]
async fn readers_are_unique_per_key() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();
    let posts = api.posts();

    let reader = resources.initialize(&users, (1,)).unwrap();
    reader.resolve().await.unwrap();

    let reader2 = resources.initialize(&users, (2,)).unwrap();
    assert_ne!(reader2, reader);
    assert_eq!(reader2.resolve_with(|u| u.id).await.unwrap(), 2);

    // Same arguments, different function
    let reader3 = resources.initialize(&posts, (1,)).unwrap();
    assert!(reader3.read().is_suspended());
    assert_eq!(reader3.resolve_with(|p| p.title.clone()).await.unwrap(), "some title");

    assert_eq!(api.get_request_count(), 3);
}

#[tokio::test]
async fn eviction_recreates_reader() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();

    let reader = resources.initialize(&users, (1,)).unwrap();
    reader.resolve().await.unwrap();

    assert!(resources.invalidate(&users, &(1,)).unwrap());
    assert!(!resources.invalidate(&users, &(1,)).unwrap());

    let similar = resources.initialize(&users, (1,)).unwrap();
    assert_ne!(similar, reader);
    assert_eq!(api.get_request_count(), 2);

    assert_eq!(similar.resolve().await.unwrap(), reader.read().ok().unwrap());
}

#[tokio::test]
async fn failed_reader_is_a_cache_hit() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let missing = api.missing_users();

    let reader = resources.initialize(&missing, (1,)).unwrap();
    reader.resolve().await.unwrap_err();

    let again = resources.initialize(&missing, (1,)).unwrap();
    assert!(again.ptr_eq(&reader));
    assert_eq!(again.status(), Status::Failed);
    assert_eq!(api.get_request_count(), 1);

    resources.invalidate(&missing, &(1,)).unwrap();
    let retried = resources.initialize(&missing, (1,)).unwrap();
    assert!(!retried.ptr_eq(&reader));
    assert_eq!(api.get_request_count(), 2);
}

#[tokio::test]
async fn clear_drops_all_readers_of_source() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();
    let posts = api.posts();

    resources.initialize(&users, (1,)).unwrap();
    resources.initialize(&users, (2,)).unwrap();
    let post = resources.initialize(&posts, (1,)).unwrap();
    assert_eq!(resources.resource_cache(&users).len().unwrap(), 2);

    resources.clear(&users);
    assert!(!resources.store().contains_source(users.id()));
    assert!(resources.resource_cache(&users).get(&(1,)).unwrap().is_none());

    resources.initialize(&users, (1,)).unwrap();
    resources.initialize(&users, (2,)).unwrap();
    assert!(resources.initialize(&posts, (1,)).unwrap().ptr_eq(&post));
    assert_eq!(api.get_request_count(), 5);
}

#[tokio::test]
async fn cache_can_be_seeded() {
    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();

    let seeded = crate::reader::DataReader::from_value(user(42));
    resources
        .resource_cache(&users)
        .set(seeded.clone(), &(42,))
        .unwrap();

    let reader = resources.initialize(&users, (42,)).unwrap();
    assert!(reader.ptr_eq(&seeded));
    assert_eq!(reader.read().ok(), Some(user(42)));
    assert_eq!(api.get_request_count(), 0);
}

#[tokio::test]
async fn free_functions_use_explicit_store() {
    let api = TestApi::new();
    let store = ResourceStore::new();
    let users = api.users();

    let preloaded = preload(&store, &users, (1,)).unwrap();
    let reader = initialize_data_reader(&store, &users, (1,)).unwrap();

    assert!(reader.ptr_eq(&preloaded));
    assert_eq!(reader.resolve().await.unwrap(), user(1));
    assert_eq!(api.get_request_count(), 1);

    // A fresh store knows nothing of the other one
    let other = ResourceStore::new();
    initialize_data_reader(&other, &users, (1,)).unwrap();
    assert_eq!(api.get_request_count(), 2);
}

#[test]
fn no_runtime() {
    let api = TestApi::new();
    let store = ResourceStore::new();

    assert!(matches!(
        initialize_data_reader(&store, &api.users(), (1,)),
        Err(InitError::NoRuntime)
    ));
    assert!(matches!(Resources::new(), Err(InitError::NoRuntime)));
    assert_eq!(api.get_request_count(), 0);
}

#[test]
fn explicit_runtime() {
    let api = TestApi::new();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(ResourceStore::new());

    let resources = Resources::builder()
        .store(store.clone())
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();

    let reader = resources.initialize(&api.users(), (3,)).unwrap();
    assert_eq!(runtime.block_on(reader.resolve()).unwrap(), user(3));
    assert!(Arc::ptr_eq(resources.store(), &store));
}

#[tokio::test]
async fn unkeyable_args_fail_synchronously() {
    let count = Arc::new(AtomicU32::new(0));
    let source = {
        let count = count.clone();
        SourceFn::new(move |(x,): (f64,)| {
            count.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, NotFound>(x) }
        })
    };
    let resources = Resources::new().unwrap();

    for x in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        assert!(matches!(
            resources.initialize(&source, (x,)),
            Err(InitError::Store(StoreError::Fingerprint(_)))
        ));
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(!resources.store().contains_source(source.id()));
}

#[tokio::test]
async fn optional_args_get_their_own_readers() {
    let count = Arc::new(AtomicU32::new(0));
    let source = {
        let count = count.clone();
        SourceFn::new(move |(filter,): (Option<Option<u32>>,)| {
            count.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, NotFound>(filter) }
        })
    };
    let resources = Resources::new().unwrap();

    let none = resources.initialize(&source, (None,)).unwrap();
    let some_none = resources.initialize(&source, (Some(None),)).unwrap();

    assert!(!none.ptr_eq(&some_none));
    assert_eq!(none.resolve().await.unwrap(), None);
    assert_eq!(some_none.resolve().await.unwrap(), Some(None));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

/// Collects everything a `fmt` subscriber writes.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn settlement_is_logged_with_source_and_key() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let api = TestApi::new();
    let resources = Resources::new().unwrap();
    let users = api.users();

    let reader = resources.initialize(&users, (1,)).unwrap();
    reader.resolve().await.unwrap();

    let contents = logs.contents();
    let settled = contents
        .lines()
        .find(|line| line.contains("Data reader settled"))
        .unwrap_or_else(|| panic!("No settlement logged in:\n{contents}"));

    assert!(settled.contains(&format!("source={}", users.id())), "{settled}");
    assert!(
        settled.contains(&format!("key={}", Fingerprint::of(&(1,)).unwrap())),
        "{settled}"
    );
    assert!(settled.contains("status=Resolved"), "{settled}");
}
