//! The controller, reconciler and store working together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eskeeper_reconcile::{
    Adapter, Connect, ConnectionDetails, ConnectionLookup, ConnectionRef, Controller,
    ControllerConfig, Declared, FileStore, HandleFactory, Lookup, MemoryRecorder, MemoryStore,
    ResourceKey, ResourceReconciler, ResourceSpec, ResourceStore, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GroupSpec {
    members: Vec<String>,
    connection: ConnectionRef,
}

impl ResourceSpec for GroupSpec {
    const KIND: &'static str = "Group";

    fn connection(&self) -> &ConnectionRef {
        &self.connection
    }
}

#[derive(Default)]
struct Directory {
    groups: Mutex<HashMap<String, Value>>,
}

impl Directory {
    fn group(&self, name: &str) -> Option<Value> {
        self.groups.lock().unwrap().get(name).cloned()
    }
}

struct GroupAdapter;

#[async_trait]
impl Adapter for GroupAdapter {
    type Spec = GroupSpec;
    type Object = Value;
    type Handle = Arc<Directory>;

    fn condition_type(&self) -> &'static str {
        "GroupReady"
    }

    fn build(&self, resource: &Declared<GroupSpec>) -> Result<Value> {
        Ok(json!({"members": resource.spec.members}))
    }

    async fn get(&self, dir: &Arc<Directory>, name: &str) -> Result<Option<Value>> {
        Ok(dir.group(name))
    }

    async fn create(&self, dir: &Arc<Directory>, name: &str, group: &Value) -> Result<()> {
        dir.groups.lock().unwrap().insert(name.into(), group.clone());
        Ok(())
    }

    async fn update(&self, dir: &Arc<Directory>, name: &str, group: &Value) -> Result<()> {
        dir.groups.lock().unwrap().insert(name.into(), group.clone());
        Ok(())
    }

    async fn delete(&self, dir: &Arc<Directory>, name: &str) -> Result<()> {
        dir.groups.lock().unwrap().remove(name);
        Ok(())
    }
}

struct StaticLookup;

#[async_trait]
impl ConnectionLookup for StaticLookup {
    async fn lookup(&self, _namespace: &str, _connection: &ConnectionRef) -> Result<Lookup> {
        Ok(Lookup::Ready(ConnectionDetails {
            addresses: vec!["memory://directory".into()],
            credentials: None,
        }))
    }
}

struct DirectoryFactory(Arc<Directory>);

#[async_trait]
impl HandleFactory for DirectoryFactory {
    type Handle = Arc<Directory>;

    async fn connect(&self, _details: &ConnectionDetails) -> Result<Connect<Arc<Directory>>> {
        Ok(Connect::Connected(self.0.clone()))
    }
}

fn group(members: &[&str]) -> Declared<GroupSpec> {
    Declared::new(
        "default",
        "ops",
        GroupSpec {
            members: members.iter().map(|m| m.to_string()).collect(),
            connection: ConnectionRef::managed("directory"),
        },
    )
}

/// Poll `check` until it holds, failing after a few seconds.
async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_declare_edit_delete() {
    let directory = Arc::new(Directory::default());
    let store = Arc::new(MemoryStore::<GroupSpec>::new());
    let recorder = Arc::new(MemoryRecorder::new());
    let config = ControllerConfig::default();

    let reconciler = ResourceReconciler::new(
        GroupAdapter,
        store.clone(),
        StaticLookup,
        DirectoryFactory(directory.clone()),
        recorder.clone(),
        config.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(Arc::new(reconciler), config);
    let handle = tokio::spawn(controller.run(Vec::new(), store.subscribe(), shutdown_rx));

    let key = ResourceKey::new("default", "ops");

    store.apply(group(&["alice"])).await.unwrap();
    eventually("group created", || directory.group("ops").is_some()).await;
    assert_eq!(directory.group("ops").unwrap(), json!({"members": ["alice"]}));

    store.apply(group(&["alice", "bob"])).await.unwrap();
    eventually("group updated", || {
        directory.group("ops") == Some(json!({"members": ["alice", "bob"]}))
    })
    .await;

    // Wait for the status of the second pass before deleting
    for _ in 0..500 {
        let res = store.get(&key).await.unwrap().unwrap();
        if res.status.observed_generation == Some(2) {
            assert!(res.has_finalizer());
            assert!(res.status.sync);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    store.request_deletion(&key).await.unwrap();
    eventually("group deleted", || directory.group("ops").is_none()).await;
    for _ in 0..500 {
        if store.get(&key).await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.get(&key).await.unwrap().is_none());

    let reasons = recorder.reasons_for(&key);
    assert_eq!(reasons.first().map(String::as_str), Some("Created"));
    assert!(reasons.contains(&"Updated".to_string()));
    assert_eq!(reasons.last().map(String::as_str), Some("Deleted"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
}

/// Run a controller over a file store until the returned sender fires.
async fn run_on_file_store(
    store: Arc<FileStore<GroupSpec>>,
    directory: Arc<Directory>,
    recorder: Arc<MemoryRecorder>,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let config = ControllerConfig::default();
    let reconciler = ResourceReconciler::new(
        GroupAdapter,
        store.clone(),
        StaticLookup,
        DirectoryFactory(directory),
        recorder,
        config.clone(),
    );
    let triggers = store.subscribe();
    let initial = store
        .list()
        .await
        .unwrap()
        .iter()
        .map(|r| r.key())
        .collect();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(Arc::new(reconciler), config);
    let handle = tokio::spawn(controller.run(initial, triggers, shutdown_rx));
    (shutdown_tx, handle)
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_state() {
    let state = TempDir::new().unwrap();
    let directory = Arc::new(Directory::default());
    let recorder = Arc::new(MemoryRecorder::new());
    let key = ResourceKey::new("default", "ops");

    let store = Arc::new(FileStore::open(state.path()).await.unwrap());
    let (shutdown_tx, handle) =
        run_on_file_store(store.clone(), directory.clone(), recorder.clone()).await;
    store.apply(group(&["alice"])).await.unwrap();
    for _ in 0..500 {
        if store.get(&key).await.unwrap().unwrap().status.sync {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    drop(store);

    // Someone else annotates the group while the controller is down
    directory.groups.lock().unwrap().insert(
        "ops".into(),
        json!({"members": ["alice"], "owner": "ops-team"}),
    );

    let store = Arc::new(FileStore::<GroupSpec>::open(state.path()).await.unwrap());
    let restored = store.get(&key).await.unwrap().unwrap();
    assert!(restored.has_finalizer());
    assert!(restored.status.sync);
    assert!(!restored.status.original_object.is_empty());

    let (shutdown_tx, handle) =
        run_on_file_store(store.clone(), directory.clone(), recorder.clone()).await;

    // The restored snapshot keeps the external field out of the patch
    store.apply(group(&["alice", "bob"])).await.unwrap();
    eventually("group updated after restart", || {
        directory.group("ops")
            == Some(json!({"members": ["alice", "bob"], "owner": "ops-team"}))
    })
    .await;

    store.request_deletion(&key).await.unwrap();
    eventually("group deleted after restart", || directory.group("ops").is_none()).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
    assert_eq!(
        recorder.reasons_for(&key),
        vec!["Created", "Updated", "Deleted"]
    );
}
