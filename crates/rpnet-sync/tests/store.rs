use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rpnet_nats::MockKv;
use rpnet_sync::{Merge, Store};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Members(BTreeSet<String>);

impl Members {
    fn of(names: &[&str]) -> Self {
        Self(names.iter().map(|n| n.to_string()).collect())
    }
}

impl Merge for Members {
    fn merge(&mut self, incoming: Self) {
        self.0.extend(incoming.0);
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn remote_write_merges_into_local_value() {
    let kv = MockKv::new("members");
    let cancel = CancellationToken::new();
    let local: Store<Members, MockKv> = Store::builder(kv.handle()).build();
    let remote: Store<Members, MockKv> = Store::builder(kv.handle()).build();
    local.start(cancel.clone(), false).await.unwrap();
    remote.start(cancel.clone(), false).await.unwrap();

    local.put("team", Members::of(&["v1"])).await.unwrap();
    eventually(|| remote.get("team").is_some()).await;
    remote.put("team", Members::of(&["v2"])).await.unwrap();

    eventually(|| local.get("team") == Some(Members::of(&["v1", "v2"]))).await;
    assert_eq!(remote.get("team"), Some(Members::of(&["v1", "v2"])));
    cancel.cancel();
}

#[tokio::test]
async fn remote_callbacks_fire_for_other_writers_only() {
    let kv = MockKv::new("members");
    let cancel = CancellationToken::new();
    let events = Arc::new(Mutex::new(Vec::new()));

    let observer: Store<Members, MockKv> = {
        let updates = Arc::clone(&events);
        let deletes = Arc::clone(&events);
        Store::builder(kv.handle())
            .on_remote_update(move |key, value: &Members| {
                updates.lock().unwrap().push(format!("update {key} {}", value.0.len()));
            })
            .on_remote_delete(move |key, value| {
                deletes.lock().unwrap().push(format!("delete {key} {}", value.is_some()));
            })
            .build()
    };
    let writer: Store<Members, MockKv> = Store::builder(kv.handle()).build();
    observer.start(cancel.clone(), false).await.unwrap();

    writer.put("team", Members::of(&["a", "b"])).await.unwrap();
    eventually(|| observer.get("team").is_some()).await;
    writer.delete("team").await.unwrap();
    eventually(|| observer.get("team").is_none()).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["update team 2".to_string(), "delete team true".to_string()]
    );
    cancel.cancel();
}

#[tokio::test]
async fn concurrent_compute_updates_are_linearizable() {
    let kv = MockKv::new("members");
    let mut tasks = Vec::new();
    for i in 0..20 {
        let store: Store<Members, MockKv> = Store::builder(kv.handle()).build();
        tasks.push(tokio::spawn(async move {
            store
                .compute_update("team", true, |_, existing: Option<Members>| {
                    let mut members = existing.unwrap_or_else(|| Members::of(&[]));
                    members.0.insert(format!("m{i}"));
                    Ok::<_, rpnet_sync::StoreError>((members, true))
                })
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stored: Members = serde_json::from_slice(&kv.value("team").unwrap()).unwrap();
    assert_eq!(stored.0.len(), 20);
}

#[tokio::test]
async fn watch_task_ends_on_cancel() {
    let kv = MockKv::new("members");
    let store: Store<Members, MockKv> = Store::builder(kv).build();
    let cancel = CancellationToken::new();
    let task = store.start(cancel.clone(), false).await.unwrap();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}
