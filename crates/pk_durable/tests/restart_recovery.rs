//! 重启恢复：日志是唯一事实来源，内存索引可由重放重建

use pk_core::RenderedView;
use pk_durable::{CommitRequest, EventStore, ListQuery, StreamStore};
use serde_json::json;

fn request(stream: &str, key: Option<&str>, title: &str) -> CommitRequest {
    CommitRequest {
        stream: stream.to_string(),
        key: key.map(str::to_string),
        view: RenderedView {
            title: title.to_string(),
            ..Default::default()
        },
        highlights: vec!["is-new".to_string()],
        data: json!({ "title": title }),
    }
}

#[tokio::test]
async fn test_rebuild_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("peek.db");

    let (kept_id, kept_created) = {
        let store = EventStore::open(&path).await.unwrap();
        let first = store
            .commit(request("deploys", Some("api"), "started"))
            .await
            .unwrap();
        store
            .commit(request("alerts", None, "disk"))
            .await
            .unwrap();
        store
            .commit(request("deploys", Some("api"), "finished"))
            .await
            .unwrap();
        store.close().await;
        (first.id, first.created_at)
    };

    let store = EventStore::open(&path).await.unwrap();
    assert_eq!(store.last_sequence(), 3);
    assert_eq!(store.count().await.unwrap(), 2);

    let index = StreamStore::rebuild(store.replay().await.unwrap());
    let item = index.get("deploys", &kept_id).unwrap();
    assert_eq!(item.view.title, "finished");
    assert_eq!(item.created_at, kept_created);
    assert_eq!(item.highlights, vec!["is-new"]);

    let page = index.list(&ListQuery::default());
    assert_eq!(
        page.items.iter().map(|i| i.sequence).collect::<Vec<_>>(),
        vec![3, 2]
    );
}

#[tokio::test]
async fn test_sequence_not_reused_after_delete_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peek.db");

    {
        let store = EventStore::open(&path).await.unwrap();
        store
            .commit(request("s", Some("a"), "a"))
            .await
            .unwrap();
        let item = store
            .commit(request("s", Some("b"), "b"))
            .await
            .unwrap();
        store
            .delete("s", &item.id)
            .await
            .unwrap();
        store.close().await;
    }

    let store = EventStore::open(&path).await.unwrap();
    assert_eq!(store.last_sequence(), 3);
    assert_eq!(store.reserve().await.sequence(), 4);
    assert!(store.get("s", "b").await.unwrap().is_none());
}
