use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use libdfork::client::fork_snap_name;
use libdfork::lifecycle::{ImageService, OpenFlags};
use libdfork::locator;
use libdfork::request::SwitchTarget;
use libdfork::store::localfs::LocalFsStore;
use libdfork::store::memory::MemoryStore;
use libdfork::store::objclass::{KEY_IS_CHILD, KEY_MODE};
use libdfork::store::{ObjectStore, RemoveFlags};
use libdfork::{DforkClient, DforkConfig, ImageIdentity};

fn config(concurrency: usize) -> DforkConfig {
    DforkConfig {
        concurrent_management_ops: concurrency,
        no_progress: true,
        ..DforkConfig::default()
    }
}

async fn write_objects<S: ObjectStore + 'static>(
    client: &DforkClient<S>,
    image: &ImageIdentity,
    objects: impl IntoIterator<Item = u64>,
) {
    let mut handle = client
        .images()
        .open(image, OpenFlags::empty())
        .await
        .unwrap();
    for object_no in objects {
        client
            .images()
            .write_object(&mut handle, object_no, 0, Bytes::from_static(b"payload"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_bulk_remove_with_missing_object() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(2)));
    let client = DforkClient::new(store.clone(), config(3));
    let info = client.images().create("child", 8 << 20, 20).await.unwrap();
    let child = ImageIdentity::by_name("child").unwrap();
    write_objects(&client, &child, 0..8).await;

    let absent = locator::data_object_name(&info.id, 5);
    store.remove(&absent, RemoveFlags::empty()).await.unwrap();

    let summary = client.remove_objects(&child).await.unwrap();
    assert_eq!(summary.done, 8);
    assert_eq!(summary.skipped, 0);
    assert!(store.max_in_flight() <= 3);
    for object_no in 0..8 {
        assert!(!store.contains(&locator::data_object_name(&info.id, object_no)).await);
    }
}

#[tokio::test]
async fn test_bulk_remove_skips_unwritten_objects() {
    let store = Arc::new(MemoryStore::new());
    let client = DforkClient::new(store.clone(), config(4));
    client.images().create("child", 8 << 20, 20).await.unwrap();
    let child = ImageIdentity::by_name("child").unwrap();
    write_objects(&client, &child, [1, 6]).await;

    let summary = client.remove_objects(&child).await.unwrap();
    assert_eq!(summary.done, 2);
    assert_eq!(summary.skipped, 6);
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let client = DforkClient::new(Arc::new(MemoryStore::new()), config(4));
    let missing = ImageIdentity::by_name("never-created").unwrap();
    client.fork_abort(&missing).await.unwrap();

    client.images().create("child", 4 << 20, 20).await.unwrap();
    let child = ImageIdentity::by_name("child").unwrap();
    write_objects(&client, &child, 0..4).await;
    let summary = client.fork_abort(&child).await.unwrap();
    assert_eq!(summary.done, 4);
    client.fork_abort(&child).await.unwrap();
}

#[tokio::test]
async fn test_fork_create_and_remove() {
    let store = Arc::new(MemoryStore::new());
    let client = DforkClient::new(store.clone(), config(4));
    let parent_info = client.images().create("parent", 4 << 20, 20).await.unwrap();
    let parent = ImageIdentity::by_name("parent").unwrap();
    write_objects(&client, &parent, [0]).await;
    client.fork_map(&parent).await.unwrap();
    write_objects(&client, &parent, [0]).await;
    assert_eq!(client.check_dirty(&parent, false, true).await.unwrap(), 1);

    let child_info = client.fork_create(&parent, "child").await.unwrap();
    assert_eq!(client.check_dirty(&parent, false, true).await.unwrap(), 0);
    let parent_spec = child_info.parent.as_ref().unwrap();
    assert_eq!(parent_spec.image_id, parent_info.id);
    assert_eq!(parent_spec.snap_name, fork_snap_name("parent"));

    let handle = client
        .images()
        .open(&parent, OpenFlags::empty())
        .await
        .unwrap();
    assert!(
        client
            .images()
            .snap_is_protected(&handle, "parent-snap")
            .await
            .unwrap()
    );

    let child = ImageIdentity::by_name("child").unwrap();
    client.fork_super(&child).await.unwrap();
    let header = store
        .get_object(&locator::header_object_name(&child_info.id))
        .await
        .unwrap();
    assert_eq!(header.omap.get(KEY_IS_CHILD), Some(&vec![1]));

    client.fork_remove(&parent, "child").await.unwrap();
    let handle = client
        .images()
        .open(&parent, OpenFlags::empty())
        .await
        .unwrap();
    assert!(handle.info.snapshots.is_empty());
    let err = client
        .images()
        .open(&child, OpenFlags::empty())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_fork_remove_requires_protected_snapshot() {
    let client = DforkClient::new(Arc::new(MemoryStore::new()), config(4));
    client.images().create("parent", 4 << 20, 20).await.unwrap();
    client.images().create("child", 4 << 20, 20).await.unwrap();
    let parent = ImageIdentity::by_name("parent").unwrap();
    let mut handle = client
        .images()
        .open(&parent, OpenFlags::empty())
        .await
        .unwrap();
    client
        .images()
        .snap_create(&mut handle, "parent-snap", Default::default())
        .await
        .unwrap();

    let err = client.fork_remove(&parent, "child").await.unwrap_err();
    assert_eq!(err.errno(), -libc::EINVAL);
}

#[tokio::test]
async fn test_switch_off_all_images() {
    let store = Arc::new(MemoryStore::new());
    let client = DforkClient::new(store.clone(), config(4));
    let mut ids = Vec::new();
    for name in ["a", "b"] {
        ids.push(client.images().create(name, 1 << 20, 20).await.unwrap().id);
        client
            .fork_map(&ImageIdentity::by_name(name).unwrap())
            .await
            .unwrap();
    }

    client.switch(SwitchTarget::All, false, false).await.unwrap();
    for id in ids {
        let header = store
            .get_object(&locator::header_object_name(&id))
            .await
            .unwrap();
        assert_eq!(header.omap.get(KEY_MODE), Some(&vec![0]));
    }
}

#[tokio::test]
async fn test_transfer_rewrites_existing_objects() {
    let store = Arc::new(MemoryStore::new());
    let client = DforkClient::new(store.clone(), config(2));
    let info = client.images().create("child", 4 << 20, 20).await.unwrap();
    let child = ImageIdentity::by_name("child").unwrap();
    write_objects(&client, &child, [0, 2]).await;

    let summary = client.transfer(&child).await.unwrap();
    assert_eq!(summary.done, 2);
    assert_eq!(summary.skipped, 2);
    for object_no in [0, 2] {
        let obj = store
            .get_object(&locator::data_object_name(&info.id, object_no))
            .await
            .unwrap();
        assert_eq!(obj.data.len(), 1);
    }
    assert!(!store.contains(&locator::data_object_name(&info.id, 1)).await);
}

#[tokio::test]
async fn test_transfer_continues_past_failures() {
    let store = Arc::new(MemoryStore::new());
    let client = DforkClient::new(store.clone(), config(1));
    let info = client.images().create("child", 4 << 20, 20).await.unwrap();
    let child = ImageIdentity::by_name("child").unwrap();
    write_objects(&client, &child, [0, 1, 3]).await;

    store.fail_on(locator::data_object_name(&info.id, 1), -libc::EIO);
    let err = client.transfer(&child).await.unwrap_err();
    assert_eq!(err.errno(), -libc::EIO);
    for object_no in [0, 3] {
        let obj = store
            .get_object(&locator::data_object_name(&info.id, object_no))
            .await
            .unwrap();
        assert_eq!(obj.data.len(), 1);
    }
}

#[tokio::test]
async fn test_dirty_state_persists_in_local_pool() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(LocalFsStore::open(dir.path()).await.unwrap());
        let client = DforkClient::new(store, config(4));
        client.images().create("disk", 4 << 20, 20).await.unwrap();
        let disk = ImageIdentity::by_name("disk").unwrap();
        write_objects(&client, &disk, [0]).await;
        client.fork_map(&disk).await.unwrap();
        write_objects(&client, &disk, [0]).await;
    }

    let store = Arc::new(LocalFsStore::open(dir.path()).await.unwrap());
    let client = DforkClient::new(store, config(4));
    let disk = ImageIdentity::by_name("disk").unwrap();
    assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 1);
    let visited = client.reset_dirty(&disk).await.unwrap();
    assert_eq!(visited, vec![locator::object_index_suffix(0)]);
}
