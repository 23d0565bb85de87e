use std::sync::Arc;

use bytes::Bytes;
use libdfork::lifecycle::{ImageService, OpenFlags};
use libdfork::locator;
use libdfork::store::memory::{MemoryStore, OpKind};
use libdfork::store::objclass::{KEY_DIRTY, KEY_LOCATIONS, KEY_RESET_LOCK};
use libdfork::{DforkClient, DforkConfig, DirtyProtocol, ImageIdentity};
use tokio::sync::oneshot;

fn make_client(protocol: DirtyProtocol) -> DforkClient<MemoryStore> {
    let config = DforkConfig {
        protocol,
        no_progress: true,
        ..DforkConfig::default()
    };
    DforkClient::new(Arc::new(MemoryStore::new()), config)
}

async fn make_image(client: &DforkClient<MemoryStore>, name: &str) -> (ImageIdentity, String) {
    let info = client.images().create(name, 4 << 22, 22).await.unwrap();
    (ImageIdentity::by_name(name).unwrap(), info.id)
}

async fn header_key(store: &MemoryStore, image_id: &str, key: &str) -> Option<Vec<u8>> {
    store
        .get_object(&locator::header_object_name(image_id))
        .await
        .and_then(|obj| obj.omap.get(key).cloned())
}

async fn write(
    client: &DforkClient<MemoryStore>,
    image: &ImageIdentity,
    object_no: u64,
) -> libdfork::Result<()> {
    let mut handle = client.images().open(image, OpenFlags::empty()).await?;
    client
        .images()
        .write_object(&mut handle, object_no, 0, Bytes::from_static(b"data"))
        .await
}

#[tokio::test]
async fn test_reset_on_clean_image_is_noop() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, id) = make_image(&client, "disk").await;
    client.store().clear_op_log();

    let visited = client.reset_dirty(&disk).await.unwrap();
    assert!(visited.is_empty());

    let data_ops = client
        .store()
        .op_log()
        .into_iter()
        .filter(|op| op.oid.starts_with(locator::RBD_DATA_PREFIX))
        .count();
    assert_eq!(data_ops, 0);
    assert_eq!(client.check_dirty(&disk, false, true).await.unwrap(), 0);
    assert_eq!(header_key(client.store(), &id, KEY_LOCATIONS).await, None);
    assert_eq!(header_key(client.store(), &id, KEY_RESET_LOCK).await, None);
}

#[tokio::test]
async fn test_dirty_round_trip() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, id) = make_image(&client, "disk").await;

    client.set_dirty(&disk, 1, None).await.unwrap();
    assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 1);

    client.reset_dirty(&disk).await.unwrap();
    assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 0);
    assert_eq!(header_key(client.store(), &id, KEY_LOCATIONS).await, None);
}

#[tokio::test]
async fn test_block_on_clean_refuses_writers_until_unblocked() {
    for protocol in [DirtyProtocol::V2, DirtyProtocol::V3] {
        let client = make_client(protocol);
        let (disk, id) = make_image(&client, "disk").await;
        write(&client, &disk, 0).await.unwrap();
        client.fork_map(&disk).await.unwrap();

        assert_eq!(client.check_dirty(&disk, true, false).await.unwrap(), 0);
        let err = write(&client, &disk, 0).await.unwrap_err();
        assert_eq!(err.errno(), -libc::EBUSY, "{protocol}");

        client.unblock_dirty(&disk).await.unwrap();
        write(&client, &disk, 0).await.unwrap();
        assert_eq!(client.check_dirty(&disk, false, true).await.unwrap(), 1);
        assert_eq!(
            header_key(client.store(), &id, KEY_LOCATIONS).await,
            Some(locator::object_index_suffix(0).into_bytes())
        );
    }
}

#[tokio::test]
async fn test_block_is_not_armed_on_dirty_image() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, _) = make_image(&client, "disk").await;
    write(&client, &disk, 1).await.unwrap();
    client.fork_map(&disk).await.unwrap();
    client.set_dirty(&disk, 1, None).await.unwrap();

    assert_eq!(client.check_dirty(&disk, true, true).await.unwrap(), 1);
    write(&client, &disk, 1).await.unwrap();
}

#[tokio::test]
async fn test_locations_accumulate_and_drain_once() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, id) = make_image(&client, "disk").await;

    client.set_dirty(&disk, 1, Some("A".into())).await.unwrap();
    client.set_dirty(&disk, 1, Some("B".into())).await.unwrap();
    client.set_dirty(&disk, 1, Some("A".into())).await.unwrap();
    assert_eq!(
        header_key(client.store(), &id, KEY_LOCATIONS).await,
        Some(b"A&B".to_vec())
    );

    client.store().clear_op_log();
    let visited = client.reset_dirty(&disk).await.unwrap();
    assert_eq!(visited, vec!["A".to_string(), "B".to_string()]);
    let location_writes: Vec<_> = client
        .store()
        .op_log()
        .into_iter()
        .filter(|op| op.kind == OpKind::Write && op.oid.starts_with(locator::RBD_DATA_PREFIX))
        .map(|op| op.oid)
        .collect();
    assert_eq!(
        location_writes,
        vec![
            locator::location_object_name(&id, "A"),
            locator::location_object_name(&id, "B"),
        ]
    );
    assert_eq!(header_key(client.store(), &id, KEY_LOCATIONS).await, None);
    assert_eq!(client.check_dirty(&disk, false, true).await.unwrap(), 0);
}

#[tokio::test]
async fn test_full_object_name_location_is_reduced() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, id) = make_image(&client, "disk").await;
    let oid = locator::data_object_name(&id, 3);
    client.set_dirty(&disk, 1, Some(oid)).await.unwrap();
    assert_eq!(
        header_key(client.store(), &id, KEY_LOCATIONS).await,
        Some(b"0000000000000003".to_vec())
    );
}

#[tokio::test]
async fn test_failed_reset_preserves_locations() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, id) = make_image(&client, "disk").await;
    write(&client, &disk, 1).await.unwrap();
    client.fork_map(&disk).await.unwrap();
    write(&client, &disk, 1).await.unwrap();
    write(&client, &disk, 2).await.unwrap();
    write(&client, &disk, 2).await.unwrap();

    let failing = locator::data_object_name(&id, 1);
    client.store().fail_on(failing, -libc::EIO);
    let err = client.reset_dirty(&disk).await.unwrap_err();
    assert_eq!(err.errno(), -libc::EIO);

    assert_eq!(
        header_key(client.store(), &id, KEY_LOCATIONS).await,
        Some(b"0000000000000001&0000000000000002".to_vec())
    );
    assert_eq!(header_key(client.store(), &id, KEY_DIRTY).await, Some(vec![0]));
    assert_eq!(header_key(client.store(), &id, KEY_RESET_LOCK).await, None);
    // the location after the failing one was still visited
    let obj = client
        .store()
        .get_object(&locator::data_object_name(&id, 2))
        .await
        .unwrap();
    assert!(!obj.omap.contains_key(KEY_DIRTY));

    client.store().clear_faults();
    let visited = client.reset_dirty(&disk).await.unwrap();
    assert_eq!(visited.len(), 2);
    assert_eq!(header_key(client.store(), &id, KEY_LOCATIONS).await, None);
}

#[tokio::test]
async fn test_ambiguous_identity_issues_no_operations() {
    let client = make_client(DirtyProtocol::V3);
    let err = ImageIdentity::new("disk", "10ab").unwrap_err();
    assert_eq!(err.errno(), -libc::EINVAL);
    let err = ImageIdentity::new("", "").unwrap_err();
    assert_eq!(err.errno(), -libc::EINVAL);
    assert!(client.store().op_log().is_empty());
}

#[tokio::test]
async fn test_unknown_image_name() {
    let client = make_client(DirtyProtocol::V3);
    let missing = ImageIdentity::by_name("missing").unwrap();
    let err = client.set_dirty(&missing, 1, None).await.unwrap_err();
    assert!(err.is_not_found());
    let err = client.check_dirty(&missing, false, false).await.unwrap_err();
    assert_eq!(err.errno(), -libc::ENOENT);
}

#[tokio::test]
async fn test_send_reports_through_callback() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, _) = make_image(&client, "disk").await;
    client.set_dirty(&disk, 1, None).await.unwrap();

    let (tx, rx) = oneshot::channel();
    let req = client.check_dirty_request(disk, false, true);
    let handle = client.send(req, move |r| {
        let _ = tx.send(r);
    });
    assert_eq!(rx.await.unwrap().unwrap(), 1);
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn test_child_writes_are_not_tracked() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, id) = make_image(&client, "disk").await;
    write(&client, &disk, 0).await.unwrap();
    client.fork_super(&disk).await.unwrap();
    write(&client, &disk, 0).await.unwrap();
    assert_eq!(client.check_dirty(&disk, false, true).await.unwrap(), 0);
    assert_eq!(header_key(client.store(), &id, KEY_LOCATIONS).await, None);
}

#[tokio::test]
async fn test_interrupted_reset_is_taken_over() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, id) = make_image(&client, "disk").await;
    write(&client, &disk, 0).await.unwrap();
    client.fork_map(&disk).await.unwrap();
    write(&client, &disk, 0).await.unwrap();

    client
        .store()
        .fail_method_once(libdfork::cls::CLEAR_DIRTY_LOCATIONS, -libc::ETIMEDOUT);
    let err = client.reset_dirty(&disk).await.unwrap_err();
    assert_eq!(err.errno(), -libc::ETIMEDOUT);
    assert_eq!(header_key(client.store(), &id, KEY_RESET_LOCK).await, Some(vec![1]));

    let visited = client.reset_dirty(&disk).await.unwrap();
    assert_eq!(visited, vec![locator::object_index_suffix(0)]);
    assert_eq!(header_key(client.store(), &id, KEY_RESET_LOCK).await, None);
    assert_eq!(header_key(client.store(), &id, KEY_LOCATIONS).await, None);

    write(&client, &disk, 0).await.unwrap();
    client.set_dirty(&disk, 1, None).await.unwrap();
}

#[tokio::test]
async fn test_cached_check_sees_later_write() {
    let client = make_client(DirtyProtocol::V3);
    let (disk, _) = make_image(&client, "disk").await;
    write(&client, &disk, 0).await.unwrap();
    client.fork_map(&disk).await.unwrap();

    assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 0);
    write(&client, &disk, 0).await.unwrap();
    assert_eq!(client.check_dirty(&disk, false, false).await.unwrap(), 1);
    assert_eq!(client.check_dirty(&disk, false, true).await.unwrap(), 1);
}
