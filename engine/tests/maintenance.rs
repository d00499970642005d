mod common;

use blocksnap_backends::Backend;
use blocksnap_core::metadata::GLOBAL_LOCK;
use blocksnap_core::{BlockUid, Error, MetadataStore, VersionFilter};
use blocksnap_engine::{BackupRequest, RestoreOptions};
use bytes::Bytes;
use common::{BLOCK_SIZE, blob_count, engine, engine_with, image, url, write_image};
use std::sync::Arc;
use std::time::Duration;

const SIZE: u64 = 131072;

#[tokio::test]
async fn test_scrub_only_invalidates_and_deep_scrub_revalidates() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, backend) = engine(dir.path());
    let data = image(SIZE, 1, &[]);
    let source = write_image(dir.path(), "source.img", &data);
    let version = engine.backup(BackupRequest::new("vm1", "snap-1", url(&source))).await.unwrap();
    engine.scrub(version.uid, 100).await.unwrap();

    let block = engine.metadata().get_block(version.uid, 3).unwrap().unwrap();
    let key = block.uid.storage_key().unwrap();
    let original = backend.read(&key).await.unwrap();
    backend.corrupt(&key, Bytes::from_static(b"truncated")).unwrap();

    assert!(matches!(engine.scrub(version.uid, 100).await, Err(Error::Corrupt(_))));
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);
    assert!(!engine.metadata().get_block(version.uid, 3).unwrap().unwrap().valid);

    // The blob is fine again, but a shallow scrub has no ground truth.
    backend.write(&key, original).await.unwrap();
    engine.scrub(version.uid, 100).await.unwrap();
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);

    // Differences from the source do not count against the backup, nor do
    // they allow revalidation.
    let changed = image(SIZE, 2, &[]);
    std::fs::write(&source, &changed).unwrap();
    engine.deep_scrub(version.uid, Some(&url(&source)), 100).await.unwrap();
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);

    // A partial deep scrub does not revalidate either.
    std::fs::write(&source, &data).unwrap();
    engine.deep_scrub(version.uid, None, 50).await.unwrap();
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);

    engine.deep_scrub(version.uid, Some(&url(&source)), 100).await.unwrap();
    assert!(engine.metadata().get_version(version.uid).unwrap().valid);
    assert!(engine.metadata().get_block(version.uid, 3).unwrap().unwrap().valid);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_deep_scrub_needs_a_source_for_invalid_sparse_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _backend) = engine(dir.path());

    // A version whose blocks are all unread placeholders.
    let mut meta = MetadataStore::open(&engine.config().metadata_path, false).unwrap();
    let version = meta.create_version("vm1", "snap-1", SIZE, BLOCK_SIZE, false, false).unwrap();
    for id in 0..version.blocks_count() {
        meta.set_block(id, version.uid, BlockUid::sparse(), None, BLOCK_SIZE, false, false)
            .unwrap();
    }
    meta.commit().unwrap();
    meta.close().unwrap();

    engine.deep_scrub(version.uid, None, 100).await.unwrap();
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);
    assert!(!engine.metadata().get_block(version.uid, 0).unwrap().unwrap().valid);

    // Data where the placeholders claim zeros keeps them invalid too.
    let source = write_image(dir.path(), "source.img", &image(SIZE, 1, &[]));
    engine.deep_scrub(version.uid, Some(&url(&source)), 100).await.unwrap();
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);

    let zeros = write_image(dir.path(), "zeros.img", &vec![0u8; SIZE as usize]);
    engine.deep_scrub(version.uid, Some(&url(&zeros)), 100).await.unwrap();
    assert!(engine.metadata().get_version(version.uid).unwrap().valid);
    assert!(engine.metadata().get_block(version.uid, 0).unwrap().unwrap().valid);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_deep_scrub_catches_silent_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, backend) = engine(dir.path());
    let data = image(SIZE, 1, &[10]);
    let source = write_image(dir.path(), "source.img", &data);
    let version = engine.backup(BackupRequest::new("vm1", "snap-1", url(&source))).await.unwrap();

    let block = engine.metadata().get_block(version.uid, 7).unwrap().unwrap();
    let key = block.uid.storage_key().unwrap();
    backend.corrupt(&key, Bytes::from(vec![0x55u8; BLOCK_SIZE as usize])).unwrap();

    // Sizes still agree, so only hashing the content shows the damage.
    assert!(matches!(engine.scrub(version.uid, 100).await, Err(Error::Corrupt(_))));
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);
    assert!(!engine.metadata().get_block(version.uid, 7).unwrap().unwrap().valid);
    assert!(matches!(engine.deep_scrub(version.uid, None, 100).await, Err(Error::Corrupt(_))));
    assert!(!engine.metadata().get_version(version.uid).unwrap().valid);

    let mut request = BackupRequest::new("vm1", "snap-2", url(&source));
    request.base_version = Some(version.uid);
    assert!(matches!(engine.backup(request).await, Err(Error::Usage(_))));

    // Restore keeps going past the bad block and reports it at the end.
    let target = dir.path().join("restored.img");
    let restored = engine
        .restore(version.uid, target.to_str().unwrap(), RestoreOptions::default())
        .await;
    assert!(matches!(restored, Err(Error::Corrupt(_))));
    let written = std::fs::read(&target).unwrap();
    assert_eq!(written.len(), SIZE as usize);
    assert_eq!(written[..7 * 4096], data[..7 * 4096]);
    assert_eq!(written[8 * 4096..], data[8 * 4096..]);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_rm_and_cleanup_keep_shared_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _backend) = engine(dir.path());
    let first_data = image(SIZE, 1, &[]);
    let mut second_data = first_data.clone();
    second_data[16 * 4096..].copy_from_slice(&image(SIZE, 2, &[])[16 * 4096..]);
    let first_source = write_image(dir.path(), "first.img", &first_data);
    let second_source = write_image(dir.path(), "second.img", &second_data);

    let first = engine.backup(BackupRequest::new("vm1", "snap-1", url(&first_source))).await.unwrap();
    let second = engine.backup(BackupRequest::new("vm1", "snap-2", url(&second_source))).await.unwrap();
    assert_eq!(blob_count(&engine).await, 48);

    assert!(matches!(engine.rm(first.uid, false, false).await, Err(Error::Usage(_))));
    engine.rm(first.uid, true, false).await.unwrap();
    assert!(matches!(
        engine.metadata().get_version(first.uid),
        Err(Error::NotFound { .. })
    ));
    assert_eq!(engine.metadata().count_tombstones().unwrap(), 32);
    // Nothing is deleted until a cleanup runs.
    assert_eq!(blob_count(&engine).await, 48);
    assert_eq!(engine.metadata_ls().await.unwrap(), vec![second.uid]);

    let report = engine.cleanup(Duration::ZERO).await.unwrap();
    assert_eq!(report.removed, 16);
    assert_eq!(report.failed, 0);
    assert_eq!(engine.metadata().count_tombstones().unwrap(), 0);
    assert_eq!(blob_count(&engine).await, 32);

    let target = dir.path().join("restored.img");
    engine
        .restore(second.uid, target.to_str().unwrap(), RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), second_data);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_young_tombstones_survive_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _backend) = engine(dir.path());
    let source = write_image(dir.path(), "source.img", &image(SIZE, 1, &[]));
    let version = engine.backup(BackupRequest::new("vm1", "snap-1", url(&source))).await.unwrap();
    engine.rm(version.uid, true, true).await.unwrap();

    let report = engine.cleanup(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(engine.metadata().count_tombstones().unwrap(), 32);
    assert_eq!(blob_count(&engine).await, 32);
    // The metadata backup was kept.
    assert_eq!(engine.metadata_ls().await.unwrap(), vec![version.uid]);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_full_cleanup_removes_orphans_under_the_global_lock() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _backend) = engine(dir.path());
    let source = write_image(dir.path(), "source.img", &image(SIZE, 1, &[]));
    let first = engine.backup(BackupRequest::new("vm1", "snap-1", url(&source))).await.unwrap();
    let other = write_image(dir.path(), "other.img", &image(SIZE, 5, &[]));
    let second = engine.backup(BackupRequest::new("vm2", "snap-1", url(&other))).await.unwrap();
    engine.rm(first.uid, true, false).await.unwrap();

    let locking = engine.metadata().locking();
    let guard = locking.lock(&second.uid.lock_name(), "test").unwrap();
    assert!(matches!(engine.cleanup_full().await, Err(Error::AlreadyLocked { .. })));
    drop(guard);

    let report = engine.cleanup_full().await.unwrap();
    assert_eq!(report.removed, 32);
    assert_eq!(blob_count(&engine).await, 32);
    engine.scrub(second.uid, 100).await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_global_lock_blocks_version_operations() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _backend) = engine(dir.path());
    let source = write_image(dir.path(), "source.img", &image(SIZE, 1, &[]));
    let version = engine.backup(BackupRequest::new("vm1", "snap-1", url(&source))).await.unwrap();

    let locking = engine.metadata().locking();
    let guard = locking.lock(GLOBAL_LOCK, "test").unwrap();
    match engine.protect(version.uid) {
        Err(Error::AlreadyLocked { name, holder }) => {
            assert_eq!(name, GLOBAL_LOCK);
            assert!(holder.contains(locking.process_id()), "{}", holder);
            assert!(holder.ends_with("for test"), "{}", holder);
        }
        other => panic!("expected the global lock to refuse, got {:?}", other),
    }
    assert!(matches!(engine.scrub(version.uid, 100).await, Err(Error::AlreadyLocked { .. })));
    // The refused operation left no lock behind.
    assert!(!locking.is_locked(&version.uid.lock_name()).unwrap());
    drop(guard);

    engine.protect(version.uid).unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_protect_tags_and_listing() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _backend) = engine(dir.path());
    let source = write_image(dir.path(), "source.img", &image(SIZE, 1, &[]));
    let first = engine.backup(BackupRequest::new("vm1", "snap-1", url(&source))).await.unwrap();
    let second = engine.backup(BackupRequest::new("vm2", "snap-1", url(&source))).await.unwrap();

    engine.protect(first.uid).unwrap();
    assert!(matches!(engine.rm(first.uid, true, false).await, Err(Error::Usage(_))));
    engine.unprotect(first.uid).unwrap();

    engine.add_tag(second.uid, "weekly").unwrap();
    assert!(matches!(
        engine.add_tag(second.uid, "weekly"),
        Err(Error::AlreadyExists { .. })
    ));
    let tagged = engine.ls(&VersionFilter::default().with_tag("weekly")).unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].uid, second.uid);
    engine.rm_tag(second.uid, "weekly").unwrap();
    assert!(matches!(engine.rm_tag(second.uid, "weekly"), Err(Error::NotFound { .. })));

    let named = engine.ls(&VersionFilter::default().with_name("vm1")).unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].uid, first.uid);

    engine.rm(first.uid, true, false).await.unwrap();
    assert_eq!(engine.ls(&VersionFilter::default()).unwrap().len(), 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_export_import_into_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, backend) = engine(dir.path());
    let data = image(SIZE, 1, &[0, 9]);
    let source = write_image(dir.path(), "source.img", &data);
    let mut request = BackupRequest::new("vm1", "snap-1", url(&source));
    request.tags = vec!["monthly".to_string()];
    let version = engine.backup(request).await.unwrap();

    let mut exported = Vec::new();
    engine.export(&[version.uid], &mut exported).unwrap();

    let other_dir = tempfile::tempdir().unwrap();
    let mut other = engine_with(other_dir.path(), backend.clone());
    assert_eq!(other.import(&exported[..]).unwrap(), vec![version.uid]);
    assert!(matches!(other.import(&exported[..]), Err(Error::AlreadyExists { .. })));

    let imported = other.metadata().get_version(version.uid).unwrap();
    assert_eq!(imported.name, version.name);
    assert_eq!(imported.snapshot_name, version.snapshot_name);
    assert_eq!(imported.size, version.size);
    assert_eq!(imported.block_size, version.block_size);
    assert_eq!(imported.valid, version.valid);
    assert_eq!(imported.tags, version.tags);
    assert_eq!(
        other.metadata().get_blocks_by_version(version.uid).unwrap().len(),
        engine.metadata().get_blocks_by_version(version.uid).unwrap().len()
    );
    for (a, b) in engine
        .metadata()
        .get_blocks_by_version(version.uid)
        .unwrap()
        .iter()
        .zip(other.metadata().get_blocks_by_version(version.uid).unwrap())
    {
        assert_eq!((a.id, a.uid, &a.checksum, a.size, a.valid), (b.id, b.uid, &b.checksum, b.size, b.valid));
    }

    let target = other_dir.path().join("restored.img");
    other
        .restore(version.uid, target.to_str().unwrap(), RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), data);
    other.close().await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_metadata_restore_from_block_store() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, backend) = engine(dir.path());
    let source = write_image(dir.path(), "source.img", &image(SIZE, 1, &[]));
    let version = engine.backup(BackupRequest::new("vm1", "snap-1", url(&source))).await.unwrap();
    assert!(matches!(
        engine.metadata_backup(&[version.uid], false).await,
        Err(Error::AlreadyExists { .. })
    ));
    engine.metadata_backup(&[version.uid], true).await.unwrap();
    engine.close().await.unwrap();

    // A new metadata store over the same block store.
    let other_dir = tempfile::tempdir().unwrap();
    let mut other = engine_with(other_dir.path(), backend);
    assert!(other.ls(&VersionFilter::default()).unwrap().is_empty());
    assert_eq!(other.metadata_ls().await.unwrap(), vec![version.uid]);

    let holder = MetadataStore::open(&other.config().metadata_path, false).unwrap();
    let guard = holder.locking().lock(GLOBAL_LOCK, "import").unwrap();
    assert!(matches!(
        other.metadata_restore(&[version.uid]).await,
        Err(Error::AlreadyLocked { .. })
    ));
    assert!(other.ls(&VersionFilter::default()).unwrap().is_empty());
    drop(guard);
    holder.close().unwrap();

    assert_eq!(other.metadata_restore(&[version.uid]).await.unwrap(), vec![version.uid]);
    assert!(!other.metadata().locking().is_locked(GLOBAL_LOCK).unwrap());
    assert!(other.metadata().get_version(version.uid).unwrap().valid);
    other.deep_scrub(version.uid, Some(&url(&source)), 100).await.unwrap();
    other.close().await.unwrap();
}

#[tokio::test]
async fn test_enforce_retention_policy() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _backend) = engine(dir.path());
    let source = write_image(dir.path(), "source.img", &image(SIZE, 1, &[]));
    let mut vm1 = Vec::new();
    for snapshot in ["a", "b", "c"] {
        vm1.push(engine.backup(BackupRequest::new("vm1", snapshot, url(&source))).await.unwrap());
    }
    let vm2 = engine.backup(BackupRequest::new("vm2", "a", url(&source))).await.unwrap();

    let dismissed = engine
        .enforce_retention_policy("latest2", &VersionFilter::default(), true, false)
        .await
        .unwrap();
    assert_eq!(dismissed.iter().map(|v| v.uid).collect::<Vec<_>>(), vec![vm1[0].uid]);
    assert_eq!(engine.ls(&VersionFilter::default()).unwrap().len(), 4);

    engine.protect(vm1[1].uid).unwrap();
    let dismissed = engine
        .enforce_retention_policy("latest1", &VersionFilter::default(), false, false)
        .await
        .unwrap();
    assert_eq!(dismissed.iter().map(|v| v.uid).collect::<Vec<_>>(), vec![vm1[0].uid]);

    let remaining: Vec<_> = engine
        .ls(&VersionFilter::default())
        .unwrap()
        .into_iter()
        .map(|v| v.uid)
        .collect();
    assert_eq!(remaining, vec![vm1[1].uid, vm1[2].uid, vm2.uid]);
    assert!(engine.enforce_retention_policy("latest0", &VersionFilter::default(), true, false).await.is_err());
    engine.close().await.unwrap();
}
