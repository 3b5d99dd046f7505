//! Scoped service behavior over both backends.

mod common;

use common::{read_file, test_config, test_lock_dir, test_service, write_file};
use ghost_core::GhostError;
use ghost_vfs::cache::{buffer_key, object_key};
use ghost_vfs::lock::LockOptions;
use ghost_vfs::{
    CachedValue, DatabaseStorageDriver, DiskStorageDriver, DriverKind, FileRevision, GhostService,
    ListingOptions, MemoryObjectCache, ObjectCache, ScopeLimits, ScopeOptions, ScopedGhost, UpsertOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_reads_are_cached_until_written() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    service.initialize(true, true).await.unwrap();
    let global = service.global().unwrap();
    assert_eq!(global.primary_kind(), DriverKind::Database);

    global
        .upsert_file("/", "settings.json", br#"{"theme":"dark"}"#, UpsertOptions::default())
        .await
        .unwrap();
    let value = global.read_file_as_object("/", "settings.json").await.unwrap();
    assert_eq!(value["theme"], "dark");

    let cache = service.cache();
    assert!(cache.has(&object_key("data/global/settings.json")).await);
    assert!(cache.has(&buffer_key("data/global/settings.json")).await);

    global
        .upsert_file("/", "settings.json", br#"{"theme":"light"}"#, UpsertOptions::default())
        .await
        .unwrap();
    assert!(!cache.has(&object_key("data/global/settings.json")).await);

    let value = global.read_file_as_object("/", "settings.json").await.unwrap();
    assert_eq!(value["theme"], "light");
    assert!(global.file_exists("/", "settings.json").await);
    assert!(!global.file_exists("/", "missing.json").await);
}

#[tokio::test]
async fn test_size_limits() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.limits.max_file_size = "1kb".to_string();
    config.limits.max_model_file_size = "4kb".to_string();
    let db = DatabaseStorageDriver::connect_in_memory().await.unwrap();
    let service = GhostService::new(config, Some(db), Arc::new(MemoryObjectCache::new(1 << 20))).unwrap();

    let bot = service.for_bot("b1").unwrap();
    let err = bot
        .upsert_file("/", "big.json", vec![b'x'; 2048], UpsertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GhostError::SizeLimitExceeded { size: 2048, limit: 1024, .. }));

    bot.upsert_file("models", "intent.model", vec![0u8; 2048], UpsertOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_locked_bot_rejects_writes() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    let bot = service.for_bot("locked-bot").unwrap();

    bot.upsert_file("/", "bot.config.json", br#"{"locked":true}"#, UpsertOptions::default())
        .await
        .unwrap();

    let err = bot
        .upsert_file("flows", "main.flow.json", b"{}", UpsertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GhostError::ScopeLocked { ref scope } if scope == "locked-bot"));
    assert!(matches!(
        bot.delete_file("/", "bot.config.json").await.unwrap_err(),
        GhostError::ScopeLocked { .. }
    ));

    // Model paths and explicit bypasses still go through.
    bot.upsert_file("./models", "x.model", b"m", UpsertOptions::default())
        .await
        .unwrap();
    let bypass = UpsertOptions {
        ignore_lock: true,
        ..UpsertOptions::default()
    };
    bot.upsert_file("flows", "main.flow.json", b"{}", bypass)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_glob_scope_is_read_only() {
    let temp = TempDir::new().unwrap();
    write_file(temp.path(), "data/bots/b1/bot.config.json", b"{}");
    write_file(temp.path(), "data/bots/b2/bot.config.json", b"{}");

    let disk = Arc::new(DiskStorageDriver::new(
        temp.path(),
        LockOptions::new(test_lock_dir()),
    ));
    let cache = Arc::new(MemoryObjectCache::new(1 << 20));
    let scope = ScopedGhost::new(
        "data/bots/*",
        disk,
        None,
        false,
        cache.clone(),
        ScopeOptions::default(),
        ScopeLimits::default(),
    )
    .unwrap();

    let listing = scope
        .directory_listing("/", "bot.config.json", ListingOptions::default())
        .await
        .unwrap();
    assert_eq!(listing, vec!["b1/bot.config.json", "b2/bot.config.json"]);

    let err = scope
        .upsert_file("b1", "x.json", b"{}", UpsertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GhostError::InvalidScope(_)));
    assert!(scope.read_file_as_buffer("b1", "bot.config.json").await.is_err());

    // A warm cache must not bypass the scope check.
    cache
        .set(
            &object_key("data/bots/b1/bot.config.json"),
            CachedValue::object(serde_json::json!({})),
        )
        .await;
    let err = scope
        .read_file_as_object("b1", "bot.config.json")
        .await
        .unwrap_err();
    assert!(matches!(err, GhostError::InvalidScope(_)));
}

#[tokio::test]
async fn test_lock_files_stay_out_of_the_data_root() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    service
        .root(Some(false))
        .unwrap()
        .upsert_file("global", "a.txt", "a", UpsertOptions::default())
        .await
        .unwrap();

    assert!(!test_lock_dir().starts_with(temp.path()));
    let entries: Vec<String> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["data"]);
}

#[tokio::test]
async fn test_invalid_json_is_reported() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    let global = service.global().unwrap();

    global
        .upsert_file("/", "lenient.json", b"{ \"a\": 1, }", UpsertOptions::default())
        .await
        .unwrap();
    let err = global.read_file_as_object("/", "lenient.json").await.unwrap_err();
    match err {
        GhostError::InvalidJson { path, message } => {
            assert_eq!(path, "data/global/lenient.json");
            assert!(message.contains("trailing commas"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!service.cache().has(&object_key("data/global/lenient.json")).await);
}

#[tokio::test]
async fn test_listing_filters_and_missing_folders() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    let bot = service.for_bot("b1").unwrap();

    for file in ["flows/main.flow.json", "flows/main.flow.ui.json", "flows/README"] {
        bot.upsert_file("/", file, b"{}", UpsertOptions::untracked())
            .await
            .unwrap();
    }

    let flows = bot
        .directory_listing("flows", "*.flow.json", ListingOptions::default())
        .await
        .unwrap();
    assert_eq!(flows, vec!["main.flow.json"]);

    let everything = bot
        .directory_listing("flows", "*", ListingOptions::default())
        .await
        .unwrap();
    assert_eq!(everything.len(), 3);

    let missing = bot
        .directory_listing("nowhere", "*.*", ListingOptions::default())
        .await
        .unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_rename_and_delete_folder() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    service.initialize(false, true).await.unwrap();
    let global = service.global().unwrap();
    assert_eq!(global.primary_kind(), DriverKind::Disk);

    global
        .upsert_file("content", "a.txt", b"A", UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(global.read_file_as_string("content", "a.txt").await.unwrap(), "A");

    global.rename_file("content", "a.txt", "b.txt").await.unwrap();
    assert!(!global.file_exists("content", "a.txt").await);
    assert_eq!(read_file(temp.path(), "data/global/content/b.txt"), b"A");
    assert!(!service.cache().has(&buffer_key("data/global/content/a.txt")).await);

    global.delete_folder("content").await.unwrap();
    assert!(!temp.path().join("data/global/content").exists());
}

#[tokio::test]
async fn test_sync_converges_disk_into_database() {
    let temp = TempDir::new().unwrap();
    write_file(temp.path(), "data/global/a.json", b"{\"a\":1}");
    write_file(temp.path(), "data/global/sub/b.txt", b"b");
    write_file(temp.path(), "data/global/node_modules/pkg/index.js", b"js");

    let service = test_service(&temp).await;
    service.initialize(true, true).await.unwrap();
    let global = service.global().unwrap();

    global
        .upsert_file("/", "stale.json", b"{}", UpsertOptions::default())
        .await
        .unwrap();
    global
        .upsert_file("/", "a.json", b"old", UpsertOptions::default())
        .await
        .unwrap();

    let report = global.sync().await.unwrap();
    assert_eq!(report.files_uploaded, 2);
    assert_eq!(report.files_deleted, 1);

    assert_eq!(global.read_file_as_buffer("/", "a.json").await.unwrap(), b"{\"a\":1}");
    assert_eq!(global.read_file_as_buffer("sub", "b.txt").await.unwrap(), b"b");
    assert!(!global.file_exists("/", "stale.json").await);
    assert!(!global.file_exists("node_modules/pkg", "index.js").await);
}

#[tokio::test]
async fn test_pending_changes_grouped_by_folder() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    service.initialize(true, true).await.unwrap();

    let bot = service.for_bot("b1").unwrap();
    assert!(bot.is_fully_synced().await.unwrap());

    bot.upsert_file("flows", "main.flow.json", b"{}", UpsertOptions::default())
        .await
        .unwrap();
    bot.upsert_file("flows", "other.flow.json", b"{}", UpsertOptions::default())
        .await
        .unwrap();
    bot.upsert_file("/", "bot.config.json", b"{}", UpsertOptions::default())
        .await
        .unwrap();

    let pending = bot.get_pending_changes().await.unwrap();
    assert_eq!(pending["flows"].len(), 2);
    assert_eq!(pending["root"].len(), 1);
    assert!(!bot.is_fully_synced().await.unwrap());

    let server = service.get_pending(&["b1"]).await.unwrap();
    assert!(server.global.is_empty());
    assert_eq!(server.bots.len(), 1);
}

#[tokio::test]
async fn test_export_and_import_directory() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    service.initialize(true, true).await.unwrap();

    let source = service.for_bot("source").unwrap();
    source
        .upsert_file("/", "bot.config.json", b"{\"name\":\"source\"}", UpsertOptions::default())
        .await
        .unwrap();
    source
        .upsert_file("content", "hello.txt", b"hello", UpsertOptions::default())
        .await
        .unwrap();

    let export_dir = TempDir::new().unwrap();
    let mut files = source
        .export_to_directory(export_dir.path(), &[] as &[&str])
        .await
        .unwrap();
    files.sort();
    assert_eq!(files, vec!["bot.config.json", "content/hello.txt", "revisions.json"]);

    let revisions: Vec<FileRevision> =
        serde_json::from_slice(&read_file(export_dir.path(), "revisions.json")).unwrap();
    assert_eq!(revisions.len(), 2);

    let target = service.for_bot("target").unwrap();
    let imported = target.import_from_directory(export_dir.path()).await.unwrap();
    assert_eq!(imported, 3);
    assert_eq!(
        target.read_file_as_string("content", "hello.txt").await.unwrap(),
        "hello"
    );
}

#[tokio::test]
async fn test_sync_request_pulls_folder_to_disk() {
    let temp = TempDir::new().unwrap();
    let service = test_service(&temp).await;
    service.initialize(true, true).await.unwrap();
    service.start_sync_listener();

    let bot = service.for_bot("b1").unwrap();
    let options = UpsertOptions {
        sync_db_to_disk: true,
        ..UpsertOptions::default()
    };
    bot.upsert_file("flows", "main.flow.json", b"{\"nodes\":[]}", options)
        .await
        .unwrap();

    let target = temp.path().join("data/bots/b1/flows/main.flow.json");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !target.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("file was not pulled to disk");

    // The pull may still be writing; wait for the full payload.
    tokio::time::timeout(Duration::from_secs(5), async {
        while std::fs::read(&target).unwrap_or_default() != b"{\"nodes\":[]}" {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("file content mismatch");

    service.shutdown();
}
