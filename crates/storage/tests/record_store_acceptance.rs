use std::{
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use storage::{RecordOp, RecordStore, RecordWrite, ScanDirection, Storage};

fn write(key: &str, partition: &str, position: i64) -> RecordWrite {
    RecordWrite {
        key: key.to_string(),
        partition: partition.to_string(),
        position,
        value: format!("{{\"key\":\"{key}\"}}"),
    }
}

#[tokio::test]
async fn records_survive_reopening_the_database_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("sync_storage_acceptance_{suffix}"));
    let db_path = temp_root.join("nested").join("records.db");
    let database_url = format!("sqlite://{}", db_path.display());

    {
        let storage = Storage::new(&database_url).await.expect("first open");
        storage
            .apply_batch(vec![
                RecordOp::ExpectPosition {
                    collection: "continuation_tokens".into(),
                    key: "conv".into(),
                    position: None,
                },
                RecordOp::Upsert {
                    collection: "continuation_tokens".into(),
                    record: write("conv", "conv", 2),
                },
                RecordOp::Upsert {
                    collection: "orphaned_events".into(),
                    record: write("evt-5", "conv", 5),
                },
                RecordOp::Upsert {
                    collection: "orphaned_events".into(),
                    record: write("evt-4", "conv", 4),
                },
            ])
            .await
            .expect("batch");
        storage.close().await;
    }

    let reopened = Storage::new(&database_url).await.expect("second open");
    let token = reopened
        .get("continuation_tokens", "conv")
        .await
        .expect("get")
        .expect("token persisted");
    assert_eq!(token.position, 2);

    let keys: Vec<String> = reopened
        .scan_partition("orphaned_events", "conv", ScanDirection::Ascending)
        .await
        .expect("scan")
        .into_iter()
        .map(|record| record.key)
        .collect();
    assert_eq!(keys, vec!["evt-4".to_string(), "evt-5".to_string()]);

    reopened.close().await;
    fs::remove_dir_all(temp_root).expect("cleanup");
}
