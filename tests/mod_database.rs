use lauradb::document::ID_FIELD;
use lauradb::query::Filter;
use lauradb::{CancelToken, Database, DatabaseConfig, DbError, FindOptions, Value, doc};
use std::collections::HashSet;

fn open(dir: &std::path::Path) -> std::sync::Arc<Database> {
    Database::open(DatabaseConfig::new(dir)).unwrap()
}

#[test]
fn documents_survive_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut inserted_ids = HashSet::new();
    {
        let db = open(dir.path());
        let users = db.create_collection("users").unwrap();
        for i in 0..5i64 {
            let id = users
                .insert_one(doc! {
                    "name" => Value::String(format!("User {i}")),
                    "age" => Value::Int64(20 + i),
                })
                .unwrap();
            inserted_ids.insert(id);
        }
        db.close().unwrap();
    }

    let db = open(dir.path());
    let users = db.collection("users").expect("collection rediscovered from catalog");
    let found = users.find(&Filter::True, &FindOptions::default(), &CancelToken::new()).unwrap();
    assert_eq!(found.len(), 5);
    let found_ids: HashSet<_> = found.iter().filter_map(|d| d.id()).collect();
    assert_eq!(found_ids, inserted_ids);
    let names: HashSet<String> = found
        .iter()
        .map(|d| match d.get("name") {
            Some(Value::String(s)) => s.clone(),
            other => panic!("unexpected name {other:?}"),
        })
        .collect();
    assert_eq!(names.len(), 5);
    db.close().unwrap();
}

#[test]
fn collection_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection("a").unwrap();
    db.create_collection("b").unwrap();
    assert_eq!(db.list_collections(), vec!["a".to_string(), "b".to_string()]);

    let err = db.create_collection("a").unwrap_err();
    assert!(matches!(err, DbError::Duplicate(_)));
    assert!(matches!(db.create_collection("no/slash"), Err(DbError::InvalidInput(_))));
    assert!(matches!(db.collection_required("ghost"), Err(DbError::NotFound(_))));

    db.drop_collection("a").unwrap();
    assert!(matches!(db.drop_collection("a"), Err(DbError::NotFound(_))));
    assert_eq!(db.list_collections(), vec!["b".to_string()]);
    db.close().unwrap();
}

#[test]
fn dropped_collections_stay_gone_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        let col = db.create_collection("temp").unwrap();
        col.insert_one(doc! { "x" => Value::Int64(1) }).unwrap();
        db.drop_collection("temp").unwrap();
        db.close().unwrap();
    }
    let db = open(dir.path());
    assert!(db.collection("temp").is_none());
    db.close().unwrap();
}

#[test]
fn checkpoint_truncates_the_wal() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let col = db.create_collection("events").unwrap();
    for i in 0..20i64 {
        col.insert_one(doc! { "seq" => Value::Int64(i) }).unwrap();
    }
    let wal_path = dir.path().join("wal.log");
    assert!(std::fs::metadata(&wal_path).unwrap().len() > 0);
    db.checkpoint().unwrap();
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);

    // Everything is still readable from the data file.
    let found = col.find(&Filter::True, &FindOptions::default(), &CancelToken::new()).unwrap();
    assert_eq!(found.len(), 20);
    db.close().unwrap();
}

#[test]
fn ids_are_assigned_and_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let col = db.create_collection("things").unwrap();
    let id = col.insert_one(doc! { "k" => Value::Int64(1) }).unwrap();
    let fetched = col.find_by_id(id).unwrap();
    assert_eq!(fetched.get(ID_FIELD), Some(&Value::ObjectId(id)));
    db.close().unwrap();
}

#[test]
fn audit_sink_sees_every_operation() {
    use lauradb::audit::{AuditEvent, AuditSink, Severity};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<AuditEvent>>,
    }
    impl AuditSink for Recorder {
        fn log(&self, event: AuditEvent) {
            self.events.lock().push(event);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut config = DatabaseConfig::new(dir.path());
    config.audit = recorder.clone();
    let db = Database::open(config).unwrap();
    let col = db.create_collection("audited").unwrap();

    col.insert_one(doc! { "x" => Value::Int64(1) }).unwrap();
    let _ = col.find_one(&Filter::eq("x", Value::Int64(2)), &CancelToken::new());

    let events = recorder.events.lock();
    let insert = events.iter().find(|e| e.op == "insert_one").expect("insert audited");
    assert!(insert.success);
    assert_eq!(insert.severity, Severity::Info);
    assert_eq!(insert.collection, "audited");
    assert_eq!(insert.counts, Some(1));

    let find_event = events
        .iter()
        .find(|e| e.op == "find" && e.success)
        .expect("find audited");
    assert!(find_event.filter.is_some());
    drop(events);
    db.close().unwrap();
}

#[test]
fn buffer_pool_metrics_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let col = db.create_collection("m").unwrap();
    for i in 0..50i64 {
        col.insert_one(doc! { "i" => Value::Int64(i) }).unwrap();
    }
    col.find(&Filter::True, &FindOptions::default(), &CancelToken::new()).unwrap();
    let metrics = db.buffer_pool_metrics();
    assert!(metrics.hits > 0);
    assert!(metrics.resident > 0);
    db.close().unwrap();
}
