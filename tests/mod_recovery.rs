use lauradb::query::Filter;
use lauradb::{CancelToken, Database, DatabaseConfig, FindOptions, Value, doc};

// Dropping the database handle without close() leaves dirty pages
// unflushed; the WAL alone must bring them back.
#[test]
fn wal_replay_recovers_unflushed_writes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let col = db.create_collection("events").unwrap();
        for i in 0..8i64 {
            col.insert_one(doc! { "seq" => Value::Int64(i) }).unwrap();
        }
        // No close, no checkpoint: simulate a crash.
        drop(db);
    }

    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let col = db.collection("events").expect("catalog survived");
    let found = col.find(&Filter::True, &FindOptions::default(), &CancelToken::new()).unwrap();
    assert_eq!(found.len(), 8);
    let mut seqs: Vec<i64> = found
        .iter()
        .map(|d| match d.get("seq") {
            Some(Value::Int64(i)) => *i,
            other => panic!("unexpected seq {other:?}"),
        })
        .collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..8).collect::<Vec<_>>());
    db.close().unwrap();
}

#[test]
fn recovery_after_checkpoint_plus_more_writes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let col = db.create_collection("mixed").unwrap();
        for i in 0..5i64 {
            col.insert_one(doc! { "n" => Value::Int64(i) }).unwrap();
        }
        db.checkpoint().unwrap();
        for i in 5..10i64 {
            col.insert_one(doc! { "n" => Value::Int64(i) }).unwrap();
        }
        drop(db); // crash after the checkpoint
    }

    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let col = db.collection("mixed").unwrap();
    assert_eq!(col.count(&Filter::True, &CancelToken::new()).unwrap(), 10);
    db.close().unwrap();
}

#[test]
fn reopen_twice_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let col = db.create_collection("stable").unwrap();
        col.insert_one(doc! { "v" => Value::Int64(1) }).unwrap();
        drop(db);
    }
    for _ in 0..2 {
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let col = db.collection("stable").unwrap();
        assert_eq!(col.count(&Filter::True, &CancelToken::new()).unwrap(), 1);
        drop(db);
    }
}
