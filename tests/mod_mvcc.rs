use lauradb::query::Filter;
use lauradb::{CancelToken, Database, DatabaseConfig, FindOptions, UpdateDoc, Value, doc};

#[test]
fn snapshot_reads_are_repeatable_across_updates() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let col = db.create_collection("kv").unwrap();
    let cancel = CancelToken::new();

    col.insert_one(doc! { "k" => Value::String("a".into()), "v" => Value::Int64(1) }).unwrap();
    let snapshot = db.begin_snapshot();

    col.update_one(
        &Filter::eq("k", Value::String("a".into())),
        &UpdateDoc::default().set_field("v", Value::Int64(2)),
        &cancel,
    )
    .unwrap();

    // The held snapshot still sees the old version.
    let old = col
        .find_snapshot(&Filter::True, &FindOptions::default(), snapshot, &cancel)
        .unwrap();
    assert_eq!(old.len(), 1);
    assert_eq!(old[0].get("v"), Some(&Value::Int64(1)));

    // A fresh read sees the update.
    let fresh = col.find(&Filter::True, &FindOptions::default(), &cancel).unwrap();
    assert_eq!(fresh[0].get("v"), Some(&Value::Int64(2)));

    db.release_snapshot(snapshot);
    db.close().unwrap();
}

#[test]
fn deleted_documents_stay_visible_to_older_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let col = db.create_collection("kv").unwrap();
    let cancel = CancelToken::new();

    col.insert_one(doc! { "k" => Value::String("gone".into()) }).unwrap();
    let snapshot = db.begin_snapshot();
    col.delete_one(&Filter::eq("k", Value::String("gone".into())), &cancel).unwrap();

    assert_eq!(col.count(&Filter::True, &cancel).unwrap(), 0);
    let old = col
        .find_snapshot(&Filter::True, &FindOptions::default(), snapshot, &cancel)
        .unwrap();
    assert_eq!(old.len(), 0, "the heap record is gone; only version chains remain");

    db.release_snapshot(snapshot);
    db.close().unwrap();
}

#[test]
fn gc_respects_the_active_snapshot_floor() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let col = db.create_collection("kv").unwrap();
    let cancel = CancelToken::new();

    col.insert_one(doc! { "k" => Value::String("a".into()), "v" => Value::Int64(1) }).unwrap();
    let snapshot = db.begin_snapshot();
    col.update_one(
        &Filter::eq("k", Value::String("a".into())),
        &UpdateDoc::default().set_field("v", Value::Int64(2)),
        &cancel,
    )
    .unwrap();

    // GC while the snapshot is active must keep the old version.
    db.gc_now();
    let old = col
        .find_snapshot(&Filter::True, &FindOptions::default(), snapshot, &cancel)
        .unwrap();
    assert_eq!(old[0].get("v"), Some(&Value::Int64(1)));

    // After release, GC may trim; latest reads are unaffected.
    db.release_snapshot(snapshot);
    db.gc_now();
    let fresh = col.find(&Filter::True, &FindOptions::default(), &cancel).unwrap();
    assert_eq!(fresh[0].get("v"), Some(&Value::Int64(2)));
    db.close().unwrap();
}
