use lauradb::index::{BuildState, IndexSpec, KeyType};
use lauradb::query::{AggregateStage, CmpOp, Filter, ScanStrategy, SortOrder};
use lauradb::{
    CancelToken, Database, DatabaseConfig, DbError, FindOptions, UpdateDoc, Value, doc,
};
use std::sync::Arc;

fn open_with(name: &str) -> (tempfile::TempDir, Arc<Database>, Arc<lauradb::Collection>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let col = db.create_collection(name).unwrap();
    (dir, db, col)
}

fn seed_users(col: &lauradb::Collection, n: i64) {
    for i in 0..n {
        col.insert_one(doc! {
            "name" => Value::String(format!("User {i}")),
            "age" => Value::Int64(20 + i),
            "city" => Value::String(if i % 2 == 0 { "Oslo" } else { "Bergen" }.to_string()),
        })
        .unwrap();
    }
}

fn index_spec(name: &str, field: &str, key_type: KeyType) -> IndexSpec {
    IndexSpec {
        name: name.to_string(),
        fields: vec![field.to_string()],
        key_type,
        unique: false,
        partial_filter: None,
        background: false,
    }
}

#[test]
fn crud_round_trip() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 10);
    let cancel = CancelToken::new();

    assert_eq!(col.count(&Filter::True, &cancel).unwrap(), 10);
    let young = col
        .find(
            &Filter::Cmp { path: "age".into(), op: CmpOp::Lt, value: Value::Int64(25) },
            &FindOptions::default(),
            &cancel,
        )
        .unwrap();
    assert_eq!(young.len(), 5);

    let modified = col
        .update_one(
            &Filter::eq("name", Value::String("User 3".into())),
            &UpdateDoc::default().set_field("age", Value::Int64(99)),
            &cancel,
        )
        .unwrap();
    assert_eq!(modified, 1);
    let user3 = col.find_one(&Filter::eq("name", Value::String("User 3".into())), &cancel).unwrap();
    assert_eq!(user3.get("age"), Some(&Value::Int64(99)));

    assert_eq!(col.delete_one(&Filter::eq("name", Value::String("User 3".into())), &cancel).unwrap(), 1);
    assert_eq!(col.count(&Filter::True, &cancel).unwrap(), 9);
    assert!(matches!(
        col.find_one(&Filter::eq("name", Value::String("User 3".into())), &cancel),
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        col.delete_one(&Filter::eq("name", Value::String("User 3".into())), &cancel),
        Err(DbError::NotFound(_))
    ));
    db.close().unwrap();
}

#[test]
fn update_and_delete_many() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 10);
    let cancel = CancelToken::new();
    let oslo = Filter::eq("city", Value::String("Oslo".into()));

    let modified = col
        .update_many(&oslo, &UpdateDoc::default().set_field("tagged", Value::Bool(true)), &cancel)
        .unwrap();
    assert_eq!(modified, 5);
    assert_eq!(col.count(&Filter::eq("tagged", Value::Bool(true)), &cancel).unwrap(), 5);

    let deleted = col.delete_many(&oslo, &cancel).unwrap();
    assert_eq!(deleted, 5);
    assert_eq!(col.count(&Filter::True, &cancel).unwrap(), 5);
    // delete_many with no matches reports zero, not an error.
    assert_eq!(col.delete_many(&oslo, &cancel).unwrap(), 0);
    db.close().unwrap();
}

#[test]
fn skip_limit_projection() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 10);
    let cancel = CancelToken::new();
    let opts = FindOptions {
        limit: Some(3),
        skip: Some(2),
        projection: Some(vec!["name".to_string()]),
    };
    let page = col.find(&Filter::True, &opts, &cancel).unwrap();
    assert_eq!(page.len(), 3);
    for doc in &page {
        assert!(doc.get("name").is_some());
        assert!(doc.get("age").is_none(), "projection should strip age");
        assert!(doc.id().is_some(), "_id is always projected");
    }
    db.close().unwrap();
}

#[test]
fn unique_index_rejects_duplicates_without_touching_the_store() {
    let (_dir, db, col) = open_with("accounts");
    let mut spec = index_spec("email_1", "email", KeyType::String);
    spec.unique = true;
    col.create_index(spec).unwrap();

    let cancel = CancelToken::new();
    col.insert_one(doc! { "email" => Value::String("a@x.io".into()) }).unwrap();
    let err = col.insert_one(doc! { "email" => Value::String("a@x.io".into()) }).unwrap_err();
    assert!(matches!(err, DbError::Duplicate(_)));
    assert_eq!(col.count(&Filter::True, &cancel).unwrap(), 1);
    db.close().unwrap();
}

#[test]
fn explain_picks_a_covering_index() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 20);
    col.create_index(index_spec("age_1", "age", KeyType::Int64)).unwrap();
    col.analyze_index("age_1", &CancelToken::new()).unwrap();

    let eq = Filter::eq("age", Value::Int64(25));
    let report = col.explain(&eq);
    assert_eq!(report.index.as_deref(), Some("age_1"));
    assert_eq!(report.strategy, ScanStrategy::IndexLookup);

    let range = Filter::Cmp { path: "age".into(), op: CmpOp::Gte, value: Value::Int64(30) };
    let report = col.explain(&range);
    assert_eq!(report.index.as_deref(), Some("age_1"));
    assert_eq!(report.strategy, ScanStrategy::RangeScan);

    let uncovered = Filter::eq("name", Value::String("User 1".into()));
    let report = col.explain(&uncovered);
    assert_eq!(report.index, None);
    assert_eq!(report.strategy, ScanStrategy::FullScan);

    // The indexed path returns the same rows a full scan would.
    let cancel = CancelToken::new();
    let via_index = col.find(&eq, &FindOptions::default(), &cancel).unwrap();
    assert_eq!(via_index.len(), 1);
    assert_eq!(via_index[0].get("name"), Some(&Value::String("User 5".into())));
    db.close().unwrap();
}

#[test]
fn compound_index_point_lookup() {
    let (_dir, db, col) = open_with("orders");
    for (country, user) in [("US", 1i64), ("US", 2), ("UK", 1), ("UK", 3)] {
        col.insert_one(doc! {
            "country" => Value::String(country.to_string()),
            "user_id" => Value::Int64(user),
        })
        .unwrap();
    }
    col.create_index(IndexSpec {
        name: "country_user".into(),
        fields: vec!["country".into(), "user_id".into()],
        key_type: KeyType::Composite,
        unique: false,
        partial_filter: None,
        background: false,
    })
    .unwrap();

    let filter = Filter::eq("country", Value::String("UK".into()))
        .and(Filter::eq("user_id", Value::Int64(3)));
    let report = col.explain(&filter);
    assert_eq!(report.index.as_deref(), Some("country_user"));
    assert_eq!(report.strategy, ScanStrategy::IndexLookup);

    let found = col.find(&filter, &FindOptions::default(), &CancelToken::new()).unwrap();
    assert_eq!(found.len(), 1);
    db.close().unwrap();
}

#[test]
fn partial_index_is_only_used_when_its_filter_is_implied() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 10);
    let adults_only = Filter::Cmp { path: "age".into(), op: CmpOp::Gte, value: Value::Int64(25) };
    col.create_index(IndexSpec {
        name: "adult_age".into(),
        fields: vec!["age".into()],
        key_type: KeyType::Int64,
        unique: false,
        partial_filter: Some(adults_only.clone()),
        background: false,
    })
    .unwrap();

    // Query that repeats the stored filter may use the index.
    let covered = adults_only.clone().and(Filter::eq("age", Value::Int64(27)));
    assert_eq!(col.explain(&covered).index.as_deref(), Some("adult_age"));

    // A bare query must not silently lose the filtered-out documents.
    let bare = Filter::eq("age", Value::Int64(21));
    assert_eq!(col.explain(&bare).strategy, ScanStrategy::FullScan);
    let found = col.find(&bare, &FindOptions::default(), &CancelToken::new()).unwrap();
    assert_eq!(found.len(), 1);
    db.close().unwrap();
}

#[test]
fn background_build_completes_and_serves_reads() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 30);
    let mut spec = index_spec("age_bg", "age", KeyType::Int64);
    spec.background = true;
    col.create_index(spec).unwrap();

    let mut state = col
        .list_indexes()
        .into_iter()
        .find(|m| m.spec.name == "age_bg")
        .unwrap()
        .build_state;
    let mut tries = 0;
    while matches!(state, BuildState::Building { .. }) {
        assert!(tries < 500, "background build did not finish");
        std::thread::sleep(std::time::Duration::from_millis(10));
        tries += 1;
        state = col
            .list_indexes()
            .into_iter()
            .find(|m| m.spec.name == "age_bg")
            .unwrap()
            .build_state;
    }
    assert_eq!(state, BuildState::Ready);

    let filter = Filter::eq("age", Value::Int64(35));
    assert_eq!(col.explain(&filter).index.as_deref(), Some("age_bg"));
    let found = col.find(&filter, &FindOptions::default(), &CancelToken::new()).unwrap();
    assert_eq!(found.len(), 1);
    db.close().unwrap();
}

#[test]
fn aggregate_pipeline_stages() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 10);
    let cancel = CancelToken::new();

    let docs = col
        .aggregate(
            &[
                AggregateStage::Match(Filter::Cmp {
                    path: "age".into(),
                    op: CmpOp::Gte,
                    value: Value::Int64(24),
                }),
                AggregateStage::Sort { field: "age".into(), order: SortOrder::Desc },
                AggregateStage::Limit(3),
                AggregateStage::Project(vec!["age".into()]),
            ],
            &cancel,
        )
        .unwrap();
    assert_eq!(docs.len(), 3);
    assert_eq!(docs[0].get("age"), Some(&Value::Int64(29)));
    assert_eq!(docs[2].get("age"), Some(&Value::Int64(27)));

    let counted = col
        .aggregate(
            &[
                AggregateStage::Match(Filter::eq("city", Value::String("Oslo".into()))),
                AggregateStage::Count("n".into()),
            ],
            &cancel,
        )
        .unwrap();
    assert_eq!(counted.len(), 1);
    assert_eq!(counted[0].get("n"), Some(&Value::Int64(5)));
    db.close().unwrap();
}

#[test]
fn insert_many_is_per_document() {
    let (_dir, db, col) = open_with("accounts");
    let mut spec = index_spec("email_1", "email", KeyType::String);
    spec.unique = true;
    col.create_index(spec).unwrap();

    let err = col
        .insert_many(vec![
            doc! { "email" => Value::String("one@x.io".into()) },
            doc! { "email" => Value::String("two@x.io".into()) },
            doc! { "email" => Value::String("one@x.io".into()) }, // duplicate
            doc! { "email" => Value::String("never@x.io".into()) },
        ])
        .unwrap_err();
    assert!(matches!(err, DbError::Duplicate(_)));
    // The first two stayed; the batch stopped at the failure.
    assert_eq!(col.count(&Filter::True, &CancelToken::new()).unwrap(), 2);
    db.close().unwrap();
}

#[test]
fn invalid_id_and_immutable_id() {
    let (_dir, db, col) = open_with("users");
    let err = col.insert_one(doc! { "_id" => Value::Int64(5) }).unwrap_err();
    assert!(matches!(err, DbError::InvalidInput(_)));

    col.insert_one(doc! { "k" => Value::Int64(1) }).unwrap();
    let err = col
        .update_one(
            &Filter::True,
            &UpdateDoc::default().set_field("_id", Value::Int64(9)),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput(_)));
    db.close().unwrap();
}

#[test]
fn drop_index_guards() {
    let (_dir, db, col) = open_with("users");
    col.create_index(index_spec("age_1", "age", KeyType::Int64)).unwrap();
    assert!(col.list_indexes().iter().any(|m| m.spec.name == "age_1"));
    col.drop_index("age_1").unwrap();
    assert!(matches!(col.drop_index("age_1"), Err(DbError::NotFound(_))));
    assert!(matches!(col.drop_index("_id_"), Err(DbError::InvalidInput(_))));
    db.close().unwrap();
}

#[test]
fn cancelled_scan_surfaces() {
    let (_dir, db, col) = open_with("users");
    seed_users(&col, 5);
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(
        col.find(&Filter::True, &FindOptions::default(), &cancel),
        Err(DbError::Cancelled)
    ));
    db.close().unwrap();
}

#[test]
fn indexes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let col = db.create_collection("users").unwrap();
        seed_users(&col, 10);
        col.create_index(index_spec("age_1", "age", KeyType::Int64)).unwrap();
        db.close().unwrap();
    }
    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let col = db.collection("users").unwrap();
    let names: Vec<String> = col.list_indexes().into_iter().map(|m| m.spec.name).collect();
    assert!(names.contains(&"_id_".to_string()));
    assert!(names.contains(&"age_1".to_string()));

    let filter = Filter::eq("age", Value::Int64(23));
    assert_eq!(col.explain(&filter).index.as_deref(), Some("age_1"));
    let found = col.find(&filter, &FindOptions::default(), &CancelToken::new()).unwrap();
    assert_eq!(found.len(), 1);
    db.close().unwrap();
}
