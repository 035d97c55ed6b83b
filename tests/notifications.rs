//! Coordinator notifications: registration, delivery, skipping of
//! self-originated commits, and frozen realms.

use std::sync::{Arc, Mutex};

use tidedb::config::RealmConfig;
use tidedb::coordinator::notifier::CollectionChangeSet;
use tidedb::coordinator::{Coordinator, Realm};
use tidedb::types::CollectionKind;
use tidedb::{DataType, TideError, Value};

fn open_realm(path: &std::path::Path) -> Arc<Realm> {
  Coordinator::get_realm(RealmConfig::for_path(path), None).expect("get_realm")
}

fn create_item_table(realm: &Arc<Realm>) -> tidedb::TableKey {
  realm.begin_transaction().expect("begin");
  let key = realm
    .with_transaction(|tx| {
      let key = tx.add_table_with_primary_key("item", DataType::Int, "id", false)?;
      tx.add_column(key, "label", DataType::String, true, CollectionKind::Single, None)?;
      Ok::<_, TideError>(key)
    })
    .expect("with tx")
    .expect("schema");
  realm.commit_transaction().expect("commit");
  key
}

fn add_item(realm: &Arc<Realm>, id: i64) {
  realm.begin_transaction().expect("begin");
  realm
    .with_transaction(|tx| {
      let table = tx.group().key_of("item").expect("table");
      tx.create_object_with_pk(table, Value::Int(id)).map(|_| ())
    })
    .expect("with tx")
    .expect("create");
  realm.commit_transaction().expect("commit");
}

type Deliveries = Arc<Mutex<Vec<CollectionChangeSet>>>;

fn collector() -> (Deliveries, impl FnMut(&CollectionChangeSet) + Send) {
  let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
  let sink = deliveries.clone();
  (deliveries, move |changes: &CollectionChangeSet| {
    sink.lock().unwrap().push(changes.clone());
  })
}

#[test]
fn own_commits_are_skipped_while_foreign_commits_deliver() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("skip.tidedb");

  let realm = open_realm(&path);
  let table = create_item_table(&realm);

  let (deliveries, callback) = collector();
  let _token = realm
    .add_notification_callback(table, None, Box::new(callback))
    .expect("register");
  realm.refresh().expect("initial refresh");
  deliveries.lock().unwrap().clear();

  // This realm's own commit: the worker runs the notifier against the
  // new version in isolation and the delivery carries no changes.
  add_item(&realm, 1);
  realm.refresh().expect("refresh after own commit");
  {
    let seen = deliveries.lock().unwrap();
    assert!(
      seen.iter().all(CollectionChangeSet::is_empty),
      "self-originated changes must be suppressed: {seen:?}"
    );
  }
  deliveries.lock().unwrap().clear();

  // A commit from a different realm instance is observed in full.
  let other = open_realm(&path);
  add_item(&other, 2);
  realm.refresh().expect("refresh after foreign commit");
  {
    let seen = deliveries.lock().unwrap();
    assert!(
      seen
        .iter()
        .any(|c| c.insertions.len() == 1 && !c.schema_changed),
      "the foreign insertion must be delivered: {seen:?}"
    );
  }
}

#[test]
fn dropping_the_token_stops_deliveries() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("token.tidedb");

  let realm = open_realm(&path);
  let table = create_item_table(&realm);

  let (deliveries, callback) = collector();
  let token = realm
    .add_notification_callback(table, None, Box::new(callback))
    .expect("register");
  realm.refresh().expect("refresh");
  drop(token);
  deliveries.lock().unwrap().clear();

  let other = open_realm(&path);
  add_item(&other, 5);
  realm.refresh().expect("refresh");
  assert!(
    deliveries.lock().unwrap().is_empty(),
    "dead registrations must not fire"
  );
}

#[test]
fn notifications_deliver_in_commit_order() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("order.tidedb");

  let realm = open_realm(&path);
  let table = create_item_table(&realm);

  let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = order.clone();
  let _token = realm
    .add_notification_callback(
      table,
      None,
      Box::new(move |changes: &CollectionChangeSet| {
        for obj in &changes.insertions {
          sink.lock().unwrap().push(obj.0 as i64);
        }
      }),
    )
    .expect("register");
  realm.refresh().expect("refresh");

  let other = open_realm(&path);
  for id in 10..15 {
    add_item(&other, id);
    realm.refresh().expect("refresh");
  }

  let seen = order.lock().unwrap().clone();
  assert!(!seen.is_empty());
  // Duplicate deliveries are possible; going backwards is not.
  let mut deduped = seen.clone();
  deduped.dedup();
  assert!(
    deduped.windows(2).all(|w| w[0] < w[1]),
    "deliveries arrived out of commit order: {seen:?}"
  );
}

#[test]
fn frozen_realms_reject_writes_and_pin_their_version() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("frozen.tidedb");

  let realm = open_realm(&path);
  create_item_table(&realm);
  add_item(&realm, 1);

  let frozen = realm.coordinator().freeze(&realm).expect("freeze");
  let frozen_version = frozen.read_version().expect("version");

  add_item(&realm, 2);
  add_item(&realm, 3);

  assert_eq!(frozen.read_version().expect("version"), frozen_version);
  let count = frozen
    .read(|tx| tx.group().table_by_name("item").map(|t| t.size()))
    .expect("read")
    .expect("table");
  assert_eq!(count, 1, "a frozen realm keeps observing its snapshot");

  match frozen.begin_transaction() {
    Err(TideError::LogicError(_)) => {}
    other => panic!("expected LogicError, got {other:?}"),
  }
}

#[test]
fn mismatched_configuration_is_rejected() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("config.tidedb");

  let _realm = open_realm(&path);

  let mut other = RealmConfig::for_path(&path);
  other.encryption_key = Some([1u8; 64]);
  match Coordinator::get_realm(other, None) {
    Err(TideError::MismatchedConfig { .. }) => {}
    other => panic!("expected MismatchedConfig, got {other:?}"),
  }
}
