//! Client reset end-to-end: discard, recovery with index translation,
//! cycle prevention, and the transfer no-op law.

use std::sync::Arc;

use tidedb::db::transaction::Transaction;
use tidedb::db::{Db, DbOptions};
use tidedb::sync::client_reset::{
  has_pending_reset, perform_client_reset_diff, transfer_group, ClientResetParams,
};
use tidedb::sync::config::ClientResyncMode;
use tidedb::types::{CollectionKind, FileIdent};
use tidedb::{DataType, TideError, Value, Version};

fn sync_db() -> Arc<Db> {
  let mut options = DbOptions::in_memory();
  options.sync_history = true;
  Db::open(options).expect("open")
}

/// One pk-keyed object holding a string list `items` seeded with
/// `values`; returns the commit's version.
fn seed_list(db: &Arc<Db>, values: &[&str]) -> Version {
  let mut tx = db.begin_write().expect("begin");
  let boxes = tx
    .add_table_with_primary_key("box", DataType::Int, "id", false)
    .expect("table");
  let items = tx
    .add_column(boxes, "items", DataType::String, false, CollectionKind::List, None)
    .expect("column");
  let (obj, _) = tx.create_object_with_pk(boxes, Value::Int(1)).expect("object");
  for (i, v) in values.iter().enumerate() {
    tx.list_insert(boxes, obj, items, i, Value::String((*v).into()))
      .expect("insert");
  }
  tx.commit().expect("commit")
}

fn list_values(tx: &Transaction) -> Vec<String> {
  let table = tx.group().table_by_name("box").expect("table");
  let obj = table.find_by_pk(&Value::Int(1)).expect("pk");
  let items = table.column_by_name("items").expect("col").key;
  let len = tx.list_size(table.key, obj, items).expect("size");
  (0..len)
    .map(|i| match tx.list_get(table.key, obj, items, i).expect("get") {
      Value::String(s) => s,
      other => panic!("unexpected list value {other}"),
    })
    .collect()
}

fn params(mode: ClientResyncMode, recover_after: Version) -> ClientResetParams {
  ClientResetParams {
    mode,
    recovery_is_allowed: true,
    new_file_ident: FileIdent { ident: 42, salt: 7 },
    recover_after_version: recover_after,
    recovery_directory: None,
    flx_subscription_hook: None,
  }
}

#[test]
fn discard_local_adopts_the_remote_state() {
  let local = sync_db();
  let remote = Db::open(DbOptions::in_memory()).unwrap();
  seed_list(&local, &["a", "b", "c"]);
  seed_list(&remote, &["a", "b", "server"]);

  // A local offline change that DiscardLocal must throw away.
  {
    let mut tx = local.begin_write().unwrap();
    let boxes = tx.group().key_of("box").unwrap();
    let items = tx.group().table(boxes).unwrap().column_by_name("items").unwrap().key;
    let obj = tx.group().table(boxes).unwrap().find_by_pk(&Value::Int(1)).unwrap();
    tx.list_insert(boxes, obj, items, 0, Value::String("offline".into()))
      .unwrap();
    tx.commit().unwrap();
  }

  let recovered =
    perform_client_reset_diff(&local, &remote, params(ClientResyncMode::DiscardLocal, 0))
      .expect("reset");
  assert!(!recovered);

  let tx = local.begin_read(None).unwrap();
  assert_eq!(list_values(&tx), vec!["a", "b", "server"]);
  assert_eq!(tx.file_ident(), FileIdent { ident: 42, salt: 7 });
  assert!(has_pending_reset(&tx).unwrap().is_some());
}

#[test]
fn recovery_translates_list_indices() {
  let local = sync_db();
  let remote = Db::open(DbOptions::in_memory()).unwrap();
  let seed_version = seed_list(&local, &["a", "b", "c"]);
  seed_list(&remote, &["a", "b", "c"]);

  // Local offline edits: insert at 0, insert at 2, erase the second
  // insert. The recovery tracker must translate each index.
  {
    let mut tx = local.begin_write().unwrap();
    let boxes = tx.group().key_of("box").unwrap();
    let items = tx.group().table(boxes).unwrap().column_by_name("items").unwrap().key;
    let obj = tx.group().table(boxes).unwrap().find_by_pk(&Value::Int(1)).unwrap();
    tx.list_insert(boxes, obj, items, 0, Value::String("x".into())).unwrap();
    tx.list_insert(boxes, obj, items, 2, Value::String("y".into())).unwrap();
    tx.list_erase(boxes, obj, items, 2).unwrap();
    tx.commit().unwrap();
  }

  let recovered = perform_client_reset_diff(
    &local,
    &remote,
    params(ClientResyncMode::Recover, seed_version),
  )
  .expect("reset");
  assert!(recovered);

  let tx = local.begin_read(None).unwrap();
  // x landed at the front; the tracked y was inserted then erased.
  assert_eq!(list_values(&tx), vec!["x", "a", "b", "c"]);
}

#[test]
fn operations_on_unknown_indices_fall_back_to_verbatim_copy() {
  let local = sync_db();
  let remote = Db::open(DbOptions::in_memory()).unwrap();
  let seed_version = seed_list(&local, &["a", "b", "c"]);
  seed_list(&remote, &["a", "b", "server-only"]);

  // Erasing a pre-reset element is untrackable: recovery must replace
  // the list wholesale from the frozen pre-reset state.
  {
    let mut tx = local.begin_write().unwrap();
    let boxes = tx.group().key_of("box").unwrap();
    let items = tx.group().table(boxes).unwrap().column_by_name("items").unwrap().key;
    let obj = tx.group().table(boxes).unwrap().find_by_pk(&Value::Int(1)).unwrap();
    tx.list_erase(boxes, obj, items, 1).unwrap();
    tx.commit().unwrap();
  }

  perform_client_reset_diff(
    &local,
    &remote,
    params(ClientResyncMode::Recover, seed_version),
  )
  .expect("reset");

  let tx = local.begin_read(None).unwrap();
  // The pre-reset local list was [a, c]; the copy preserves it.
  assert_eq!(list_values(&tx), vec!["a", "c"]);
}

#[test]
fn repeated_discard_reset_is_a_cycle() {
  let local = sync_db();
  let remote = Db::open(DbOptions::in_memory()).unwrap();
  seed_list(&local, &["a"]);
  seed_list(&remote, &["a"]);

  perform_client_reset_diff(&local, &remote, params(ClientResyncMode::DiscardLocal, 0))
    .expect("first reset");

  let err =
    perform_client_reset_diff(&local, &remote, params(ClientResyncMode::DiscardLocal, 0))
      .expect_err("second reset must abort");
  let TideError::ClientResetFailed(msg) = err else {
    panic!("expected ClientResetFailed, got {err:?}");
  };
  assert!(msg.contains("DiscardLocal"), "names the prior mode: {msg}");
  assert!(msg.contains("cycle"), "explains the abort: {msg}");
}

#[test]
fn destructive_remote_schema_fails_the_reset() {
  let local = sync_db();
  let remote = Db::open(DbOptions::in_memory()).unwrap();
  seed_list(&local, &["a"]);
  // The remote is missing the local class entirely.

  let err = perform_client_reset_diff(&local, &remote, params(ClientResyncMode::Recover, 0))
    .expect_err("reset must fail");
  let TideError::ClientResetFailed(msg) = err else {
    panic!("expected ClientResetFailed, got {err:?}");
  };
  assert!(msg.contains("box"), "names the removed class: {msg}");
}

#[test]
fn transfer_group_between_equal_groups_is_a_noop() {
  let a = sync_db();
  let b = sync_db();
  seed_list(&a, &["one", "two"]);
  seed_list(&b, &["one", "two"]);

  let src = a.begin_read(None).unwrap();
  let mut dst = b.begin_write().unwrap();
  transfer_group(&src, &mut dst).expect("transfer");
  assert!(
    dst.change_summary().is_empty(),
    "equal groups must produce no changes: {:?}",
    dst.change_summary()
  );
  dst.commit().unwrap();

  let tx = b.begin_read(None).unwrap();
  assert_eq!(list_values(&tx), vec!["one", "two"]);
}
