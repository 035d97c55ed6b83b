//! On-disk format behavior: select-bit commits, streaming-form
//! promotion, and reopen round trips.

use std::sync::Arc;

use tidedb::constants::{FOOTER_SIZE, HEADER_SIZE, STREAMING_SENTINEL};
use tidedb::core::header::{FileHeader, HeaderFlags, StreamingFooter};
use tidedb::db::{Db, DbOptions};
use tidedb::{DataType, TideError, Value};

fn open(path: &std::path::Path) -> Arc<Db> {
  Db::open(DbOptions::for_path(path)).expect("open db")
}

fn seed_person(db: &Arc<Db>, id: i64) {
  let mut tx = db.begin_write().expect("begin write");
  let table = match tx.group().key_of("person") {
    Some(key) => key,
    None => tx
      .add_table_with_primary_key("person", DataType::Int, "id", false)
      .expect("add table"),
  };
  tx.create_object_with_pk(table, Value::Int(id)).expect("create");
  tx.commit().expect("commit");
}

fn read_header(path: &std::path::Path) -> FileHeader {
  let bytes = std::fs::read(path).expect("read file");
  FileHeader::parse(&bytes[..HEADER_SIZE]).expect("parse header")
}

#[test]
fn first_commit_fills_slot_one_and_flips_select_bit() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("toggle.tidedb");

  {
    let db = open(&path);
    let fresh = read_header(&path);
    assert_eq!(fresh.selected_slot(), 0);
    assert_eq!(fresh.top_ref[0], 0);

    seed_person(&db, 1);
  }

  let header = read_header(&path);
  assert_eq!(header.selected_slot(), 1, "select bit names slot 1");
  assert_ne!(header.top_ref[1], 0, "slot 1 carries the commit's top ref");

  // Reopen observes the slot the select bit names.
  let db = open(&path);
  let tx = db.begin_read(None).expect("read");
  assert_eq!(tx.group().table_by_name("person").expect("table").size(), 1);
}

#[test]
fn commits_alternate_between_slots() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("alternate.tidedb");
  let db = open(&path);

  seed_person(&db, 1);
  let after_first = read_header(&path);
  assert_eq!(after_first.selected_slot(), 1);

  seed_person(&db, 2);
  let after_second = read_header(&path);
  assert_eq!(after_second.selected_slot(), 0);
  assert_ne!(after_second.top_ref[0], after_first.top_ref[1]);
}

#[test]
fn streaming_form_is_promoted_to_two_slot_form() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("streaming.tidedb");

  // Build a realistic file, then rewrite it into streaming form: the
  // sentinel in slot 0 and the real top ref in a footer at EOF.
  let top_ref = {
    let db = open(&path);
    seed_person(&db, 7);
    read_header(&path).top_ref[1]
  };

  let mut bytes = std::fs::read(&path).expect("read file");
  let streaming = FileHeader::new_streaming();
  bytes[..HEADER_SIZE].copy_from_slice(&streaming.serialize());
  let footer_offset = bytes.len() - FOOTER_SIZE;
  bytes[footer_offset..].copy_from_slice(&StreamingFooter::new(top_ref).serialize());
  std::fs::write(&path, &bytes).expect("rewrite file");

  // A session initiator upgrades the file before any mapping is used.
  let mut options = DbOptions::for_path(&path);
  options.is_shared = true;
  options.session_initiator = true;
  {
    let db = Db::open(options).expect("open as initiator");
    let tx = db.begin_read(None).expect("read");
    let table = tx.group().table_by_name("person").expect("table");
    assert!(table.find_by_pk(&Value::Int(7)).is_some());
  }

  let header = read_header(&path);
  assert_eq!(header.top_ref[0], STREAMING_SENTINEL);
  assert_eq!(header.top_ref[1], top_ref);
  assert!(header.flags.contains(HeaderFlags::SELECT_BIT));

  // A later non-initiator open round-trips the same top ref.
  let db = open(&path);
  let tx = db.begin_read(None).expect("read");
  assert!(tx
    .group()
    .table_by_name("person")
    .expect("table")
    .find_by_pk(&Value::Int(7))
    .is_some());
}

#[test]
fn reopen_observes_identical_schema_and_content() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("roundtrip.tidedb");

  let schema_before = {
    let db = open(&path);
    let mut tx = db.begin_write().expect("begin");
    let table = tx
      .add_table_with_primary_key("account", DataType::String, "name", false)
      .expect("table");
    tx.add_column(
      table,
      "balance",
      DataType::Double,
      false,
      tidedb::types::CollectionKind::Single,
      None,
    )
    .expect("column");
    let (obj, _) = tx
      .create_object_with_pk(table, Value::String("ada".into()))
      .expect("object");
    let balance = tx.group().table(table).unwrap().column_by_name("balance").unwrap().key;
    tx.set_value(table, obj, balance, Value::Double(12.5)).expect("set");
    tx.commit().expect("commit");

    let tx = db.begin_read(None).expect("read");
    tx.group().derive_schema()
  };

  let db = open(&path);
  let tx = db.begin_read(None).expect("read");
  assert_eq!(tx.group().derive_schema(), schema_before);
  let table = tx.group().table_by_name("account").expect("table");
  let obj = table.find_by_pk(&Value::String("ada".into())).expect("pk");
  let balance = table.column_by_name("balance").expect("col").key;
  assert_eq!(
    tx.get_value(table.key, obj, balance).expect("value"),
    Value::Double(12.5)
  );
}

#[test]
fn corrupted_mnemonic_fails_validation() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("corrupt.tidedb");
  {
    let db = open(&path);
    seed_person(&db, 1);
  }
  let mut bytes = std::fs::read(&path).expect("read");
  bytes[17] = b'?';
  std::fs::write(&path, &bytes).expect("write");

  match Db::open(DbOptions::for_path(&path)) {
    Err(TideError::InvalidDatabase { .. }) => {}
    other => panic!("expected InvalidDatabase, got {other:?}"),
  }
}
