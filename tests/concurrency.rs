//! Concurrent readers and a writer: version monotonicity, snapshot
//! stability under pinning, and writer serialization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tidedb::db::{Db, DbOptions};
use tidedb::{DataType, Value};

fn open_seeded(path: &std::path::Path) -> Arc<Db> {
  let db = Db::open(DbOptions::for_path(path)).expect("open");
  let mut tx = db.begin_write().expect("begin");
  let table = tx
    .add_table_with_primary_key("event", DataType::Int, "id", false)
    .expect("table");
  tx.create_object_with_pk(table, Value::Int(0)).expect("seed");
  tx.commit().expect("commit");
  db
}

#[test]
fn readers_never_observe_versions_going_backwards() {
  let dir = tempfile::tempdir().expect("tempdir");
  let db = open_seeded(&dir.path().join("monotonic.tidedb"));
  let stop = Arc::new(AtomicBool::new(false));

  let mut readers = Vec::new();
  for _ in 0..3 {
    let db = db.clone();
    let stop = stop.clone();
    readers.push(std::thread::spawn(move || {
      let mut tx = db.begin_read(None).expect("begin read");
      let mut last = tx.version();
      let mut last_size = tx
        .group()
        .table_by_name("event")
        .map(|t| t.size())
        .unwrap_or(0);
      while !stop.load(Ordering::Acquire) {
        tx.refresh().expect("refresh");
        let version = tx.version();
        assert!(version >= last, "version went backwards: {last} -> {version}");
        let size = tx
          .group()
          .table_by_name("event")
          .map(|t| t.size())
          .unwrap_or(0);
        if version == last {
          assert_eq!(size, last_size, "same version, different content");
        } else {
          assert!(size >= last_size, "later version lost rows");
        }
        last = version;
        last_size = size;
      }
    }));
  }

  for i in 1..=40 {
    let mut tx = db.begin_write().expect("begin write");
    let table = tx.group().key_of("event").expect("table");
    tx.create_object_with_pk(table, Value::Int(i)).expect("create");
    tx.commit().expect("commit");
  }
  stop.store(true, Ordering::Release);
  for reader in readers {
    reader.join().expect("reader");
  }

  let tx = db.begin_read(None).expect("read");
  assert_eq!(tx.group().table_by_name("event").expect("table").size(), 41);
}

#[test]
fn pinned_snapshots_survive_later_commits() {
  let dir = tempfile::tempdir().expect("tempdir");
  let db = open_seeded(&dir.path().join("pinned.tidedb"));

  let frozen = {
    let read = db.begin_read(None).expect("read");
    read.freeze().expect("freeze")
  };
  let frozen_version = frozen.version();

  // Enough commits to grow the file and trigger node reclamation for
  // unpinned versions.
  for i in 1..=100 {
    let mut tx = db.begin_write().expect("begin");
    let table = tx.group().key_of("event").expect("table");
    tx.create_object_with_pk(table, Value::Int(i)).expect("create");
    tx.commit().expect("commit");
  }

  assert_eq!(frozen.version(), frozen_version);
  let table = frozen.group().table_by_name("event").expect("table");
  assert_eq!(table.size(), 1, "the frozen snapshot still reads version 1 data");

  drop(frozen);
  let tx = db.begin_read(None).expect("read");
  assert_eq!(tx.group().table_by_name("event").expect("table").size(), 101);
}

#[test]
fn concurrent_writers_serialize_without_losing_commits() {
  let dir = tempfile::tempdir().expect("tempdir");
  let db = open_seeded(&dir.path().join("writers.tidedb"));

  let mut writers = Vec::new();
  for t in 0..4 {
    let db = db.clone();
    writers.push(std::thread::spawn(move || {
      for i in 0..10 {
        let mut tx = db.begin_write().expect("begin");
        let table = tx.group().key_of("event").expect("table");
        let id = 1000 + t * 100 + i;
        tx.create_object_with_pk(table, Value::Int(id)).expect("create");
        tx.commit().expect("commit");
      }
    }));
  }
  for writer in writers {
    writer.join().expect("writer");
  }

  let tx = db.begin_read(None).expect("read");
  assert_eq!(tx.group().table_by_name("event").expect("table").size(), 41);
}
