//! Instruction replication round trip: locally recorded changesets
//! applied to a second database reproduce the same object graph.

use std::sync::Arc;

use tidedb::db::{Db, DbOptions};
use tidedb::sync::applier::InstructionApplier;
use tidedb::sync::instruction::Changeset;
use tidedb::types::CollectionKind;
use tidedb::{DataType, Value};

fn sync_db() -> Arc<Db> {
  let mut options = DbOptions::in_memory();
  options.sync_history = true;
  Db::open(options).expect("open")
}

fn plain_db() -> Arc<Db> {
  Db::open(DbOptions::in_memory()).expect("open")
}

fn replicate(src: &Arc<Db>, dst: &Arc<Db>) {
  for (_version, bytes) in src.changesets_after(0) {
    let changeset = Changeset::decode(&bytes).expect("decode");
    let mut tx = dst.begin_write().expect("begin");
    InstructionApplier::new(&mut tx)
      .apply(&changeset)
      .expect("apply");
    tx.commit().expect("commit");
  }
}

#[test]
fn recorded_changesets_reproduce_the_graph() {
  let src = sync_db();
  {
    let mut tx = src.begin_write().unwrap();
    let people = tx
      .add_table_with_primary_key("person", DataType::Int, "id", false)
      .unwrap();
    let name = tx
      .add_column(people, "name", DataType::String, false, CollectionKind::Single, None)
      .unwrap();
    let tags = tx
      .add_column(people, "tags", DataType::String, false, CollectionKind::List, None)
      .unwrap();
    let scores = tx
      .add_column(people, "scores", DataType::Int, false, CollectionKind::Set, None)
      .unwrap();
    let attrs = tx
      .add_column(
        people,
        "attrs",
        DataType::String,
        false,
        CollectionKind::Dictionary,
        None,
      )
      .unwrap();

    let (ada, _) = tx.create_object_with_pk(people, Value::Int(1)).unwrap();
    tx.set_value(people, ada, name, Value::String("ada".into())).unwrap();
    tx.list_insert(people, ada, tags, 0, Value::String("fast".into())).unwrap();
    tx.list_insert(people, ada, tags, 1, Value::String("precise".into())).unwrap();
    tx.set_insert(people, ada, scores, Value::Int(10)).unwrap();
    tx.set_insert(people, ada, scores, Value::Int(20)).unwrap();
    tx.dict_insert(people, ada, attrs, "role", Value::String("engine".into()))
      .unwrap();
    tx.commit().unwrap();
  }
  {
    // A second commit with list surgery and an erase.
    let mut tx = src.begin_write().unwrap();
    let people = tx.group().key_of("person").unwrap();
    let tags = tx.group().table(people).unwrap().column_by_name("tags").unwrap().key;
    let ada = tx
      .group()
      .table(people)
      .unwrap()
      .find_by_pk(&Value::Int(1))
      .unwrap();
    tx.list_move(people, ada, tags, 0, 1).unwrap();
    tx.list_erase(people, ada, tags, 0).unwrap();
    let (bob, _) = tx.create_object_with_pk(people, Value::Int(2)).unwrap();
    tx.erase_object(people, bob).unwrap();
    tx.commit().unwrap();
  }

  let dst = plain_db();
  replicate(&src, &dst);

  let src_tx = src.begin_read(None).unwrap();
  let dst_tx = dst.begin_read(None).unwrap();
  assert_eq!(
    src_tx.group().derive_schema(),
    dst_tx.group().derive_schema()
  );

  let st = src_tx.group().table_by_name("person").unwrap();
  let dt = dst_tx.group().table_by_name("person").unwrap();
  assert_eq!(st.size(), dt.size());

  let src_obj = st.find_by_pk(&Value::Int(1)).unwrap();
  let dst_obj = dt.find_by_pk(&Value::Int(1)).unwrap();
  for col in ["name"] {
    let sc = st.column_by_name(col).unwrap().key;
    let dc = dt.column_by_name(col).unwrap().key;
    assert_eq!(
      src_tx.get_value(st.key, src_obj, sc).unwrap(),
      dst_tx.get_value(dt.key, dst_obj, dc).unwrap(),
    );
  }
  let s_tags = st.column_by_name("tags").unwrap().key;
  let d_tags = dt.column_by_name("tags").unwrap().key;
  let src_len = src_tx.list_size(st.key, src_obj, s_tags).unwrap();
  assert_eq!(src_len, dst_tx.list_size(dt.key, dst_obj, d_tags).unwrap());
  for i in 0..src_len {
    assert_eq!(
      src_tx.list_get(st.key, src_obj, s_tags, i).unwrap(),
      dst_tx.list_get(dt.key, dst_obj, d_tags, i).unwrap(),
    );
  }
}

#[test]
fn embedded_objects_replicate_through_object_value() {
  let src = sync_db();
  {
    let mut tx = src.begin_write().unwrap();
    let orders = tx
      .add_table_with_primary_key("order", DataType::Int, "id", false)
      .unwrap();
    tx.add_embedded_table("line_item").unwrap();
    let items_table = tx.group().key_of("line_item").unwrap();
    let qty = tx
      .add_column(items_table, "qty", DataType::Int, true, CollectionKind::Single, None)
      .unwrap();
    let lines = tx
      .add_column(
        orders,
        "lines",
        DataType::Link,
        false,
        CollectionKind::List,
        Some("line_item"),
      )
      .unwrap();

    let (order, _) = tx.create_object_with_pk(orders, Value::Int(1)).unwrap();
    let line = tx.create_embedded_in_list(orders, order, lines, 0).unwrap();
    tx.set_value(line.table, line.obj, qty, Value::Int(3)).unwrap();
    tx.commit().unwrap();
  }

  let dst = plain_db();
  replicate(&src, &dst);

  let tx = dst.begin_read(None).unwrap();
  let lines_table = tx.group().table_by_name("line_item").unwrap();
  assert_eq!(lines_table.size(), 1);
  let qty = lines_table.column_by_name("qty").unwrap().key;
  let line = lines_table.objects().next().unwrap();
  assert_eq!(
    tx.get_value(lines_table.key, line.key, qty).unwrap(),
    Value::Int(3)
  );
}

#[test]
fn erase_object_replication_is_idempotent() {
  let src = sync_db();
  {
    let mut tx = src.begin_write().unwrap();
    let t = tx
      .add_table_with_primary_key("doc", DataType::Int, "id", false)
      .unwrap();
    tx.create_object_with_pk(t, Value::Int(9)).unwrap();
    tx.commit().unwrap();
  }
  {
    let mut tx = src.begin_write().unwrap();
    let t = tx.group().key_of("doc").unwrap();
    let obj = tx.group().table(t).unwrap().find_by_pk(&Value::Int(9)).unwrap();
    tx.erase_object(t, obj).unwrap();
    tx.commit().unwrap();
  }

  let dst = plain_db();
  replicate(&src, &dst);
  // Applying the erase-carrying changeset twice must land in the same
  // post-state.
  let last = src.changesets_after(0).pop().unwrap().1;
  let changeset = Changeset::decode(&last).unwrap();
  let mut tx = dst.begin_write().unwrap();
  InstructionApplier::new(&mut tx).apply(&changeset).unwrap();
  tx.commit().unwrap();

  let tx = dst.begin_read(None).unwrap();
  assert_eq!(tx.group().table_by_name("doc").unwrap().size(), 0);
}
