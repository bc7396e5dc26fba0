use doradb_kv::error::Error as KvError;
use doradb_kvsql::prelude::*;
use tempfile::TempDir;

fn open_in_memory(reg: &Registry) -> Connection {
    let ctx = DbContext::new();
    reg.open(Config::in_memory(), &ctx).unwrap()
}

fn fill(conn: &Connection, table: u32, keys: impl IntoIterator<Item = i64>) {
    let mut c = conn.cursor(table, true).unwrap();
    for k in keys {
        c.insert_int(k, format!("v{}", k).as_bytes(), 0, false).unwrap();
    }
}

#[test]
fn test_write_trips_cursor_on_same_key() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    fill(&conn, t, 1..=5);

    let mut writer = conn.cursor(t, true).unwrap();
    let mut reader = conn.cursor(t, false).unwrap();
    let mut bystander = conn.cursor(t, false).unwrap();
    assert_eq!(reader.moveto_int(3).unwrap(), 0);
    assert_eq!(bystander.moveto_int(5).unwrap(), 0);

    assert_eq!(writer.moveto_int(3).unwrap(), 0);
    writer.insert_int(3, b"new", 0, false).unwrap();
    assert_eq!(reader.state(), CursorState::RequireSeek);
    assert_eq!(bystander.state(), CursorState::Valid);

    // reseek picks up the new row
    assert_eq!(reader.data().unwrap(), b"new");
    assert_eq!(reader.state(), CursorState::Valid);
    assert!(reader.next().unwrap());
    assert_eq!(reader.int_key().unwrap(), 4);

    // delete under the reader, next continues after the gone row
    assert_eq!(writer.moveto_int(4).unwrap(), 0);
    writer.delete().unwrap();
    assert_eq!(reader.state(), CursorState::RequireSeek);
    assert!(writer.eof());
    assert!(!writer.next().unwrap());
    assert!(reader.next().unwrap());
    assert_eq!(reader.int_key().unwrap(), 5);
    assert!(!reader.next().unwrap());
    assert!(reader.eof());
    conn.commit().unwrap();
}

#[test]
fn test_moveto_reports_neighbour() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    let mut c = conn.cursor(t, true).unwrap();
    assert!(c.moveto_int(7).unwrap() < 0);
    assert!(c.eof());
    drop(c);

    fill(&conn, t, [-10, 0, 10]);
    let mut c = conn.cursor(t, false).unwrap();
    assert_eq!(c.moveto_int(0).unwrap(), 0);
    assert!(c.moveto_int(5).unwrap() > 0);
    assert_eq!(c.int_key().unwrap(), 10);
    assert!(c.moveto_int(20).unwrap() < 0);
    assert_eq!(c.int_key().unwrap(), 10);
    assert!(c.moveto_int(-20).unwrap() > 0);
    assert_eq!(c.int_key().unwrap(), -10);
    assert!(c.last().unwrap());
    assert!(c.prev().unwrap());
    assert_eq!(c.int_key().unwrap(), 0);
    assert_eq!(c.data().unwrap(), b"v0");
}

#[test]
fn test_general_keys_and_zero_padding() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::ZERODATA).unwrap();
    assert_eq!(t % 2, 0);
    let mut c = conn.cursor(t, true).unwrap();
    c.insert(b"banana", b"", 0, false).unwrap();
    c.insert(b"apple", b"x", 3, false).unwrap();
    assert_eq!(c.data().unwrap(), b"x\0\0\0");
    assert_eq!(c.data_size().unwrap(), 4);
    assert_eq!(c.key_size().unwrap(), 5);
    assert!(c.moveto(b"b").unwrap() > 0);
    assert_eq!(c.key().unwrap(), b"banana");
    assert_eq!(c.moveto(b"apple").unwrap(), 0);
    c.put_data(1, b"yz").unwrap();
    assert_eq!(c.data().unwrap(), b"xyz\0");
    c.put_data(5, b"!").unwrap();
    assert_eq!(c.data().unwrap(), b"xyz\0\0!");
}

#[test]
fn test_cursor_aborted_after_rollback() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    let mut c = conn.cursor(t, true).unwrap();
    c.insert_int(1, b"a", 0, false).unwrap();
    conn.rollback().unwrap();
    assert!(!conn.is_in_read_trans());
    assert_eq!(c.next(), Err(Error::Abort));
    assert_eq!(c.key(), Err(Error::Abort));
    assert_eq!(c.int_key(), Err(Error::Abort));
    assert_eq!(c.data(), Err(Error::Abort));
    assert_eq!(c.key_size(), Err(Error::Abort));
    assert_eq!(c.data_size(), Err(Error::Abort));
    assert_eq!(c.first(), Err(Error::Abort));
    assert_eq!(c.insert_int(2, b"b", 0, false), Err(Error::Abort));
}

#[test]
fn test_accessor_on_unpositioned_cursor() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    fill(&conn, t, [1]);
    let mut c = conn.cursor(t, false).unwrap();
    assert_eq!(c.key(), Err(Error::Abort));
    assert!(c.first().unwrap());
    assert_eq!(c.int_key().unwrap(), 1);
    assert!(!c.next().unwrap());
    assert_eq!(c.data(), Err(Error::Abort));
}

#[test]
fn test_write_cursor_follows_recreated_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("recreate.db");
    let reg = Registry::new();
    let ctx = DbContext::new();
    let config = Config::named(&path).with_truncate_mode(TruncateMode::RenameRecreate);
    let conn = reg.open(config, &ctx).unwrap();
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    fill(&conn, t, [1]);

    let mut w = conn.cursor(t, true).unwrap();
    assert_eq!(conn.clear_table(t).unwrap(), 1);
    w.insert_int(2, b"v2", 0, false).unwrap();
    assert_eq!(conn.count(t).unwrap(), 1);
    assert_eq!(w.moveto_int(2).unwrap(), 0);
    w.delete().unwrap();
    assert_eq!(conn.count(t).unwrap(), 0);
    drop(w);
    conn.commit().unwrap();
    assert!(!conn.env().unwrap().table_exists("table00003-old"));
}

#[test]
fn test_delete_after_reseek_onto_neighbour() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    fill(&conn, t, 1..=3);

    let mut w = conn.cursor(t, true).unwrap();
    let mut other = conn.cursor(t, true).unwrap();
    assert_eq!(w.moveto_int(2).unwrap(), 0);
    assert_eq!(other.moveto_int(2).unwrap(), 0);
    other.delete().unwrap();
    assert_eq!(w.state(), CursorState::RequireSeek);

    // the reseek lands on the successor, delete removes what key reports
    assert_eq!(w.int_key().unwrap(), 3);
    w.delete().unwrap();
    drop(w);
    drop(other);
    assert_eq!(conn.count(t).unwrap(), 1);
    let mut c = conn.cursor(t, false).unwrap();
    assert!(c.first().unwrap());
    assert_eq!(c.int_key().unwrap(), 1);
    assert!(!c.next().unwrap());
}

#[test]
fn test_fault_is_sticky() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    fill(&conn, t, 1..=3);

    let env = conn.env().unwrap();
    env.inject_open_faults(KvError::Io, 1);
    let mut c = conn.cursor(t + 2, true).unwrap();
    assert_eq!(c.state(), CursorState::Fault);
    assert_eq!(c.first(), Err(Error::IoErr));
    assert_eq!(c.first(), Err(Error::IoErr));
    assert_eq!(c.insert_int(1, b"", 0, false), Err(Error::IoErr));

    let mut ok = conn.cursor(t, false).unwrap();
    assert!(ok.first().unwrap());
    conn.trip_all_cursors(Error::Corrupt);
    assert_eq!(ok.next(), Err(Error::Corrupt));
    assert_eq!(ok.key(), Err(Error::Corrupt));
}

#[test]
fn test_cursor_on_missing_storage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.db");
    let reg = Registry::new();
    let ctx = DbContext::new();
    let conn = reg.open(Config::named(&path), &ctx).unwrap();
    assert!(conn.env().is_none());
    assert!(matches!(conn.cursor(3, false), Err(Error::Empty)));

    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    assert!(conn.env().is_some());
    let mut c = conn.cursor(t + 4, false).unwrap();
    assert_eq!(c.first(), Err(Error::Empty));

    let mut r = conn.cursor(t, false).unwrap();
    assert_eq!(r.insert_int(1, b"", 0, false), Err(Error::ReadOnly));
    assert_eq!(r.delete(), Err(Error::ReadOnly));
}

#[test]
fn test_drop_table_with_foreign_cursor() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let reg = Registry::new();
    let ctx1 = DbContext::new();
    let ctx2 = DbContext::new();
    let conn1 = reg.open(Config::named(&path), &ctx1).unwrap();
    let t = conn1.create_table(TableFlags::INTKEY).unwrap();
    fill(&conn1, t, 1..=2);

    let conn2 = reg.open(Config::named(&path), &ctx2).unwrap();
    let mut c = conn2.cursor(t, false).unwrap();
    assert!(c.first().unwrap());
    assert_eq!(conn1.drop_table(t), Err(Error::Locked));
    assert!(c.next().unwrap());
    assert_eq!(c.int_key().unwrap(), 2);
    drop(c);
    conn1.drop_table(t).unwrap();
}

#[test]
fn test_cached_rowid_shared_by_table() {
    let reg = Registry::new();
    let conn = open_in_memory(&reg);
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    let a = conn.cursor(t, true).unwrap();
    let b = conn.cursor(t, false).unwrap();
    a.set_cached_rowid(99);
    assert_eq!(b.cached_rowid(), 99);
    assert_eq!(a.table(), t);
    assert!(a.is_write() && !b.is_write());
    b.close();
}
