use doradb_kvsql::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn scan(conn: &Connection, table: u32) -> Vec<i64> {
    let mut c = conn.cursor(table, false).unwrap();
    let mut keys = vec![];
    let mut more = c.first().unwrap();
    while more {
        keys.push(c.int_key().unwrap());
        more = c.next().unwrap();
    }
    keys
}

fn insert(conn: &Connection, table: u32, key: i64) {
    let mut c = conn.cursor(table, true).unwrap();
    c.insert_int(key, b"row", 0, false).unwrap();
}

fn open_named(reg: &Registry, path: &Path) -> (Arc<DbContext>, Connection) {
    let ctx = DbContext::new();
    let conn = reg.open(Config::named(path), &ctx).unwrap();
    (ctx, conn)
}

#[test]
fn test_savepoints_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sp.db");
    let reg = Registry::new();
    let (ctx, conn) = open_named(&reg, &path);

    conn.begin_trans(true).unwrap();
    assert!(conn.is_in_trans());
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    assert_eq!(conn.savepoint_levels(), 1);
    insert(&conn, t, 1);

    ctx.set_savepoint_depth(1);
    conn.begin_stmt(1).unwrap();
    insert(&conn, t, 2);
    ctx.set_savepoint_depth(2);
    conn.begin_stmt(2).unwrap();
    insert(&conn, t, 3);
    assert_eq!(conn.savepoint_levels(), 3);
    assert_eq!(scan(&conn, t), vec![1, 2, 3]);

    conn.savepoint(SavepointOp::Rollback, 1).unwrap();
    assert_eq!(scan(&conn, t), vec![1, 2]);
    conn.savepoint(SavepointOp::Release, 0).unwrap();
    assert_eq!(conn.savepoint_levels(), 1);
    // out of range is a no-op
    conn.savepoint(SavepointOp::Rollback, 5).unwrap();
    assert_eq!(scan(&conn, t), vec![1, 2]);

    ctx.set_savepoint_depth(0);
    conn.commit().unwrap();
    assert!(!conn.is_in_read_trans());
    drop(conn);
    assert_eq!(reg.named_count(), 0);

    let (_ctx, conn) = open_named(&reg, &path);
    assert!(conn.env().is_some());
    assert_eq!(scan(&conn, t), vec![1, 2]);
    assert_eq!(conn.count(t).unwrap(), 2);
}

#[test]
fn test_rollback_discards_created_table() {
    let reg = Registry::new();
    let ctx = DbContext::new();
    let conn = reg.open(Config::in_memory(), &ctx).unwrap();
    conn.begin_trans(true).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    insert(&conn, t, 1);
    conn.rollback().unwrap();

    conn.begin_trans(true).unwrap();
    assert_eq!(scan(&conn, t), Vec::<i64>::new());
    insert(&conn, t, 7);
    conn.savepoint(SavepointOp::Rollback, -1).unwrap();
    assert_eq!(conn.trans_state(), TransState::None);
    assert_eq!(scan(&conn, t), Vec::<i64>::new());
}

#[test]
fn test_commit_with_active_statements() {
    let reg = Registry::new();
    let ctx = DbContext::new();
    let conn = reg.open(Config::in_memory(), &ctx).unwrap();
    conn.begin_trans(false).unwrap();
    assert_eq!(conn.trans_state(), TransState::Read);
    conn.begin_trans(true).unwrap();
    conn.begin_trans(false).unwrap();
    assert_eq!(conn.trans_state(), TransState::Write);
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    insert(&conn, t, 1);

    ctx.set_active_stmts(2);
    conn.commit_phase_one().unwrap();
    conn.commit().unwrap();
    assert_eq!(conn.trans_state(), TransState::Read);
    ctx.set_active_stmts(1);
    conn.commit().unwrap();
    assert_eq!(conn.trans_state(), TransState::None);
    conn.rollback().unwrap();
    assert_eq!(scan(&conn, t), vec![1]);
}

#[test]
fn test_read_only_connection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ro.db");
    let reg = Registry::new();
    let ctx = DbContext::new();
    assert!(matches!(
        reg.open(Config::named(&path).with_read_only(true), &ctx),
        Err(Error::ReadOnly)
    ));
    assert!(matches!(
        reg.open(Config::named(&path).with_create(false), &ctx),
        Err(Error::CantOpen)
    ));

    let (_ctx, writer) = open_named(&reg, &path);
    writer.begin_trans(true).unwrap();
    let t = writer.create_table(TableFlags::INTKEY).unwrap();
    insert(&writer, t, 1);
    writer.update_meta(1, 9).unwrap();
    writer.commit().unwrap();
    drop(writer);

    let conn = reg
        .open(Config::named(&path).with_read_only(true), &ctx)
        .unwrap();
    assert!(conn.is_read_only());
    assert_eq!(conn.begin_trans(true), Err(Error::ReadOnly));
    conn.begin_trans(false).unwrap();
    assert_eq!(conn.create_table(TableFlags::INTKEY), Err(Error::ReadOnly));
    assert_eq!(conn.drop_table(t), Err(Error::ReadOnly));
    assert_eq!(conn.clear_table(t), Err(Error::ReadOnly));
    assert_eq!(conn.update_meta(1, 1), Err(Error::ReadOnly));
    assert!(matches!(conn.cursor(t, true), Err(Error::ReadOnly)));
    assert_eq!(conn.get_meta(1).unwrap(), 9);
    assert_eq!(scan(&conn, t), vec![1]);
}

#[test]
fn test_schema_lock_between_connections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("schema.db");
    let reg = Registry::new();
    let (_c1, conn1) = open_named(&reg, &path);
    conn1.create_table(TableFlags::INTKEY).unwrap();
    let (_c2, conn2) = open_named(&reg, &path);

    conn1.begin_trans(false).unwrap();
    conn1.lock_table(MASTER_ROOT, true).unwrap();
    conn1.schema_locked().unwrap();
    assert_eq!(conn2.schema_locked(), Err(Error::Locked));

    conn2.begin_trans(false).unwrap();
    assert_eq!(conn2.lock_table(MASTER_ROOT, false), Err(Error::Locked));
    // other tables are not schema locked
    conn2.lock_table(3, true).unwrap();

    conn1.commit().unwrap();
    conn2.schema_locked().unwrap();
    conn2.lock_table(MASTER_ROOT, false).unwrap();
    conn2.commit().unwrap();
}

#[test]
fn test_lazy_begin_before_first_access() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lazy.db");
    let reg = Registry::new();
    let (_ctx, conn) = open_named(&reg, &path);
    conn.begin_trans(false).unwrap();
    assert!(!conn.is_connected());
    assert_eq!(conn.trans_state(), TransState::Read);
    conn.begin_trans(true).unwrap();
    assert!(!conn.is_connected());
    assert!(conn.env().is_none());

    let t = conn.create_table(TableFlags::empty()).unwrap();
    assert!(conn.is_connected());
    assert_eq!(t, 2);
    assert_eq!(conn.savepoint_levels(), 1);
    conn.commit().unwrap();
    assert!(path.exists());
}
