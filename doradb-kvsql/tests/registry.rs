use doradb_kv::error::Error as KvError;
use doradb_kvsql::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_shared_environment_refcount() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rc.db");
    let reg = Registry::new();
    let ctx1 = DbContext::new();
    let ctx2 = DbContext::new();

    let conn1 = reg.open(Config::named(&path), &ctx1).unwrap();
    conn1.begin_trans(true).unwrap();
    let t = conn1.create_table(TableFlags::INTKEY).unwrap();
    let mut c = conn1.cursor(t, true).unwrap();
    c.insert_int(10, b"ten", 0, false).unwrap();
    drop(c);
    conn1.commit().unwrap();

    let conn2 = reg.open(Config::named(&path), &ctx2).unwrap();
    assert!(Arc::ptr_eq(conn1.shared(), conn2.shared()));
    assert_eq!(conn2.shared().refs(), 2);
    assert_eq!(reg.named_count(), 1);
    assert!(conn2.is_connected());

    let env = conn2.env().unwrap();
    conn1.close().unwrap();
    assert_eq!(conn2.shared().refs(), 1);
    assert!(!env.is_closed());
    let mut c = conn2.cursor(t, false).unwrap();
    assert!(c.first().unwrap());
    assert_eq!(c.data().unwrap(), b"ten");
    drop(c);

    drop(conn2);
    assert!(env.is_closed());
    assert_eq!(reg.named_count(), 0);
    assert!(reg.lookup(&path).is_none());
}

#[test]
fn test_same_context_attaches_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("twice.db");
    let reg = Registry::new();
    let ctx = DbContext::new();
    let conn = reg.open(Config::named(&path), &ctx).unwrap();
    assert!(matches!(
        reg.open(Config::named(&path), &ctx),
        Err(Error::Constraint)
    ));
    assert_eq!(conn.shared().refs(), 1);

    let other = DbContext::new();
    let conn2 = reg.open(Config::named(&path), &other).unwrap();
    assert_eq!(conn2.shared().refs(), 2);
    drop(conn2);
    drop(conn);

    // released, the same context may attach again
    let conn = reg.open(Config::named(&path), &ctx).unwrap();
    assert_eq!(conn.shared().refs(), 1);
}

#[test]
fn test_private_storage_not_shared() {
    let reg = Registry::new();
    let ctx = DbContext::new();
    let a = reg.open(Config::in_memory(), &ctx).unwrap();
    let b = reg.open(Config::in_memory(), &ctx).unwrap();
    assert!(!Arc::ptr_eq(a.shared(), b.shared()));
    assert_eq!(reg.named_count(), 0);

    let ta = a.create_table(TableFlags::INTKEY).unwrap();
    let tb = b.create_table(TableFlags::INTKEY).unwrap();
    assert_eq!(ta, tb);
    let mut c = a.cursor(ta, true).unwrap();
    c.insert_int(1, b"a", 0, false).unwrap();
    drop(c);
    assert_eq!(a.count(ta).unwrap(), 1);
    assert_eq!(b.count(tb).unwrap(), 0);

    // tables of a closed connection are removed from the temporary environment
    let env = a.env().unwrap();
    let prefix = format!("temp{:05}_", a.shared().uid());
    assert!(env.list_tables().iter().any(|n| n.starts_with(&prefix)));
    drop(a);
    assert!(!env.list_tables().iter().any(|n| n.starts_with(&prefix)));
    assert!(!env.is_closed());
}

#[test]
fn test_table_open_retries_contention() {
    let reg = Registry::new();
    let ctx = DbContext::new();
    let conn = reg.open(Config::in_memory(), &ctx).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    let env = conn.env().unwrap();

    env.inject_open_faults(KvError::LockNotGranted, 3);
    let mut c = conn.cursor(t + 2, true).unwrap();
    c.insert_int(1, b"x", 0, false).unwrap();
    assert_eq!(c.state(), CursorState::Valid);
}

#[test]
fn test_table_open_gives_up_after_bound() {
    let reg = Registry::new();
    let ctx = DbContext::new();
    let config = Config::in_memory().with_busy_retry_count(2);
    let conn = reg.open(config, &ctx).unwrap();
    let t = conn.create_table(TableFlags::INTKEY).unwrap();
    let env = conn.env().unwrap();

    env.inject_open_faults(KvError::Deadlock, 3);
    let mut c = conn.cursor(t + 2, true).unwrap();
    assert_eq!(c.first(), Err(Error::Busy));
    let mut c = conn.cursor(t + 2, true).unwrap();
    assert!(!c.first().unwrap());
}

#[test]
fn test_named_storage_reopens_existing_tables() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ids.db");
    let reg = Registry::new();
    let ctx = DbContext::new();
    {
        let conn = reg.open(Config::named(&path), &ctx).unwrap();
        assert_eq!(conn.create_table(TableFlags::INTKEY).unwrap(), 3);
        assert_eq!(conn.create_table(TableFlags::empty()).unwrap(), 4);
    }
    let reg = Registry::new();
    let conn = reg.open(Config::named(&path), &ctx).unwrap();
    assert_eq!(conn.shared().last_table(), 4);
    assert_eq!(conn.create_table(TableFlags::INTKEY).unwrap(), 5);
    assert_eq!(conn.create_table(TableFlags::ZERODATA).unwrap(), 6);
}
