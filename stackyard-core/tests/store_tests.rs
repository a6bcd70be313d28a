//! Status store crash-safety and layout integration tests.

use std::fs;

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use stackyard_core::{
    paths, FileStatusStore, StatusStore, StoreError, Unit, UnitStatus,
};

// ---------------------------------------------------------------------------
// 1. Layout
// ---------------------------------------------------------------------------

#[test]
fn rows_live_under_state_units_dir() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = FileStatusStore::at_home(home.path());
    let stack = Unit::new_stack("payments", Some("billing team".into()));
    store.insert(&stack).expect("insert");

    home.child(".stackyard")
        .child("units")
        .child(format!("{}.yaml", stack.id))
        .assert(predicate::path::exists());
    home.child(".stackyard")
        .child("units")
        .child(format!("{}.yaml", stack.id))
        .assert(predicate::str::contains("status: creating"));
    assert_eq!(store.dir(), paths::units_dir(home.path()));
}

// ---------------------------------------------------------------------------
// 2. Crash safety
// ---------------------------------------------------------------------------

#[test]
fn mid_write_crash_leaves_row_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = FileStatusStore::at_home(home.path());
    let stack = Unit::new_stack("payments", None);
    store.insert(&stack).expect("insert");

    let row = store.row_path(stack.id);
    let original = fs::read(&row).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    let tmp = store.dir().join(format!("{}.yaml.tmp", stack.id));
    fs::write(&tmp, b"CRASH - INCOMPLETE WRITE").expect("write crash tmp");

    assert_eq!(fs::read(&row).expect("read after crash"), original);
    let listed = store.list().expect("list ignores .tmp orphans");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, stack.id);
}

#[test]
fn status_survives_reopen() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let stack = Unit::new_stack("payments", None);
    {
        let store = FileStatusStore::at_home(home.path());
        store.insert(&stack).expect("insert");
        store.set_status(stack.id, UnitStatus::Deleting).expect("set_status");
    }
    let reopened = FileStatusStore::at_home(home.path());
    let row = reopened.get(stack.id).expect("get").expect("row");
    assert_eq!(row.status, UnitStatus::Deleting);
    assert_eq!(row.refs.namespace, stack.refs.namespace);
}

#[test]
fn list_reports_corrupt_row() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = FileStatusStore::at_home(home.path());
    store.insert(&Unit::new_stack("ok", None)).expect("insert");
    fs::write(store.dir().join("garbage.yaml"), b": : : [").expect("write");

    let err = store.list().unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("garbage.yaml"));
}
