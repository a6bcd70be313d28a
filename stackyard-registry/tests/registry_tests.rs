//! Registry concurrency, corruption and validation integration tests.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::rstest;
use serde_json::Value;
use stackyard_core::{LogicalId, UnitId};
use stackyard_registry::{GraphRegistry, RegistryError, RegistryLock, Validation};
use tempfile::TempDir;

fn registry(dir: &TempDir) -> GraphRegistry {
    GraphRegistry::new(dir.path().join("graphs.json"))
        .with_lock_timeouts(Duration::from_secs(30), Duration::from_secs(10))
}

fn assert_registry_shape(raw: &str) {
    let value: Value = serde_json::from_str(raw)
        .unwrap_or_else(|e| panic!("torn or invalid registry observed ({e}): {raw:?}"));
    let graphs = value
        .get("graphs")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("registry without graphs object: {raw}"));
    assert!(graphs.values().all(Value::is_string), "non-string entry: {raw}");
}

// ---------------------------------------------------------------------------
// 1. Concurrent writers never expose a torn document
// ---------------------------------------------------------------------------

#[test]
fn concurrent_writers_never_expose_torn_document() {
    let dir = TempDir::new().expect("tempdir");
    let reg = registry(&dir);
    reg.initialize().expect("initialize");

    let stack = UnitId::new();
    let agents: Vec<UnitId> = (0..6).map(|_| UnitId::new()).collect();
    let done = Arc::new(AtomicBool::new(false));
    let samples = Arc::new(AtomicUsize::new(0));

    let reader = {
        let path = reg.path().to_path_buf();
        let done = done.clone();
        let samples = samples.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let raw = fs::read_to_string(&path).expect("registry must always exist");
                assert_registry_shape(&raw);
                samples.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let writers: Vec<_> = agents
        .iter()
        .enumerate()
        .map(|(n, agent)| {
            let reg = reg.clone();
            let id = LogicalId::for_agent(stack, *agent);
            // Neighbouring writers share a key so upserts and removes overlap.
            let shared = LogicalId::for_agent(stack, agents[(n + 1) % agents.len()]);
            thread::spawn(move || {
                for round in 0..15 {
                    let path = format!("./graphs/{stack}/agents/{round}/graph.py:graph");
                    reg.upsert(&id, &path).expect("upsert");
                    reg.upsert(&shared, &path).expect("upsert shared");
                    if round % 3 == 0 {
                        reg.remove(&shared).expect("remove shared");
                    }
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().expect("writer thread");
    }
    done.store(true, Ordering::Release);
    reader.join().expect("reader thread");

    let raw = fs::read_to_string(reg.path()).expect("final read");
    assert_registry_shape(&raw);
    assert!(samples.load(Ordering::Relaxed) > 0, "reader must have sampled");

    // Every writer's final round upserts both of its keys without removing.
    let graphs = reg.read_consistent().expect("read");
    assert_eq!(graphs.len(), agents.len());
    for agent in &agents {
        let key = LogicalId::for_agent(stack, *agent);
        assert!(graphs.contains_key(key.as_str()), "missing {key}");
    }
    assert!(reg.validate().is_valid());
}

// ---------------------------------------------------------------------------
// 2. Lock timeout is distinct from corruption
// ---------------------------------------------------------------------------

#[test]
fn lock_timeout_leaves_file_unchanged() {
    let dir = TempDir::new().expect("tempdir");
    let reg = GraphRegistry::new(dir.path().join("graphs.json"))
        .with_lock_timeouts(Duration::from_millis(150), Duration::from_millis(50));
    reg.upsert(&LogicalId::from("s__a"), "p1").expect("seed");
    let before = fs::read(reg.path()).expect("before");

    let _held = RegistryLock::acquire(reg.lock_path(), Duration::from_secs(1)).expect("hold");
    let err = reg.upsert(&LogicalId::from("s__b"), "p2").unwrap_err();
    assert!(matches!(err, RegistryError::LockTimeout { .. }), "got: {err}");
    assert!(err.is_retryable());

    let err = reg.read_consistent().unwrap_err();
    assert!(matches!(err, RegistryError::LockTimeout { .. }), "got: {err}");

    assert_eq!(fs::read(reg.path()).expect("after"), before);
    // Unlocked reads are still served.
    assert_eq!(reg.read().expect("read").len(), 1);
}

// ---------------------------------------------------------------------------
// 3. Corruption
// ---------------------------------------------------------------------------

#[rstest]
#[case::truncated(r#"{"graphs": {"s__a": "p1""#)]
#[case::not_an_object("[1, 2, 3]")]
#[case::graphs_not_object(r#"{"graphs": ["s__a"]}"#)]
#[case::entry_not_string(r#"{"graphs": {"s__a": 42}}"#)]
fn corrupt_file_is_reported_and_never_rewritten(#[case] contents: &str) {
    let dir = TempDir::new().expect("tempdir");
    let reg = registry(&dir);
    fs::write(reg.path(), contents).expect("write corrupt");

    let err = reg.read().unwrap_err();
    assert!(matches!(err, RegistryError::Corrupt { .. }), "got: {err}");
    assert!(!err.is_retryable());

    let err = reg.upsert(&LogicalId::from("s__b"), "p2").unwrap_err();
    assert!(matches!(err, RegistryError::Corrupt { .. }), "got: {err}");
    let err = reg.remove(&LogicalId::from("s__a")).unwrap_err();
    assert!(matches!(err, RegistryError::Corrupt { .. }), "got: {err}");

    assert_eq!(fs::read_to_string(reg.path()).expect("raw"), contents);
    assert!(!reg.validate().is_valid());
}

// ---------------------------------------------------------------------------
// 4. Validation reasons
// ---------------------------------------------------------------------------

#[rstest]
#[case(None, "file does not exist")]
#[case(Some("{not json"), "invalid JSON")]
#[case(Some("\"text\""), "not a JSON object")]
#[case(Some("{}"), "missing 'graphs' key")]
#[case(Some(r#"{"graphs": 3}"#), "'graphs' is not an object")]
#[case(Some(r#"{"graphs": {"k": null}}"#), "graph entry 'k' is not a string")]
fn validate_explains_structural_problems(#[case] contents: Option<&str>, #[case] reason: &str) {
    let dir = TempDir::new().expect("tempdir");
    let reg = registry(&dir);
    if let Some(contents) = contents {
        fs::write(reg.path(), contents).expect("write");
    }
    let (ok, message) = reg.validate().into_parts();
    assert!(!ok);
    assert!(message.contains(reason), "expected '{reason}' in '{message}'");
}

#[test]
fn validate_accepts_written_registry() {
    let dir = TempDir::new().expect("tempdir");
    let reg = registry(&dir);
    reg.upsert(&LogicalId::from("s__a"), "p1").expect("upsert");
    assert_eq!(reg.validate(), Validation::Valid);
    assert_eq!(reg.validate().into_parts(), (true, String::new()));
}

#[test]
fn object_without_graphs_reads_empty_but_fails_validation() {
    let dir = TempDir::new().expect("tempdir");
    let reg = registry(&dir);
    fs::write(reg.path(), r#"{"http": {"port": 8001}}"#).expect("write");
    assert!(reg.read().expect("read").is_empty());
    assert!(!reg.validate().is_valid());

    reg.upsert(&LogicalId::from("s__a"), "p1").expect("upsert");
    assert!(reg.validate().is_valid(), "first mutation adds the graphs key");
}
