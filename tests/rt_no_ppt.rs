use std::fs;
use std::path::Path;

/// Modules on the worker path must not call `assert_invariant`, which
/// acquires a Mutex. They report through `invariant_rt` events instead.
#[test]
fn rt_paths_do_not_call_assert_invariant() {
    let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    for file in ["async_broker.rs", "broker.rs", "executable.rs", "memory.rs", "scheduler.rs", "sync.rs"] {
        let text = fs::read_to_string(src.join(file))
            .unwrap_or_else(|e| panic!("failed to read {}: {}", file, e));
        assert!(
            !text.contains("assert_invariant("),
            "{} must not call assert_invariant (acquires Mutex). Signal an RtEvent instead.",
            file
        );
    }
}
