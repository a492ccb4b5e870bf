//! Results survive process restarts and are invalidated by code and
//! global state changes between and within runs.

mod common;

use common::{bind, call, read, run, same, unit};
use memoir_engine::{DiscardReason, FrameState, ObjRef, ObjectBody, Value};

fn histogram(values: &[i64]) -> Value {
    let mut counts: Vec<(Value, Value)> = Vec::new();
    for v in values {
        counts.push((Value::Int(*v), Value::Int(1)));
    }
    Value::Object(ObjRef::dict(counts))
}

#[test]
fn second_run_replays_without_executing() {
    let dir = tempfile::tempdir().unwrap();
    let args = [Value::Object(ObjRef::list(vec![Value::Int(3), Value::Int(5)]))];

    let first = {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("histogram", "v1")).unwrap();
        let result = call(&mut engine, f, &args, |_| histogram(&[3, 5]));
        assert_eq!(result.state, Some(FrameState::CommittedCacheable));
        result.value
    };

    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("histogram", "v1")).unwrap();
    let result = call(&mut engine, f, &args, |_| panic!("body must not run"));
    assert!(result.replayed());
    assert!(same(&result.value, &first));
    assert!(!result
        .value
        .as_object()
        .unwrap()
        .ptr_eq(first.as_object().unwrap()));
    assert_eq!(engine.stats().hits, 1);
}

#[test]
fn different_arguments_miss() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("double", "v1")).unwrap();
    call(&mut engine, f, &[Value::Int(2)], |_| Value::Int(4));
    let other = call(&mut engine, f, &[Value::Int(3)], |_| Value::Int(6));
    assert!(!other.replayed());
    assert_eq!(engine.cache().unwrap().len(), 2);
}

#[test]
fn code_change_invalidates_old_entries() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("double", "return x * 2")).unwrap();
        call(&mut engine, f, &[Value::Int(2)], |_| Value::Int(4));
    }

    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("double", "return x + x + 0")).unwrap();
    assert!(engine.cache().unwrap().is_empty());
    assert!(engine.stats().invalidations >= 1);
    let result = call(&mut engine, f, &[Value::Int(2)], |_| Value::Int(4));
    assert!(!result.replayed());
}

#[test]
fn mutating_a_read_global_invalidates_within_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("total", "sum(G)")).unwrap();
    let g = ObjRef::list(vec![Value::Int(1), Value::Int(2)]);
    bind(&mut engine, "G", Value::Object(g.clone()));

    let total = |engine: &mut memoir_engine::Engine| {
        read(engine, "G");
        Value::Int(3)
    };
    call(&mut engine, f, &[], total);
    assert_eq!(engine.cache().unwrap().len(), 1);

    engine.about_to_mutate(&g).unwrap();
    if let ObjectBody::List(items) = &mut *g.body_mut() {
        items.push(Value::Int(4));
    }
    assert!(engine.cache().unwrap().is_empty());

    let again = call(&mut engine, f, &[], |engine| {
        read(engine, "G");
        Value::Int(7)
    });
    assert!(!again.replayed());
}

#[test]
fn changed_global_between_runs_misses() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("scaled", "x * SCALE")).unwrap();
        bind(&mut engine, "SCALE", Value::Int(10));
        call(&mut engine, f, &[Value::Int(2)], |engine| {
            read(engine, "SCALE");
            Value::Int(20)
        });
    }

    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("scaled", "x * SCALE")).unwrap();
    bind(&mut engine, "SCALE", Value::Int(100));
    let result = call(&mut engine, f, &[Value::Int(2)], |engine| {
        read(engine, "SCALE");
        Value::Int(200)
    });
    assert!(!result.replayed());
}

#[test]
fn rebinding_the_same_global_value_keeps_entries() {
    let dir = tempfile::tempdir().unwrap();
    let table = || Value::Object(ObjRef::list(vec![Value::str("a"), Value::str("b")]));
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("count", "len(NAMES)")).unwrap();
        bind(&mut engine, "NAMES", table());
        call(&mut engine, f, &[], |engine| {
            read(engine, "NAMES");
            Value::Int(2)
        });
    }

    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("count", "len(NAMES)")).unwrap();
    bind(&mut engine, "NAMES", table());
    let result = call(&mut engine, f, &[], |_| panic!("body must not run"));
    assert!(result.replayed());
}

#[test]
fn deleted_global_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("limit", "LIMIT")).unwrap();
    bind(&mut engine, "LIMIT", Value::Int(5));
    call(&mut engine, f, &[], |engine| read(engine, "LIMIT"));
    assert_eq!(engine.cache().unwrap().len(), 1);

    engine.unbind_global("LIMIT").unwrap();
    engine.env_mut().remove_global("LIMIT");
    assert!(engine.cache().unwrap().is_empty());
}

#[test]
fn non_cacheable_results_never_persist() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("make_adder", "lambda")).unwrap();
        let result = call(&mut engine, f, &[Value::Int(1)], |_| Value::Callable(f));
        assert_eq!(
            result.state,
            Some(FrameState::CommittedUncacheable(
                DiscardReason::NonCacheableReturn
            ))
        );
    }

    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("make_adder", "lambda")).unwrap();
    assert!(engine.cache().unwrap().is_empty());
    let result = call(&mut engine, f, &[Value::Int(1)], |_| Value::Callable(f));
    assert!(!result.replayed());
}

#[test]
fn corrupted_payload_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("double", "v1")).unwrap();
        call(&mut engine, f, &[Value::Int(2)], |_| Value::Int(4));
    }
    let results = dir.path().join("cache").join("results");
    for entry in std::fs::read_dir(&results).unwrap() {
        std::fs::write(entry.unwrap().path(), b"garbage").unwrap();
    }

    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("double", "v1")).unwrap();
    let result = call(&mut engine, f, &[Value::Int(2)], |_| Value::Int(4));
    assert!(!result.replayed());
    assert_eq!(result.state, Some(FrameState::CommittedCacheable));
}

#[test]
fn rebinding_a_callable_alias_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("apply", "helper(x)")).unwrap();
    let double = engine.register_code(&unit("double", "x * 2")).unwrap();
    let triple = engine.register_code(&unit("triple", "x * 3")).unwrap();

    bind(&mut engine, "helper", Value::Callable(double));
    call(&mut engine, f, &[Value::Int(5)], |engine| {
        read(engine, "helper");
        Value::Int(10)
    });
    bind(&mut engine, "helper", Value::Callable(double));
    let again = call(&mut engine, f, &[Value::Int(5)], |_| panic!("body must not run"));
    assert!(again.replayed());

    bind(&mut engine, "helper", Value::Callable(triple));
    let result = call(&mut engine, f, &[Value::Int(5)], |engine| {
        read(engine, "helper");
        Value::Int(15)
    });
    assert!(!result.replayed());
    assert!(same(&result.value, &Value::Int(15)));
}

#[test]
fn callable_alias_checked_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let setup = |dir: &std::path::Path, target: &str| {
        let mut engine = run(dir);
        let f = engine.register_code(&unit("apply", "helper(x)")).unwrap();
        let double = engine.register_code(&unit("double", "x * 2")).unwrap();
        let triple = engine.register_code(&unit("triple", "x * 3")).unwrap();
        let bound = if target == "double" { double } else { triple };
        bind(&mut engine, "helper", Value::Callable(bound));
        (engine, f)
    };
    {
        let (mut engine, f) = setup(dir.path(), "double");
        call(&mut engine, f, &[Value::Int(5)], |engine| {
            read(engine, "helper");
            Value::Int(10)
        });
    }
    {
        let (mut engine, f) = setup(dir.path(), "double");
        let result = call(&mut engine, f, &[Value::Int(5)], |_| panic!("body must not run"));
        assert!(result.replayed());
    }

    let (mut engine, f) = setup(dir.path(), "triple");
    let result = call(&mut engine, f, &[Value::Int(5)], |engine| {
        read(engine, "helper");
        Value::Int(15)
    });
    assert!(!result.replayed());
}

#[test]
fn rebinding_a_class_alias_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("sides", "Shape().sides")).unwrap();
        bind(&mut engine, "Shape", Value::Type("pipeline.Square".into()));
        call(&mut engine, f, &[], |engine| {
            read(engine, "Shape");
            Value::Int(4)
        });
    }

    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("sides", "Shape().sides")).unwrap();
    bind(&mut engine, "Shape", Value::Type("pipeline.Tri".into()));
    let result = call(&mut engine, f, &[], |engine| {
        read(engine, "Shape");
        Value::Int(3)
    });
    assert!(!result.replayed());
    assert!(same(&result.value, &Value::Int(3)));
}
