//! Dependencies recorded by nested calls, files and callee code flow into
//! every enclosing cached result.

mod common;

use common::{bind, call, read, run, unit};
use memoir_engine::{DiscardReason, FileMode, FileRef, FrameState, TaintReason, Value};

#[test]
fn inner_reads_invalidate_outer_results() {
    let dir = tempfile::tempdir().unwrap();
    let body = |engine: &mut memoir_engine::Engine, inner| {
        call(engine, inner, &[], |engine| read(engine, "RATE")).value
    };
    {
        let mut engine = run(dir.path());
        let outer = engine.register_code(&unit("report", "report()")).unwrap();
        let inner = engine.register_code(&unit("rate", "RATE")).unwrap();
        bind(&mut engine, "RATE", Value::Float(0.5));
        call(&mut engine, outer, &[], |engine| body(engine, inner));
        let entries = engine.cache().unwrap().entries();
        let outer_entry = entries
            .iter()
            .find(|(_, e)| e.key.callable == "pipeline.report")
            .unwrap();
        assert!(outer_entry.1.snapshot.globals.contains_key("RATE"));
        assert!(outer_entry.1.snapshot.code.contains_key("pipeline.rate"));
    }
    {
        let mut engine = run(dir.path());
        let outer = engine.register_code(&unit("report", "report()")).unwrap();
        engine.register_code(&unit("rate", "RATE")).unwrap();
        bind(&mut engine, "RATE", Value::Float(0.5));
        let result = call(&mut engine, outer, &[], |_| panic!("body must not run"));
        assert!(result.replayed());
    }
    let mut engine = run(dir.path());
    let outer = engine.register_code(&unit("report", "report()")).unwrap();
    let inner = engine.register_code(&unit("rate", "RATE")).unwrap();
    bind(&mut engine, "RATE", Value::Float(0.75));
    let result = call(&mut engine, outer, &[], |engine| body(engine, inner));
    assert!(!result.replayed());
}

#[test]
fn replayed_inner_call_still_contributes_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = run(dir.path());
    let outer = engine.register_code(&unit("report", "report()")).unwrap();
    let inner = engine.register_code(&unit("rate", "RATE")).unwrap();
    bind(&mut engine, "RATE", Value::Int(3));

    call(&mut engine, inner, &[], |engine| read(engine, "RATE"));
    call(&mut engine, outer, &[], |engine| {
        let nested = call(engine, inner, &[], |_| panic!("inner must replay"));
        assert!(nested.replayed());
        nested.value
    });

    let entries = engine.cache().unwrap().entries();
    let (_, outer_entry) = entries
        .iter()
        .find(|(_, e)| e.key.callable == "pipeline.report")
        .unwrap();
    assert!(outer_entry.snapshot.globals.contains_key("RATE"));
}

#[test]
fn callee_code_change_invalidates_callers() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = run(dir.path());
        let outer = engine.register_code(&unit("report", "report()")).unwrap();
        let inner = engine.register_code(&unit("fmt", "v1")).unwrap();
        call(&mut engine, outer, &[Value::Int(1)], |engine| {
            call(engine, inner, &[Value::Int(1)], |_| Value::str("1")).value
        });
        assert_eq!(engine.cache().unwrap().len(), 2);
    }

    let mut engine = run(dir.path());
    engine.register_code(&unit("report", "report()")).unwrap();
    engine.register_code(&unit("fmt", "v2")).unwrap();
    assert!(engine.cache().unwrap().is_empty());
}

#[test]
fn invocation_graph_persists() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = run(dir.path());
        let outer = engine.register_code(&unit("report", "report()")).unwrap();
        let inner = engine.register_code(&unit("fmt", "v1")).unwrap();
        call(&mut engine, outer, &[], |engine| {
            call(engine, inner, &[], |_| Value::None).value
        });
    }
    let engine = run(dir.path());
    assert!(engine
        .registry()
        .transitive_callees("pipeline.report")
        .contains("pipeline.fmt"));
    assert!(engine.cache().unwrap().code_dependencies()["pipeline.report"].contains("pipeline.fmt"));
}

#[test]
fn file_contents_are_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.csv");
    std::fs::write(&input, "1,2,3\n").unwrap();
    let handle = FileRef {
        handle: 4,
        path: input.clone(),
        mode: FileMode::Read,
    };
    let load = |engine: &mut memoir_engine::Engine| {
        engine.file_opened(&handle);
        engine.file_read(handle.handle);
        engine.file_closed(handle.handle);
        Value::Int(6)
    };

    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("load", "sum(csv)")).unwrap();
        let result = call(&mut engine, f, &[], load);
        assert_eq!(result.state, Some(FrameState::CommittedCacheable));
    }
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("load", "sum(csv)")).unwrap();
        assert!(call(&mut engine, f, &[], load).replayed());
    }
    std::fs::write(&input, "1,2,3,4\n").unwrap();
    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("load", "sum(csv)")).unwrap();
    assert!(!call(&mut engine, f, &[], load).replayed());
}

#[test]
fn writing_a_read_file_invalidates_and_taints() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.txt");
    std::fs::write(&path, "a").unwrap();
    let reader = FileRef {
        handle: 1,
        path: path.clone(),
        mode: FileMode::Read,
    };
    let writer = FileRef {
        handle: 2,
        path: path.clone(),
        mode: FileMode::Append,
    };

    let mut engine = run(dir.path());
    let read_state = engine.register_code(&unit("read_state", "r")).unwrap();
    let write_state = engine.register_code(&unit("write_state", "w")).unwrap();
    call(&mut engine, read_state, &[], |engine| {
        engine.file_opened(&reader);
        engine.file_read(reader.handle);
        Value::str("a")
    });
    assert_eq!(engine.cache().unwrap().len(), 1);

    let result = call(&mut engine, write_state, &[], |engine| {
        engine.file_opened(&writer);
        engine.file_about_to_write(writer.handle);
        Value::None
    });
    assert_eq!(
        result.state,
        Some(FrameState::CommittedUncacheable(DiscardReason::Tainted(
            TaintReason::FileWrite(path)
        )))
    );
    assert!(engine.cache().unwrap().is_empty());
}

#[test]
fn namespace_attribute_reads_are_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let module = Value::Module("settings".to_string());
    {
        let mut engine = run(dir.path());
        let f = engine.register_code(&unit("threshold", "settings.LIMIT")).unwrap();
        engine.env_mut().set_attribute("settings", "LIMIT", Value::Int(10));
        call(&mut engine, f, &[], |engine| {
            engine
                .read_attribute(&module, "LIMIT", &Value::Int(10))
                .unwrap();
            Value::Int(10)
        });
    }
    let mut engine = run(dir.path());
    let f = engine.register_code(&unit("threshold", "settings.LIMIT")).unwrap();
    engine.env_mut().set_attribute("settings", "LIMIT", Value::Int(12));
    engine
        .bind_attribute("settings", "LIMIT", &Value::Int(12))
        .unwrap();
    assert!(engine.cache().unwrap().is_empty());
    let result = call(&mut engine, f, &[], |_| Value::Int(12));
    assert!(!result.replayed());
}
