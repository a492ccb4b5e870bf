//! A miniature host that drives the engine the way an evaluation loop
//! would, across several simulated program runs sharing one cache.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use memoir_config::MemoConfig;
use memoir_engine::{
    CodeId, CodeUnit, Engine, Environment, FrameEntry, FrameState, SimpleEnvironment, StoredValue,
    Value,
};

/// Outcome of one simulated call.
pub struct Call {
    pub value: Value,
    pub state: Option<FrameState>,
}

impl Call {
    pub fn replayed(&self) -> bool {
        self.state == Some(FrameState::ReplayedFromCache)
    }
}

pub fn config(dir: &Path) -> MemoConfig {
    let mut config = MemoConfig::default();
    config.cache.dir = dir.join("cache");
    config
}

/// Starts a new simulated run over the cache in `dir`.
pub fn run(dir: &Path) -> Engine {
    Engine::new(&config(dir), SimpleEnvironment::new())
}

pub fn unit(qualname: &str, code: &str) -> CodeUnit {
    CodeUnit {
        module: "pipeline".to_string(),
        qualname: qualname.to_string(),
        filename: PathBuf::from("pipeline.src"),
        code: code.as_bytes().to_vec(),
        is_generator: false,
    }
}

/// Calls `code`, running `body` only if the engine does not replay.
pub fn call(
    engine: &mut Engine,
    code: CodeId,
    args: &[Value],
    body: impl FnOnce(&mut Engine) -> Value,
) -> Call {
    let entry = engine.enter_frame(code, args).unwrap();
    let entered = entry.state();
    match entry {
        FrameEntry::Replay(value) => Call {
            value,
            state: Some(entered),
        },
        FrameEntry::Execute { .. } => {
            assert_eq!(entered, FrameState::Accumulating);
            let value = body(engine);
            let state = engine.exit_frame(Some(&value)).unwrap();
            Call {
                value,
                state: Some(state),
            }
        }
    }
}

/// Binds a global in both the host environment and the engine.
pub fn bind(engine: &mut Engine, name: &str, value: Value) {
    engine.bind_global(name, &value).unwrap();
    engine.env_mut().set_global(name, value);
}

/// Reads a global the way the host would, reporting the read.
pub fn read(engine: &mut Engine, name: &str) -> Value {
    let value = engine.env().global(name).unwrap();
    engine.read_global(name, &value).unwrap();
    value
}

pub fn same(a: &Value, b: &Value) -> bool {
    StoredValue::from_value(a).unwrap() == StoredValue::from_value(b).unwrap()
}
