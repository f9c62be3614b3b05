#![allow(dead_code)]

use async_trait::async_trait;
use modhost::config::GlobalConfig;
use modhost::{
    Module, ModuleCatalog, ModuleContext, ModuleError, ModuleRegistry, ModuleSpec, RuntimeConfig,
    Tier, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RECORDING: &str = "test.Recording";
pub const PANICKING: &str = "test.Panicking";

/// Ordered record of everything the test modules did
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Module names of entries with the given prefix, in order
    pub fn names(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{}:", kind);
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, kind: &str, module: &str) -> usize {
        self.names(kind).iter().filter(|n| n.as_str() == module).count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Test module driven by its options:
/// `fail_activate`, `fail_deactivate` (bool), `delay_ms` (int, activation delay),
/// `deactivate_delay_ms` (int)
pub struct RecordingModule {
    name: String,
    journal: Journal,
    connectors: Vec<String>,
    fail_activate: bool,
    fail_deactivate: bool,
    delay: Duration,
    deactivate_delay: Duration,
    counter: Mutex<i64>,
}

#[async_trait]
impl Module for RecordingModule {
    async fn on_activate(&self) -> Result<(), ModuleError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.journal.record(format!("activate:{}", self.name));
        if self.fail_activate {
            return Err(ModuleError::InitializationError(format!(
                "{} refused to start",
                self.name
            )));
        }
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<(), ModuleError> {
        if !self.deactivate_delay.is_zero() {
            tokio::time::sleep(self.deactivate_delay).await;
        }
        self.journal.record(format!("deactivate:{}", self.name));
        if self.fail_deactivate {
            return Err(ModuleError::OperationError(format!(
                "{} cleanup failed",
                self.name
            )));
        }
        Ok(())
    }

    fn capabilities(&self) -> Vec<String> {
        ["append", "connected", "echo", "fail", "increment", "sleep"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn invoke(&self, method: &str, args: &mut [Value]) -> Result<Value, ModuleError> {
        match method {
            "echo" => Ok(args.first().cloned().unwrap_or_default()),
            "append" => {
                let item = args.get(1).cloned().unwrap_or_default();
                let list = args
                    .first_mut()
                    .and_then(Value::as_list_mut)
                    .ok_or_else(|| ModuleError::InvalidArgument("expected a list".into()))?;
                list.push(item);
                Ok(Value::List(list.clone()))
            }
            "increment" => {
                let mut counter = self.counter.lock().unwrap();
                *counter += 1;
                Ok(Value::Int(*counter))
            }
            "sleep" => {
                let ms = args.first().and_then(Value::as_i64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok(Value::Null)
            }
            "connected" => Ok(Value::List(
                self.connectors.iter().map(|c| Value::from(c.as_str())).collect(),
            )),
            "fail" => Err(ModuleError::OperationError("requested failure".into())),
            other => Err(ModuleError::UnknownMethod(other.to_string())),
        }
    }
}

/// Catalog with the recording class and a class whose factory panics
pub fn catalog(journal: &Journal) -> ModuleCatalog {
    let recording = journal.clone();
    ModuleCatalog::new()
        .with_fn(RECORDING, move |ctx: ModuleContext| {
            recording.record(format!("construct:{}", ctx.name));
            let mut connectors: Vec<String> = ctx.connectors.keys().cloned().collect();
            connectors.sort();
            let flag = |key: &str| ctx.option(key).and_then(Value::as_bool).unwrap_or(false);
            let millis = |key: &str| {
                let ms = ctx.option(key).and_then(Value::as_i64).unwrap_or(0);
                Duration::from_millis(ms as u64)
            };
            Ok(Arc::new(RecordingModule {
                name: ctx.name.clone(),
                journal: recording.clone(),
                connectors,
                fail_activate: flag("fail_activate"),
                fail_deactivate: flag("fail_deactivate"),
                delay: millis("delay_ms"),
                deactivate_delay: millis("deactivate_delay_ms"),
                counter: Mutex::new(0),
            }) as Arc<dyn Module>)
        })
        .with_fn(PANICKING, |ctx: ModuleContext| -> Result<Arc<dyn Module>, ModuleError> {
            panic!("factory for {} exploded", ctx.name)
        })
}

pub fn spec(name: &str, tier: Tier) -> ModuleSpec {
    ModuleSpec::new(name, tier, RECORDING)
}

pub fn config(specs: Vec<ModuleSpec>) -> Arc<RuntimeConfig> {
    Arc::new(RuntimeConfig::new(GlobalConfig::default(), specs).unwrap())
}

pub fn registry(journal: &Journal, specs: Vec<ModuleSpec>) -> ModuleRegistry {
    ModuleRegistry::new(config(specs), catalog(journal)).unwrap()
}

/// m -> d1 -> d2
pub fn chain() -> Vec<ModuleSpec> {
    vec![
        spec("m", Tier::Gui).connect("logic", "d1"),
        spec("d1", Tier::Logic).connect("device", "d2"),
        spec("d2", Tier::Hardware),
    ]
}

pub fn states(pairs: &[(&str, modhost::ModuleState)]) -> HashMap<String, modhost::ModuleState> {
    pairs.iter().map(|(n, s)| (n.to_string(), *s)).collect()
}

/// Current state of every module, keyed by name
pub async fn current_states(registry: &ModuleRegistry) -> HashMap<String, modhost::ModuleState> {
    registry
        .snapshot()
        .await
        .into_iter()
        .map(|status| (status.name, status.state))
        .collect()
}

/// Instances constructed but not yet torn down, per the journal
pub fn live_instances(journal: &Journal, module: &str) -> usize {
    journal.count("construct", module) - journal.count("deactivate", module)
}
