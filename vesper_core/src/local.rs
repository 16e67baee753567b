use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::engine::{CallError, Engine, Resolve};
use crate::error::RuntimeError;
use crate::value::{Portable, Value};

/// Function body of the reference engine: unit functions and natives are
/// plain Rust closures taking the calling heap and arguments, returning a
/// result value or a script error value.
pub type UnitFn = Arc<dyn Fn(&LocalHeap, &[Value]) -> Result<Value, Value> + Send + Sync>;

struct Unit {
    functions: HashMap<String, UnitFn>,
}

/// In-process reference engine. Units are registered up front as named
/// tables of closures; each heap tracks which units it has loaded, which
/// drives function-reference resolution when values cross heaps.
pub struct LocalEngine {
    units: RwLock<HashMap<String, Arc<Unit>>>,
    natives: RwLock<HashMap<String, UnitFn>>,
    next_heap_id: AtomicU64,
}

#[derive(Clone)]
pub struct LocalHeap {
    inner: Arc<HeapInner>,
}

struct HeapInner {
    id: u64,
    state: Mutex<HeapState>,
}

struct HeapState {
    loaded: HashSet<String>,
    context: Option<Arc<dyn Any + Send + Sync>>,
}

impl LocalHeap {
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl LocalEngine {
    pub fn new() -> Arc<LocalEngine> {
        Arc::new(LocalEngine {
            units: RwLock::new(HashMap::new()),
            natives: RwLock::new(HashMap::new()),
            next_heap_id: AtomicU64::new(1),
        })
    }

    pub fn register_unit(&self, name: &str, functions: Vec<(&str, UnitFn)>) {
        let unit = Unit {
            functions: functions
                .into_iter()
                .map(|(fname, f)| (fname.to_string(), f))
                .collect(),
        };
        self.units.write().insert(name.to_string(), Arc::new(unit));
    }

    /// Registers a native function callable by name from any heap.
    pub fn register_native(&self, name: &str, f: UnitFn) {
        self.natives.write().insert(name.to_string(), f);
    }

    pub fn call_native(
        &self,
        heap: &LocalHeap,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Value> {
        let f = match self.natives.read().get(name) {
            Some(f) => Arc::clone(f),
            None => return Err(Value::str(&format!("native function '{}' not found", name))),
        };
        f(heap, args)
    }

    pub fn unit_fn<F>(f: F) -> UnitFn
    where
        F: Fn(&LocalHeap, &[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn clone_value(
        &self,
        dst: &LocalHeap,
        value: &Value,
        resolve: Resolve,
    ) -> Result<Value, RuntimeError> {
        match value {
            Value::Func { unit, name } => {
                let loaded = dst.inner.state.lock().loaded.contains(&**unit);
                if !loaded {
                    match resolve {
                        Resolve::Load => self.load(dst, unit)?,
                        Resolve::Existing => {
                            return Err(RuntimeError::transfer(format!(
                                "function {}:{} refers to a unit not loaded in the destination heap",
                                unit, name
                            )))
                        }
                    }
                }
                let units = self.units.read();
                let known = units
                    .get(&**unit)
                    .map(|u| u.functions.contains_key(&**name))
                    .unwrap_or(false);
                if !known {
                    return Err(RuntimeError::transfer(format!(
                        "function {}:{} does not exist",
                        unit, name
                    )));
                }
                Ok(value.clone())
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(self.clone_value(dst, item, resolve)?);
                }
                Ok(Value::array(out))
            }
            Value::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs.iter() {
                    out.push((
                        self.clone_value(dst, k, resolve)?,
                        self.clone_value(dst, v, resolve)?,
                    ));
                }
                Ok(Value::Map(Arc::new(out)))
            }
            // immutable leaves and identity values pass through
            _ => Ok(value.clone()),
        }
    }
}

impl Engine for LocalEngine {
    type Heap = LocalHeap;
    type Value = Value;

    fn create_heap(&self) -> Result<LocalHeap, RuntimeError> {
        Ok(LocalHeap {
            inner: Arc::new(HeapInner {
                id: self.next_heap_id.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(HeapState {
                    loaded: HashSet::new(),
                    context: None,
                }),
            }),
        })
    }

    fn load(&self, heap: &LocalHeap, unit: &str) -> Result<(), RuntimeError> {
        if !self.units.read().contains_key(unit) {
            return Err(RuntimeError::engine(format!("unit '{}' not found", unit)));
        }
        heap.inner.state.lock().loaded.insert(unit.to_string());
        Ok(())
    }

    fn get_function(
        &self,
        heap: &LocalHeap,
        unit: &str,
        name: &str,
    ) -> Result<Value, RuntimeError> {
        if !heap.inner.state.lock().loaded.contains(unit) {
            return Err(RuntimeError::engine(format!(
                "unit '{}' is not loaded in this heap",
                unit
            )));
        }
        let units = self.units.read();
        let known = units
            .get(unit)
            .map(|u| u.functions.contains_key(name))
            .unwrap_or(false);
        if !known {
            return Err(RuntimeError::engine(format!(
                "function {}:{} not found",
                unit, name
            )));
        }
        Ok(Value::func(unit, name))
    }

    fn call(
        &self,
        heap: &LocalHeap,
        func: &Value,
        args: &[Value],
    ) -> Result<Value, CallError<Value>> {
        let (unit, name) = match func {
            Value::Func { unit, name } => (unit, name),
            _ => {
                return Err(CallError::Engine(RuntimeError::usage(
                    "value is not a function",
                )))
            }
        };
        let f = {
            let units = self.units.read();
            match units.get(&**unit).and_then(|u| u.functions.get(&**name)) {
                Some(f) => Arc::clone(f),
                None => {
                    return Err(CallError::Engine(RuntimeError::engine(format!(
                        "function {}:{} not found",
                        unit, name
                    ))))
                }
            }
        };
        f(heap, args).map_err(CallError::Script)
    }

    fn clone_between(
        &self,
        dst: &LocalHeap,
        _src: &LocalHeap,
        value: &Value,
        resolve: Resolve,
    ) -> Result<Value, RuntimeError> {
        self.clone_value(dst, value, resolve)
    }

    fn serialize(&self, _heap: &LocalHeap, value: &Value) -> Result<Vec<u8>, RuntimeError> {
        let portable = value.to_portable()?;
        serde_json::to_vec(&portable).map_err(|e| RuntimeError::engine(e.to_string()))
    }

    fn deserialize(&self, _heap: &LocalHeap, bytes: &[u8]) -> Result<Value, RuntimeError> {
        let portable: Portable =
            serde_json::from_slice(bytes).map_err(|e| RuntimeError::engine(e.to_string()))?;
        Ok(Value::from_portable(portable))
    }

    fn equals(&self, _heap_a: &LocalHeap, a: &Value, _heap_b: &LocalHeap, b: &Value) -> bool {
        a == b
    }

    fn describe(&self, _heap: &LocalHeap, value: &Value) -> String {
        value.to_string()
    }

    fn set_context(&self, heap: &LocalHeap, context: Option<Arc<dyn Any + Send + Sync>>) {
        heap.inner.state.lock().context = context;
    }

    fn context(&self, heap: &LocalHeap) -> Option<Arc<dyn Any + Send + Sync>> {
        heap.inner.state.lock().context.clone()
    }

    fn make_int(&self, _heap: &LocalHeap, value: i32) -> Value {
        Value::Int(value)
    }

    fn as_int(&self, _heap: &LocalHeap, value: &Value) -> Option<i32> {
        value.as_int()
    }
}
