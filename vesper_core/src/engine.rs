use std::any::Any;
use std::sync::Arc;

use crate::error::RuntimeError;

/// How function references are resolved when a value crosses heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Only resolve against units the destination heap already loaded.
    Existing,
    /// Load missing units into the destination heap as needed.
    Load,
}

/// Outcome of calling script code: either the script raised an error value
/// in its own heap, or the engine itself failed.
pub enum CallError<V> {
    Script(V),
    Engine(RuntimeError),
}

/// Seam between the runtime and a script engine.
///
/// A `Heap` is an isolated execution context owned by one thread at a time;
/// values are only valid inside the heap that allocated them and cross the
/// boundary through `clone_between`. Dropping the last clone of a `Heap`
/// handle destroys the heap.
pub trait Engine: Send + Sync + 'static {
    type Heap: Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    fn create_heap(&self) -> Result<Self::Heap, RuntimeError>;

    /// Makes the named unit's code available in the heap.
    fn load(&self, heap: &Self::Heap, unit: &str) -> Result<(), RuntimeError>;

    fn get_function(
        &self,
        heap: &Self::Heap,
        unit: &str,
        name: &str,
    ) -> Result<Self::Value, RuntimeError>;

    fn call(
        &self,
        heap: &Self::Heap,
        func: &Self::Value,
        args: &[Self::Value],
    ) -> Result<Self::Value, CallError<Self::Value>>;

    /// Deep-copies `value` from `src` into `dst`. Function references are
    /// resolved per `resolve`; values that cannot cross heaps produce a
    /// transfer error.
    fn clone_between(
        &self,
        dst: &Self::Heap,
        src: &Self::Heap,
        value: &Self::Value,
        resolve: Resolve,
    ) -> Result<Self::Value, RuntimeError>;

    fn serialize(&self, heap: &Self::Heap, value: &Self::Value) -> Result<Vec<u8>, RuntimeError>;

    fn deserialize(&self, heap: &Self::Heap, bytes: &[u8]) -> Result<Self::Value, RuntimeError>;

    /// Structural equality across heap boundaries.
    fn equals(
        &self,
        heap_a: &Self::Heap,
        a: &Self::Value,
        heap_b: &Self::Heap,
        b: &Self::Value,
    ) -> bool;

    fn collect(&self, _heap: &Self::Heap) {}

    /// Pins a value against collection while the runtime holds it outside
    /// script reach. Engines with ownership-based values need no pinning.
    fn ref_value(&self, _heap: &Self::Heap, _value: &Self::Value) {}

    fn unref_value(&self, _heap: &Self::Heap, _value: &Self::Value) {}

    /// Human-readable rendering used when dumping uncaught script errors.
    fn describe(&self, heap: &Self::Heap, value: &Self::Value) -> String;

    /// Per-heap context slot; the runtime stores the current task here.
    fn set_context(&self, heap: &Self::Heap, context: Option<Arc<dyn Any + Send + Sync>>);

    fn context(&self, heap: &Self::Heap) -> Option<Arc<dyn Any + Send + Sync>>;

    fn make_int(&self, heap: &Self::Heap, value: i32) -> Self::Value;

    fn as_int(&self, heap: &Self::Heap, value: &Self::Value) -> Option<i32>;
}
