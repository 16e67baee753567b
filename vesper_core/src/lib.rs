pub mod engine;
pub mod error;
pub mod local;
pub mod shared;
pub mod value;

pub use engine::{CallError, Engine, Resolve};
pub use error::{ErrorKind, RuntimeError};
pub use local::{LocalEngine, LocalHeap, UnitFn};
pub use shared::SharedArray;
pub use value::Value;
