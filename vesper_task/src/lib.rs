pub mod atomic;
pub mod barrier;
pub mod channel;
pub mod channel_set;
pub mod compute;
mod config;
pub mod global;
pub mod host;
pub mod natives;
pub mod task;
pub mod wait;

pub use barrier::Barrier;
pub use channel::{ChannelRef, Role};
pub use channel_set::{ChannelSet, SetReceive};
pub use compute::{ComputeError, ComputePool};
pub use config::HeapConfig;
pub use global::GlobalStore;
pub use host::{Host, Object};
pub use task::Task;
pub use wait::Wait;
