//! Pool and topology monitoring
//!
//! The APM module lets applications observe connection lifecycle and
//! topology changes at runtime. Hooks registered on the client's listener
//! are called synchronously, outside of any pool or topology lock, for every
//! event. A listener with no hooks costs one atomic load per event.
mod event;
mod listener;

pub use self::event::{CloseReason, PoolEvent, TopologyEvent};
pub use self::listener::{Listener, PoolHook, TopologyHook};
