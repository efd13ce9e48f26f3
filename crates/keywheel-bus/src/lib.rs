//! Keywheel message-bus binding.
//!
//! Thin runtime glue around [`keywheel_core`]'s synchronous protocol
//! engine: the [`MessageBus`] trait models the external at-least-once,
//! unordered transport; [`MemoryBus`] is an in-process implementation for
//! tests and simulation; [`MemberRuntime`] wires an engine to its two
//! topics with one supervised receive loop per topic.
//!
//! # Delivery contract
//!
//! The bus delivers each message at least once, in no particular order,
//! with explicit ack/nack per delivery, and may echo a publisher's own
//! messages back to it. The engine's self-filter and dedup records make
//! the protocol correct under exactly these semantics.

#![forbid(unsafe_code)]

pub mod bus;
pub mod memory;
pub mod runtime;
pub mod supervisor;

pub use bus::{Acker, BusError, BusMessage, MessageBus, Subscription};
pub use memory::MemoryBus;
pub use runtime::MemberRuntime;
pub use supervisor::Supervisor;
