//! The event fabric: a synchronous pub/sub bus, composable filters, an
//! asynchronous worker pool, and the adapter plumbing external
//! collaborators use to attach to the bus.

mod adapter;
mod bus;
mod filter;
mod processor;

pub use adapter::{AdapterTokens, EventAdapter};
pub use bus::{EventBus, EventHandler, EventSender};
pub use filter::EventFilter;
pub use processor::{AsyncProcessor, EventProcessor, ProcessorState};
