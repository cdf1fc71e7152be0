//! Scheduler events and the pub/sub contract used to distribute them.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod scheduler;

pub use bus::{BusError, EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::InMemoryEventBus;
pub use scheduler::{SchedulerEvent, SchedulerEnvelope};
