pub mod event_bus;
pub mod process_supervisor;
pub mod subscriber_queue;

pub use event_bus::{BusEvent, EventBusActor, EventBusArguments, EventBusMsg, Subscription};
pub use process_supervisor::{ProcessSupervisorActor, SupervisorError, SupervisorHandle, SupervisorMsg};
pub use subscriber_queue::{Delivery, SubscriberQueue};
