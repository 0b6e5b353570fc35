pub mod event_bus;
pub mod message_router;

pub use event_bus::InMemoryEventBus;
pub use message_router::InMemoryMessageRouter;
