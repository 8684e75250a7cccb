mod registry;
mod types;
pub mod websocket;

pub use registry::{
    BroadcastReport, ConnectionRegistry, RegistrationResult, RegistryConfig, Subscriber,
    SubscriberInbox,
};
pub use types::{
    BatchFrames, ClientMessage, EventFrame, PayloadView, ServerMessage, SlowConsumerPolicy,
    SubscriberConfig, SubscriberId,
};
pub use websocket::handle_websocket;
