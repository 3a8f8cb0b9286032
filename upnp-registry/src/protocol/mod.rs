//! GENA protocol flows between the Registry and the network.

mod incoming;
pub(crate) mod outgoing;
mod receiver;

pub use incoming::{
    IncomingEvent, IncomingSubscribe, IncomingUnsubscribe, SubscribeConfirmation,
    SubscribeOutcome,
};
pub use receiver::EventReceiver;
