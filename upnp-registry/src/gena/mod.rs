//! GENA wire surface and subscription state machine.

pub mod codec;
pub mod headers;
pub mod message;
mod subscription;

pub use codec::{read_propertyset, write_propertyset};
pub use headers::{CallbackUrls, SubscriptionId, SubscriptionTimeout, NTS_PROPCHANGE, NT_EVENT};
pub use message::{
    status, GenaResponse, NotifyRequest, RenewRequest, SubscribeRequest, UnsubscribeRequest,
};
pub use subscription::{
    CancelReason, GenaEvent, GenaSubscription, LocalData, LocalTarget, ReceiveOutcome, RemoteData,
    SubscriptionFailure, SubscriptionHandler, SubscriptionKind, SubscriptionPhase,
};

pub(crate) use subscription::OutboundEvent;

#[cfg(test)]
pub(crate) use subscription::tests::RecordingHandler;
