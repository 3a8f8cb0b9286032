//! GENA subscription state machine.
//!
//! A [`GenaSubscription`] is either **Local** (a subscriber, in this process
//! or on the network, listening to a service hosted here) or **Remote** (this
//! process listening to a service on another device). Both share the id,
//! negotiated duration, sequence counter and current values; the variant
//! carries what differs.
//!
//! ```text
//! Pending ──▶ Established ──▶ Renewing ──▶ Established ... ──▶ Ended
//!    └──────────────────────────────────────────────────────────▲
//!                              (failure)
//! ```
//!
//! Event delivery for one subscription is serialized by a dispatch lock.
//! Handlers are never invoked while the state lock is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use url::Url;

use super::codec::write_propertyset;
use super::headers::SubscriptionId;
use super::message::GenaResponse;
use crate::config::IN_PROCESS_DURATION_SECONDS;
use crate::error::{CodecError, GenaError};
use crate::model::{LocalService, RemoteService, ServiceReference, StateValues};
use crate::sequence::{EventSequence, SequenceCheck};

/// Why a subscription ended, when it did not end at the caller's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The Maintainer found the subscription past its deadline
    Expired,
    /// The publisher rejected a renewal, or every attempt went unanswered
    RenewalFailed,
    /// The device hosting the service left the registry
    DeviceWasRemoved,
    /// The UNSUBSCRIBE was rejected or unanswered
    UnsubscribeFailed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CancelReason::Expired => "EXPIRED",
            CancelReason::RenewalFailed => "RENEWAL_FAILED",
            CancelReason::DeviceWasRemoved => "DEVICE_WAS_REMOVED",
            CancelReason::UnsubscribeFailed => "UNSUBSCRIBE_FAILED",
        };
        f.write_str(text)
    }
}

/// How an establishment failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFailure {
    /// Rejected locally before any I/O
    Precondition(GenaError),
    /// Nothing answered
    Unreachable,
    /// The publisher answered with an error status or unusable headers
    Rejected(GenaResponse),
    /// The caller cancelled establishment
    Cancelled,
}

impl SubscriptionFailure {
    pub fn response(&self) -> Option<&GenaResponse> {
        match self {
            SubscriptionFailure::Rejected(response) => Some(response),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&GenaError> {
        match self {
            SubscriptionFailure::Precondition(error) => Some(error),
            _ => None,
        }
    }

    /// Human-readable description of the failure.
    pub fn default_message(&self) -> String {
        match self {
            SubscriptionFailure::Rejected(response) => {
                format!("Subscription failed: HTTP response was: {response}")
            }
            SubscriptionFailure::Precondition(error) => {
                format!("Subscription failed: Exception occurred: {error}")
            }
            SubscriptionFailure::Unreachable => {
                "Subscription failed: No response received.".to_string()
            }
            SubscriptionFailure::Cancelled => "Subscription failed: Cancelled.".to_string(),
        }
    }
}

impl fmt::Display for SubscriptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.default_message())
    }
}

/// One delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenaEvent {
    pub sequence: EventSequence,
    pub values: StateValues,
}

/// Lifecycle hooks of a subscription.
///
/// Hooks run on whatever thread drove the transition and never under a
/// registry or subscription lock, so they may call back into the Registry.
pub trait SubscriptionHandler: Send + Sync {
    fn established(&self, subscription: &GenaSubscription);

    /// `subscription` is `None` when establishment failed before one existed.
    fn failed(&self, subscription: Option<&GenaSubscription>, failure: &SubscriptionFailure);

    /// `reason` is `None` for a caller-initiated end.
    fn ended(
        &self,
        subscription: &GenaSubscription,
        reason: Option<CancelReason>,
        response: Option<&GenaResponse>,
    );

    fn event_received(&self, subscription: &GenaSubscription, event: &GenaEvent);

    fn events_missed(&self, subscription: &GenaSubscription, missed: u32);

    fn invalid_message(&self, subscription: &GenaSubscription, error: &CodecError) {
        tracing::info!(
            subscription_id = ?subscription.id(),
            %error,
            "Ignoring invalid event message"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Pending,
    Established,
    Renewing,
    Ended,
}

/// Who receives the events of a local subscription.
pub enum LocalTarget {
    /// A control point in this process
    InProcess(Arc<dyn SubscriptionHandler>),
    /// A remote subscriber reached through NOTIFY
    Callbacks(Vec<Url>),
}

/// Data only a local subscription has.
pub struct LocalData {
    service: Arc<LocalService>,
    target: LocalTarget,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>,
}

impl LocalData {
    pub fn service(&self) -> &Arc<LocalService> {
        &self.service
    }

    pub fn target(&self) -> &LocalTarget {
        &self.target
    }
}

/// Data only a remote subscription has.
pub struct RemoteData {
    service: RemoteService,
    requested_duration_seconds: u32,
    handler: Arc<dyn SubscriptionHandler>,
}

impl RemoteData {
    pub fn service(&self) -> &RemoteService {
        &self.service
    }

    pub fn requested_duration_seconds(&self) -> u32 {
        self.requested_duration_seconds
    }
}

pub enum SubscriptionKind {
    Local(LocalData),
    Remote(RemoteData),
}

/// An event queued for NOTIFY delivery to a remote subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutboundEvent {
    pub sequence: EventSequence,
    pub body: String,
}

/// Outcome of feeding a received event to a remote subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Delivered { missed: u32 },
    Stale,
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct ModerationRecord {
    sent_at_millis: u64,
    numeric: Option<i64>,
}

struct SubscriptionState {
    id: Option<SubscriptionId>,
    phase: SubscriptionPhase,
    actual_duration_seconds: u32,
    // Local: number of the next event. Remote: last number received.
    sequence: EventSequence,
    // Local: initial event sent. Remote: at least one event received.
    observed: bool,
    current_values: StateValues,
    moderation: HashMap<String, ModerationRecord>,
}

pub struct GenaSubscription {
    service: ServiceReference,
    kind: SubscriptionKind,
    state: Mutex<SubscriptionState>,
    dispatch: ReentrantMutex<()>,
}

impl GenaSubscription {
    fn with_kind(
        service: ServiceReference,
        kind: SubscriptionKind,
        id: Option<SubscriptionId>,
        duration: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            kind,
            state: Mutex::new(SubscriptionState {
                id,
                phase: SubscriptionPhase::Pending,
                actual_duration_seconds: duration,
                sequence: EventSequence::ZERO,
                observed: false,
                current_values: StateValues::new(),
                moderation: HashMap::new(),
            }),
            dispatch: ReentrantMutex::new(()),
        })
    }

    /// Subscription of an in-process control point to a local service.
    pub fn local_in_process(
        service: ServiceReference,
        local: Arc<LocalService>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Arc<Self> {
        let kind = SubscriptionKind::Local(LocalData {
            service: local,
            target: LocalTarget::InProcess(handler),
            outbound: Mutex::new(None),
        });
        Self::with_kind(
            service,
            kind,
            Some(SubscriptionId::generate()),
            IN_PROCESS_DURATION_SECONDS,
        )
    }

    /// Subscription of a remote subscriber to a local service.
    pub fn local_for_callbacks(
        service: ServiceReference,
        local: Arc<LocalService>,
        callback_urls: Vec<Url>,
        duration_seconds: u32,
    ) -> Arc<Self> {
        let kind = SubscriptionKind::Local(LocalData {
            service: local,
            target: LocalTarget::Callbacks(callback_urls),
            outbound: Mutex::new(None),
        });
        Self::with_kind(
            service,
            kind,
            Some(SubscriptionId::generate()),
            duration_seconds,
        )
    }

    /// Subscription of this process to a remote service. The id arrives
    /// with the publisher's response.
    pub fn remote(
        service: ServiceReference,
        remote: RemoteService,
        requested_duration_seconds: u32,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Arc<Self> {
        let kind = SubscriptionKind::Remote(RemoteData {
            service: remote,
            requested_duration_seconds,
            handler,
        });
        Self::with_kind(service, kind, None, requested_duration_seconds)
    }

    pub fn id(&self) -> Option<SubscriptionId> {
        self.state.lock().id.clone()
    }

    pub fn service(&self) -> &ServiceReference {
        &self.service
    }

    pub fn kind(&self) -> &SubscriptionKind {
        &self.kind
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, SubscriptionKind::Local(_))
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.state.lock().phase
    }

    pub fn is_ended(&self) -> bool {
        self.phase() == SubscriptionPhase::Ended
    }

    pub fn actual_duration_seconds(&self) -> u32 {
        self.state.lock().actual_duration_seconds
    }

    pub fn current_sequence(&self) -> EventSequence {
        self.state.lock().sequence
    }

    pub fn current_values(&self) -> StateValues {
        self.state.lock().current_values.clone()
    }

    /// Callback URLs of a remote subscriber; empty otherwise.
    pub fn callback_urls(&self) -> &[Url] {
        match &self.kind {
            SubscriptionKind::Local(LocalData {
                target: LocalTarget::Callbacks(urls),
                ..
            }) => urls,
            _ => &[],
        }
    }

    fn handler(&self) -> Option<&Arc<dyn SubscriptionHandler>> {
        match &self.kind {
            SubscriptionKind::Local(LocalData {
                target: LocalTarget::InProcess(handler),
                ..
            }) => Some(handler),
            SubscriptionKind::Local(_) => None,
            SubscriptionKind::Remote(remote) => Some(&remote.handler),
        }
    }

    pub(crate) fn set_negotiated(&self, id: SubscriptionId, duration_seconds: u32) {
        let mut state = self.state.lock();
        state.id = Some(id);
        state.actual_duration_seconds = duration_seconds;
    }

    pub(crate) fn set_duration(&self, duration_seconds: u32) {
        self.state.lock().actual_duration_seconds = duration_seconds;
    }

    /// Pending to Established. Returns false if the subscription already
    /// left Pending.
    pub(crate) fn establish(&self) -> bool {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            if state.phase != SubscriptionPhase::Pending {
                return false;
            }
            state.phase = SubscriptionPhase::Established;
        }
        tracing::debug!(subscription_id = ?self.id(), service = %self.service, "Subscription established");
        if let Some(handler) = self.handler() {
            handler.established(self);
        }
        true
    }

    /// Terminal failure of a subscription that never got established.
    pub(crate) fn fail(&self, failure: &SubscriptionFailure) {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            if state.phase == SubscriptionPhase::Ended {
                return;
            }
            state.phase = SubscriptionPhase::Ended;
        }
        self.close_outbound();
        tracing::debug!(service = %self.service, %failure, "Subscription failed");
        if let Some(handler) = self.handler() {
            handler.failed(Some(self), failure);
        }
    }

    /// Move to Ended and notify the handler. Only the first call has an
    /// effect.
    pub(crate) fn end(&self, reason: Option<CancelReason>, response: Option<&GenaResponse>) -> bool {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            if state.phase == SubscriptionPhase::Ended {
                return false;
            }
            state.phase = SubscriptionPhase::Ended;
        }
        self.close_outbound();
        tracing::debug!(
            subscription_id = ?self.id(),
            reason = ?reason,
            "Subscription ended"
        );
        if let Some(handler) = self.handler() {
            handler.ended(self, reason, response);
        }
        true
    }

    /// Established to Renewing.
    pub(crate) fn begin_renewal(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != SubscriptionPhase::Established {
            return false;
        }
        state.phase = SubscriptionPhase::Renewing;
        true
    }

    /// Renewing back to Established, optionally with a new duration.
    pub(crate) fn finish_renewal(&self, duration_seconds: Option<u32>) {
        let mut state = self.state.lock();
        if state.phase == SubscriptionPhase::Renewing {
            state.phase = SubscriptionPhase::Established;
        }
        if let Some(duration) = duration_seconds {
            state.actual_duration_seconds = duration;
        }
    }

    /// Apply an event received for a remote subscription.
    ///
    /// The first event is taken as is. Later events are checked against the
    /// successor of the last sequence: a gap is reported through
    /// `events_missed` after delivery, an older number is dropped.
    pub fn receive_event(&self, sequence: EventSequence, values: StateValues) -> ReceiveOutcome {
        let SubscriptionKind::Remote(remote) = &self.kind else {
            return ReceiveOutcome::Ignored;
        };

        let _dispatch = self.dispatch.lock();
        let (event, missed) = {
            let mut state = self.state.lock();
            if state.phase == SubscriptionPhase::Ended {
                return ReceiveOutcome::Ignored;
            }
            let missed = if state.observed {
                match SequenceCheck::evaluate(state.sequence, sequence) {
                    SequenceCheck::InOrder => 0,
                    SequenceCheck::Gap { missed } => missed,
                    SequenceCheck::Stale { expected } => {
                        tracing::warn!(
                            subscription_id = ?state.id,
                            %expected,
                            received = %sequence,
                            "Dropping stale event"
                        );
                        return ReceiveOutcome::Stale;
                    }
                }
            } else {
                0
            };
            state.observed = true;
            state.sequence = sequence;
            // Publishers send only what changed
            state
                .current_values
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            (GenaEvent { sequence, values }, missed)
        };

        remote.handler.event_received(self, &event);
        if missed > 0 {
            remote.handler.events_missed(self, missed);
        }
        ReceiveOutcome::Delivered { missed }
    }

    /// Report a NOTIFY body that could not be decoded.
    pub fn invalid_message(&self, error: &CodecError) {
        let _dispatch = self.dispatch.lock();
        match self.handler() {
            Some(handler) => handler.invalid_message(self, error),
            None => tracing::info!(subscription_id = ?self.id(), %error, "Invalid event message"),
        }
    }

    pub(crate) fn attach_outbound(&self, sender: mpsc::UnboundedSender<OutboundEvent>) {
        if let SubscriptionKind::Local(local) = &self.kind {
            *local.outbound.lock() = Some(sender);
        }
    }

    fn close_outbound(&self) {
        if let SubscriptionKind::Local(local) = &self.kind {
            local.outbound.lock().take();
        }
    }

    /// Deliver the full evented state at the current sequence and start
    /// delivering changes.
    pub(crate) fn deliver_initial_event(&self, now_millis: u64) -> bool {
        let SubscriptionKind::Local(local) = &self.kind else {
            return false;
        };
        let _dispatch = self.dispatch.lock();
        let values = local.service.current_state();
        {
            let mut state = self.state.lock();
            if state.observed || state.phase == SubscriptionPhase::Ended {
                return false;
            }
            for (name, value) in &values {
                let moderated = local
                    .service
                    .variable(name)
                    .map_or(false, |v| v.events.is_moderated());
                if moderated {
                    state.moderation.insert(
                        name.clone(),
                        ModerationRecord {
                            sent_at_millis: now_millis,
                            numeric: value.parse().ok(),
                        },
                    );
                }
            }
            state.observed = true;
        }
        self.deliver_local(local, values);
        true
    }

    /// React to a change of `names` on the local service.
    pub(crate) fn on_state_changed(&self, names: &[String], now_millis: u64) {
        let SubscriptionKind::Local(local) = &self.kind else {
            return;
        };
        let _dispatch = self.dispatch.lock();
        {
            let state = self.state.lock();
            if !state.observed || state.phase == SubscriptionPhase::Ended {
                return;
            }
        }
        let changed = local.service.evented_values(names);
        let values = self.moderate(local, changed, now_millis);
        if values.is_empty() {
            tracing::trace!(subscription_id = ?self.id(), "All changes moderated, no event sent");
            return;
        }
        self.deliver_local(local, values);
    }

    fn moderate(&self, local: &LocalData, changed: StateValues, now_millis: u64) -> StateValues {
        let mut state = self.state.lock();
        changed
            .into_iter()
            .filter(|(name, value)| {
                let Some(details) = local.service.variable(name).map(|v| &v.events) else {
                    return true;
                };
                if !details.is_moderated() {
                    return true;
                }
                let previous = state.moderation.get(name).copied();
                if let (Some(rate), Some(previous)) = (details.maximum_rate, previous) {
                    let rate_millis = u64::try_from(rate.as_millis()).unwrap_or(u64::MAX);
                    if now_millis.saturating_sub(previous.sent_at_millis) <= rate_millis {
                        return false;
                    }
                }
                let numeric = value.parse::<i64>().ok();
                if let (Some(delta), Some(previous)) = (details.minimum_delta, previous) {
                    if let (Some(old), Some(new)) = (previous.numeric, numeric) {
                        if old.abs_diff(new) < delta {
                            return false;
                        }
                    }
                }
                state.moderation.insert(
                    name.clone(),
                    ModerationRecord {
                        sent_at_millis: now_millis,
                        numeric,
                    },
                );
                true
            })
            .collect()
    }

    // Caller holds the dispatch lock.
    fn deliver_local(&self, local: &LocalData, values: StateValues) {
        let event = {
            let mut state = self.state.lock();
            if state.phase == SubscriptionPhase::Ended {
                return;
            }
            state
                .current_values
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            GenaEvent {
                sequence: state.sequence,
                values,
            }
        };

        match &local.target {
            LocalTarget::InProcess(handler) => handler.event_received(self, &event),
            LocalTarget::Callbacks(_) => {
                let outbound = OutboundEvent {
                    sequence: event.sequence,
                    body: write_propertyset(&event.values),
                };
                if let Some(sender) = local.outbound.lock().as_ref() {
                    if sender.send(outbound).is_err() {
                        tracing::warn!(subscription_id = ?self.id(), "Outbound event queue closed");
                    }
                }
            }
        }

        self.state.lock().sequence.increment();
    }
}

impl fmt::Debug for GenaSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GenaSubscription")
            .field("id", &state.id)
            .field("service", &self.service)
            .field("local", &self.is_local())
            .field("phase", &state.phase)
            .field("sequence", &state.sequence)
            .field("duration", &state.actual_duration_seconds)
            .finish()
    }
}
