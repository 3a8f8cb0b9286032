//! Requests this process sends to remote publishers: SUBSCRIBE, renewal
//! and UNSUBSCRIBE.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::GenaError;
use crate::gena::{
    CallbackUrls, CancelReason, GenaSubscription, RenewRequest, SubscribeRequest,
    SubscriptionFailure, SubscriptionKind, SubscriptionTimeout, UnsubscribeRequest,
};
use crate::registry::Registry;
use crate::transport::GenaClient;

fn fail(subscription: &GenaSubscription, failure: SubscriptionFailure) -> SubscriptionFailure {
    subscription.fail(&failure);
    failure
}

/// Duration granted by a response, or `requested` when the publisher sent
/// none or an infinite one.
fn granted_duration(timeout: Option<SubscriptionTimeout>, requested: u32) -> u32 {
    match timeout {
        Some(SubscriptionTimeout::Seconds(seconds)) if seconds > 0 => seconds,
        _ => requested,
    }
}

/// Establish a remote subscription.
///
/// On success the subscription carries the SID and duration the publisher
/// granted, is tracked by the Registry and is Established. On failure the
/// handler saw `failed` and nothing was added.
pub(crate) async fn subscribe(
    registry: &Registry,
    subscription: &Arc<GenaSubscription>,
    cancel: &CancellationToken,
) -> Result<(), SubscriptionFailure> {
    let SubscriptionKind::Remote(remote) = subscription.kind() else {
        return Err(fail(
            subscription,
            SubscriptionFailure::Precondition(GenaError::Registry(
                "not a remote subscription".to_string(),
            )),
        ));
    };
    if cancel.is_cancelled() {
        return Err(fail(subscription, SubscriptionFailure::Cancelled));
    }

    let callback_urls = registry.callback_urls();
    if callback_urls.is_empty() {
        tracing::warn!(service = %subscription.service(), "No callback URL to subscribe with");
        return Err(fail(subscription, SubscriptionFailure::Unreachable));
    }

    let requested = remote.requested_duration_seconds();
    let request = SubscribeRequest {
        url: remote.service().event_subscription_url().clone(),
        callback_urls: CallbackUrls::new(callback_urls),
        duration_seconds: requested,
    };

    // NOTIFYs for this SID may arrive before the response is processed
    let pending = registry.register_pending_remote_subscription();
    tracing::debug!(url = %request.url, requested, "Sending SUBSCRIBE");
    let result = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(fail(subscription, SubscriptionFailure::Cancelled));
        }
        result = registry.client().subscribe(&request) => result,
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %request.url, error = %e, "SUBSCRIBE got no response");
            return Err(fail(subscription, SubscriptionFailure::Unreachable));
        }
    };
    if !response.is_success() {
        tracing::warn!(url = %request.url, status = response.status, "SUBSCRIBE rejected");
        return Err(fail(subscription, SubscriptionFailure::Rejected(response)));
    }
    let Some(id) = response.subscription_id() else {
        tracing::warn!(url = %request.url, "SUBSCRIBE response without a valid SID");
        return Err(fail(subscription, SubscriptionFailure::Rejected(response)));
    };

    let duration = granted_duration(response.timeout(), requested);
    subscription.set_negotiated(id.clone(), duration);

    if cancel.is_cancelled() {
        // The publisher already holds a subscription for us
        release_in_background(registry, subscription);
        return Err(fail(subscription, SubscriptionFailure::Cancelled));
    }

    if let Err(e) = registry.add_remote_subscription(subscription.clone()) {
        return Err(fail(
            subscription,
            SubscriptionFailure::Precondition(GenaError::Registry(e.to_string())),
        ));
    }
    drop(pending);

    if cancel.is_cancelled() {
        // Whoever removes the entry owns the UNSUBSCRIBE
        if registry.remove_remote_subscription(&id).is_some() {
            release_in_background(registry, subscription);
        }
        return Err(fail(subscription, SubscriptionFailure::Cancelled));
    }

    tracing::info!(subscription_id = %id, duration, "Remote subscription established");
    subscription.establish();
    Ok(())
}

/// Renew an established remote subscription. `attempt` counts renewals
/// since the last success, this one included.
pub(crate) async fn renew(registry: &Registry, subscription: Arc<GenaSubscription>, attempt: u32) {
    let (Some(id), SubscriptionKind::Remote(remote)) = (subscription.id(), subscription.kind())
    else {
        return;
    };
    let requested = remote.requested_duration_seconds();
    let request = RenewRequest {
        url: remote.service().event_subscription_url().clone(),
        subscription_id: id.clone(),
        duration_seconds: requested,
    };

    match registry.client().renew(&request).await {
        Err(e) => {
            let max_attempts = registry.config().max_renewal_attempts;
            if attempt >= max_attempts {
                tracing::warn!(subscription_id = %id, attempt, error = %e, "Renewal failed, giving up");
                registry.remove_remote_subscription(&id);
                subscription.end(Some(CancelReason::RenewalFailed), None);
            } else {
                tracing::debug!(subscription_id = %id, attempt, error = %e, "Renewal got no response, will retry");
                subscription.finish_renewal(None);
            }
        }
        Ok(response) if !response.is_success() => {
            tracing::warn!(subscription_id = %id, status = response.status, "Renewal rejected");
            registry.remove_remote_subscription(&id);
            subscription.end(Some(CancelReason::RenewalFailed), Some(&response));
        }
        Ok(response) => {
            let duration = granted_duration(response.timeout(), requested);
            subscription.finish_renewal(Some(duration));
            registry.update_remote_subscription(&subscription);
            tracing::debug!(subscription_id = %id, duration, "Remote subscription renewed");
        }
    }
}

/// Send UNSUBSCRIBE for a subscription the Registry no longer tracks and end
/// it. A subscription that never got a SID just ends.
pub(crate) async fn unsubscribe(client: &dyn GenaClient, subscription: &GenaSubscription) {
    let (Some(id), SubscriptionKind::Remote(remote)) = (subscription.id(), subscription.kind())
    else {
        subscription.end(None, None);
        return;
    };
    let request = UnsubscribeRequest {
        url: remote.service().event_subscription_url().clone(),
        subscription_id: id.clone(),
    };

    match client.unsubscribe(&request).await {
        Err(e) => {
            tracing::warn!(subscription_id = %id, error = %e, "UNSUBSCRIBE got no response");
            subscription.end(Some(CancelReason::UnsubscribeFailed), None);
        }
        Ok(response) if !response.is_success() => {
            tracing::warn!(subscription_id = %id, status = response.status, "UNSUBSCRIBE rejected");
            subscription.end(Some(CancelReason::UnsubscribeFailed), Some(&response));
        }
        Ok(response) => {
            tracing::debug!(subscription_id = %id, "Remote subscription ended");
            subscription.end(None, Some(&response));
        }
    }
}

fn release_in_background(registry: &Registry, subscription: &Arc<GenaSubscription>) {
    let client = registry.client().clone();
    let abandoned = subscription.clone();
    let _ = registry.executor().submit(async move {
        release(client.as_ref(), &abandoned).await;
    });
}

/// Best-effort UNSUBSCRIBE without touching the subscription's lifecycle.
async fn release(client: &dyn GenaClient, subscription: &GenaSubscription) {
    let (Some(id), SubscriptionKind::Remote(remote)) = (subscription.id(), subscription.kind())
    else {
        return;
    };
    let request = UnsubscribeRequest {
        url: remote.service().event_subscription_url().clone(),
        subscription_id: id,
    };
    if let Err(e) = client.unsubscribe(&request).await {
        tracing::debug!(error = %e, "Releasing cancelled subscription failed");
    }
}
