//! Local and remote services.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use url::Url;

use super::ServiceId;

/// Evented state: variable name to its string value.
pub type StateValues = BTreeMap<String, String>;

/// Metadata shared by local and remote services.
pub trait ServiceMeta {
    fn service_id(&self) -> &ServiceId;
    fn service_type(&self) -> &str;
}

/// A service on a remote device, as far as eventing is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    service_id: ServiceId,
    service_type: String,
    event_subscription_url: Url,
    control_url: Url,
}

impl RemoteService {
    pub fn new(
        service_id: impl Into<ServiceId>,
        service_type: impl Into<String>,
        event_subscription_url: Url,
        control_url: Url,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            service_type: service_type.into(),
            event_subscription_url,
            control_url,
        }
    }

    pub fn event_subscription_url(&self) -> &Url {
        &self.event_subscription_url
    }

    pub fn control_url(&self) -> &Url {
        &self.control_url
    }
}

impl ServiceMeta for RemoteService {
    fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    fn service_type(&self) -> &str {
        &self.service_type
    }
}

/// Eventing rules of one state variable.
///
/// `maximum_rate` and `minimum_delta` moderate how often a change is sent to
/// a subscriber; a variable with neither is sent on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDetails {
    pub send_events: bool,
    pub maximum_rate: Option<Duration>,
    pub minimum_delta: Option<u64>,
}

impl EventDetails {
    pub fn evented() -> Self {
        Self {
            send_events: true,
            ..Default::default()
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_maximum_rate(mut self, rate: Duration) -> Self {
        self.maximum_rate = Some(rate);
        self
    }

    pub fn with_minimum_delta(mut self, delta: u64) -> Self {
        self.minimum_delta = Some(delta);
        self
    }

    pub fn is_moderated(&self) -> bool {
        self.maximum_rate.is_some() || self.minimum_delta.is_some()
    }
}

/// A state variable declared by a local service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVariable {
    pub name: String,
    pub events: EventDetails,
}

impl StateVariable {
    pub fn evented(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: EventDetails::evented(),
        }
    }

    pub fn silent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: EventDetails::silent(),
        }
    }

    pub fn with_events(mut self, events: EventDetails) -> Self {
        self.events = events;
        self
    }
}

/// Receives the names of variables that changed on a local service.
///
/// The subscription engine installs the only observer of each service.
pub trait StateChangeObserver: Send + Sync {
    fn on_state_changed(&self, service: &LocalService, names: &[String]);
}

/// A service implemented in this process.
pub struct LocalService {
    service_id: ServiceId,
    service_type: String,
    variables: Vec<StateVariable>,
    values: RwLock<StateValues>,
    observer: RwLock<Option<Arc<dyn StateChangeObserver>>>,
}

impl LocalService {
    pub fn new(service_id: impl Into<ServiceId>, service_type: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_type: service_type.into(),
            variables: Vec::new(),
            values: RwLock::new(StateValues::new()),
            observer: RwLock::new(None),
        }
    }

    /// Declare a variable with its initial value.
    pub fn with_variable(mut self, variable: StateVariable, initial: impl Into<String>) -> Self {
        self.values
            .get_mut()
            .insert(variable.name.clone(), initial.into());
        self.variables.push(variable);
        self
    }

    pub fn variables(&self) -> &[StateVariable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&StateVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn value(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    /// Store a value without notifying anyone.
    pub fn set_value(&self, name: &str, value: impl Into<String>) {
        self.values.write().insert(name.to_string(), value.into());
    }

    /// Current values of every evented variable.
    pub fn current_state(&self) -> StateValues {
        let values = self.values.read();
        self.variables
            .iter()
            .filter(|v| v.events.send_events)
            .filter_map(|v| values.get(&v.name).map(|val| (v.name.clone(), val.clone())))
            .collect()
    }

    /// Current values of the evented variables among `names`.
    pub fn evented_values(&self, names: &[String]) -> StateValues {
        let values = self.values.read();
        names
            .iter()
            .filter(|n| self.variable(n).map_or(false, |v| v.events.send_events))
            .filter_map(|n| values.get(n).map(|val| (n.clone(), val.clone())))
            .collect()
    }

    /// Tell the observer that `names` changed.
    pub fn fire_state_changed(&self, names: &[&str]) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
            observer.on_state_changed(self, &names);
        }
    }

    /// Set one value and fire a change for it.
    pub fn update(&self, name: &str, value: impl Into<String>) {
        self.set_value(name, value);
        self.fire_state_changed(&[name]);
    }

    pub(crate) fn set_observer(&self, observer: Arc<dyn StateChangeObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub(crate) fn clear_observer(&self) {
        self.observer.write().take();
    }

    pub(crate) fn has_observer(&self) -> bool {
        self.observer.read().is_some()
    }
}

impl ServiceMeta for LocalService {
    fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    fn service_type(&self) -> &str {
        &self.service_type
    }
}

impl<T: ServiceMeta> ServiceMeta for Arc<T> {
    fn service_id(&self) -> &ServiceId {
        (**self).service_id()
    }

    fn service_type(&self) -> &str {
        (**self).service_type()
    }
}

impl fmt::Debug for LocalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalService")
            .field("service_id", &self.service_id)
            .field("service_type", &self.service_type)
            .field("variables", &self.variables)
            .field("observed", &self.has_observer())
            .finish()
    }
}
