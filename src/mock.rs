//! An in-memory [`Bus`] for unit tests.
//!
//! Scripted object paths, properties and method replies; every method call is recorded, and
//! property writes as well as [`MockBus::notify`] deliver `PropertiesChanged` notifications to
//! every properties proxy resolved for the path, synchronously.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use zbus::zvariant::{OwnedValue, Value};

use crate::{
    bus::{Bus, InterfaceProxy, ObjectProxy, PropertiesChanged, PropertiesProxy},
    event::Emitter,
    Error, Result,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<OwnedValue>,
}

type Hook = Arc<dyn Fn(&MockBus, &Call) + Send + Sync>;

#[derive(Default)]
struct State {
    /// Node lists handed out by successive lookups; the last one sticks.
    nodes: VecDeque<Vec<String>>,
    props: HashMap<(String, String), HashMap<String, OwnedValue>>,
    replies: HashMap<String, Vec<OwnedValue>>,
    failures: HashMap<String, String>,
    hooks: HashMap<String, Hook>,
    calls: Vec<Call>,
    property_proxies: Vec<(String, Emitter<PropertiesChanged>)>,
    object_lookups: usize,
    closed: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockBus {
    state: Arc<Mutex<State>>,
}

impl MockBus {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lock().closed {
            return Err(Error::from("bus connection closed"));
        }
        Ok(())
    }

    pub fn handle(&self) -> Arc<dyn Bus> {
        Arc::new(self.clone())
    }

    pub fn set_nodes(&self, nodes: &[&str]) {
        let mut state = self.lock();
        state.nodes.clear();
        state.nodes.push_back(nodes.iter().map(|n| n.to_string()).collect());
    }

    /// Hands out `sequence[0]` on the next lookup, `sequence[1]` on the one after, and so on.
    pub fn queue_nodes(&self, sequence: &[&[&str]]) {
        let mut state = self.lock();
        state.nodes = sequence
            .iter()
            .map(|nodes| nodes.iter().map(|n| n.to_string()).collect())
            .collect();
    }

    pub fn set_prop(&self, path: &str, iface: &str, name: &str, value: Value<'_>) {
        self.lock()
            .props
            .entry((path.to_string(), iface.to_string()))
            .or_default()
            .insert(name.to_string(), OwnedValue::from(value));
    }

    pub fn reply(&self, method: &str, values: Vec<OwnedValue>) {
        self.lock().replies.insert(method.to_string(), values);
    }

    pub fn fail(&self, method: &str, message: &str) {
        self.lock()
            .failures
            .insert(method.to_string(), message.to_string());
    }

    /// Runs `hook` whenever `method` is called, before the reply is returned.
    pub fn hook<F>(&self, method: &str, hook: F)
    where
        F: Fn(&MockBus, &Call) + Send + Sync + 'static,
    {
        self.lock().hooks.insert(method.to_string(), Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn method_calls(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.method.clone()).collect()
    }

    pub fn object_lookups(&self) -> usize {
        self.lock().object_lookups
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of properties proxies resolved for `path` so far.
    pub fn property_proxies(&self, path: &str) -> usize {
        self.lock()
            .property_proxies
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    /// Total number of `PropertiesChanged` listeners on all properties proxies of `path`.
    pub fn listener_count(&self, path: &str) -> usize {
        self.lock()
            .property_proxies
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, events)| events.listener_count())
            .sum()
    }

    /// Delivers a `PropertiesChanged` notification for `path`.
    pub fn notify(&self, path: &str, iface: &str, changed: &[(&str, Value<'_>)]) {
        let change = PropertiesChanged {
            interface: iface.to_string(),
            changed: changed
                .iter()
                .map(|(name, value)| (name.to_string(), OwnedValue::from(value.clone())))
                .collect(),
            invalidated: Vec::new(),
        };
        let targets = self
            .lock()
            .property_proxies
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, events)| events.clone())
            .collect::<Vec<_>>();
        for events in targets {
            events.emit(&change);
        }
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn object(&self, _service: &str, path: &str) -> Result<Arc<dyn ObjectProxy>> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.object_lookups += 1;
        let nodes = if state.nodes.len() > 1 {
            state.nodes.pop_front().unwrap_or_default()
        } else {
            state.nodes.front().cloned().unwrap_or_default()
        };
        Ok(Arc::new(MockObject {
            bus: self.clone(),
            path: path.to_string(),
            nodes,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

struct MockObject {
    bus: MockBus,
    path: String,
    nodes: Vec<String>,
}

#[async_trait]
impl ObjectProxy for MockObject {
    async fn nodes(&self) -> Result<Vec<String>> {
        self.bus.ensure_open()?;
        Ok(self.nodes.clone())
    }

    async fn interface(&self, name: &str) -> Result<Arc<dyn InterfaceProxy>> {
        Ok(Arc::new(MockInterface {
            bus: self.bus.clone(),
            path: self.path.clone(),
            iface: name.to_string(),
        }))
    }

    async fn properties(&self) -> Result<Arc<dyn PropertiesProxy>> {
        let events = Emitter::new();
        self.bus
            .lock()
            .property_proxies
            .push((self.path.clone(), events.clone()));
        Ok(Arc::new(MockProperties {
            bus: self.bus.clone(),
            path: self.path.clone(),
            events,
        }))
    }
}

struct MockInterface {
    bus: MockBus,
    path: String,
    iface: String,
}

#[async_trait]
impl InterfaceProxy for MockInterface {
    async fn call(&self, method: &str, args: Vec<OwnedValue>) -> Result<Vec<OwnedValue>> {
        self.bus.ensure_open()?;
        let call = Call {
            path: self.path.clone(),
            interface: self.iface.clone(),
            method: method.to_string(),
            args,
        };
        let (hook, failure, reply) = {
            let mut state = self.bus.lock();
            state.calls.push(call.clone());
            (
                state.hooks.get(method).cloned(),
                state.failures.get(method).cloned(),
                state.replies.get(method).cloned(),
            )
        };
        if let Some(hook) = hook {
            hook(&self.bus, &call);
        }
        if let Some(message) = failure {
            return Err(Error::from(message));
        }
        Ok(reply.unwrap_or_default())
    }
}

struct MockProperties {
    bus: MockBus,
    path: String,
    events: Emitter<PropertiesChanged>,
}

#[async_trait]
impl PropertiesProxy for MockProperties {
    async fn get(&self, interface: &str, name: &str) -> Result<OwnedValue> {
        self.bus.ensure_open()?;
        self.bus
            .lock()
            .props
            .get(&(self.path.clone(), interface.to_string()))
            .and_then(|props| props.get(name))
            .cloned()
            .ok_or_else(|| Error::from(format!("no property {} on {}", name, interface)))
    }

    async fn get_all(&self, interface: &str) -> Result<HashMap<String, OwnedValue>> {
        self.bus.ensure_open()?;
        Ok(self
            .bus
            .lock()
            .props
            .get(&(self.path.clone(), interface.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn set(&self, interface: &str, name: &str, value: OwnedValue) -> Result<()> {
        self.bus.ensure_open()?;
        self.bus.set_prop(&self.path, interface, name, Value::clone(&value));
        self.bus
            .notify(&self.path, interface, &[(name, Value::clone(&value))]);
        Ok(())
    }

    fn events(&self) -> &Emitter<PropertiesChanged> {
        &self.events
    }
}
