//! Lazily prepared proxies for one interface of one remote object.
//!
//! Every handle in this crate ([`Adapter`], [`Device`], the GATT types) owns a [`BusHelper`]
//! bound to its object path and interface. The helper resolves the underlying proxies on first
//! use, so constructing handles never touches the bus.
//!
//! [`Adapter`]: crate::Adapter
//! [`Device`]: crate::device::Device

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use futures_channel::oneshot;
use futures_util::lock::Mutex as AsyncMutex;
use zbus::zvariant::OwnedValue;

use crate::{
    bus::{Bus, InterfaceProxy, ObjectProxy, PropertiesChanged, PropertiesProxy},
    error::ErrorKind,
    event::{Emitter, ListenerId},
    path,
    value::{normalize, unwrap_variant, TypedValue},
    Error, Result,
};

/// Controls which parts of a remote object a [`BusHelper`] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperOptions {
    /// Resolve the properties interface and allow property access.
    pub use_props: bool,
    /// Republish `PropertiesChanged` notifications for the bound interface on
    /// [`BusHelper::events`]. Only effective together with `use_props`.
    pub use_props_events: bool,
}

impl Default for HelperOptions {
    fn default() -> Self {
        Self {
            use_props: true,
            use_props_events: false,
        }
    }
}

#[derive(Clone)]
struct Prepared {
    object: Arc<dyn ObjectProxy>,
    iface: Arc<dyn InterfaceProxy>,
    props: Option<Arc<dyn PropertiesProxy>>,
    /// The listener forwarding changes from `props` to the helper's own event stream.
    forwarder: Option<ListenerId>,
}

impl Prepared {
    fn detach_forwarder(&self) {
        if let (Some(props), Some(id)) = (&self.props, self.forwarder) {
            props.events().off(id);
        }
    }
}

/// Property, method and signal access for one `(service, path, interface)` triple.
///
/// The helper starts out unprepared. The first operation resolves the object proxy, the
/// interface proxy and (if enabled) the properties proxy; concurrent callers wait for that single
/// preparation instead of starting their own. [`BusHelper::children`] and
/// [`BusHelper::remove_listeners`] drop the prepared state, so the next operation resolves
/// everything again.
pub struct BusHelper {
    bus: Arc<dyn Bus>,
    service: String,
    object: String,
    iface: String,
    options: HelperOptions,
    state: AsyncMutex<Option<Prepared>>,
    events: Emitter<PropertiesChanged>,
}

impl BusHelper {
    pub fn new(
        bus: Arc<dyn Bus>,
        service: impl Into<String>,
        object: impl Into<String>,
        iface: impl Into<String>,
        options: HelperOptions,
    ) -> Self {
        Self {
            bus,
            service: service.into(),
            object: object.into(),
            iface: iface.into(),
            options,
            state: AsyncMutex::new(None),
            events: Emitter::new(),
        }
    }

    /// The object path this helper is bound to.
    pub fn path(&self) -> &str {
        &self.object
    }

    pub fn interface(&self) -> &str {
        &self.iface
    }

    pub fn options(&self) -> HelperOptions {
        self.options
    }

    /// Notifications for the bound interface, republished as received.
    ///
    /// Only fed when the helper was created with [`HelperOptions::use_props_events`]. Forwarding
    /// starts once the helper is prepared, ie. with the first operation after construction or
    /// after [`BusHelper::remove_listeners`].
    pub fn events(&self) -> &Emitter<PropertiesChanged> {
        &self.events
    }

    async fn prepare(&self) -> Result<Prepared> {
        let mut state = self.state.lock().await;
        if let Some(prepared) = &*state {
            return Ok(prepared.clone());
        }

        log::trace!("preparing {} on {}", self.iface, self.object);
        let object = self.bus.object(&self.service, &self.object).await?;
        let iface = object.interface(&self.iface).await?;
        let props = if self.options.use_props {
            Some(object.properties().await?)
        } else {
            None
        };

        let forwarder = match &props {
            Some(props) if self.options.use_props_events => {
                let iface = self.iface.clone();
                let events = self.events.clone();
                Some(props.events().on(move |change: &PropertiesChanged| {
                    if change.interface == iface {
                        events.emit(change);
                    }
                }))
            }
            _ => None,
        };

        let prepared = Prepared {
            object,
            iface,
            props,
            forwarder,
        };
        *state = Some(prepared.clone());
        Ok(prepared)
    }

    async fn reset(&self) {
        if let Some(prepared) = self.state.lock().await.take() {
            prepared.detach_forwarder();
        }
    }

    async fn props_proxy(&self) -> Result<Arc<dyn PropertiesProxy>> {
        if !self.options.use_props {
            return Err(Error::from(ErrorKind::PropsUnavailable));
        }
        self.prepare()
            .await?
            .props
            .ok_or_else(|| Error::from(ErrorKind::PropsUnavailable))
    }

    /// Returns every property of the bound interface, with variant wrappers removed.
    pub async fn props(&self) -> Result<HashMap<String, OwnedValue>> {
        let props = self.props_proxy().await?;
        Ok(normalize(&props.get_all(&self.iface).await?))
    }

    /// Returns a single property of the bound interface.
    pub async fn prop(&self, name: &str) -> Result<OwnedValue> {
        let props = self.props_proxy().await?;
        Ok(unwrap_variant(&props.get(&self.iface, name).await?))
    }

    /// Writes a single property of the bound interface.
    pub async fn set(&self, name: &str, value: TypedValue) -> Result<()> {
        let props = self.props_proxy().await?;
        props.set(&self.iface, name, value.into_value()).await
    }

    /// Lists the path segments of the objects directly below this one.
    ///
    /// The set of exported objects changes over time (eg. during discovery), so this always
    /// resolves a fresh object proxy.
    pub async fn children(&self) -> Result<Vec<String>> {
        self.reset().await;
        let prepared = self.prepare().await?;
        let nodes = prepared.object.nodes().await?;
        Ok(path::children_of(&self.object, nodes.iter().map(String::as_str)))
    }

    /// Calls `method` on the bound interface and returns the raw reply arguments.
    pub async fn call_method(&self, method: &str, args: Vec<OwnedValue>) -> Result<Vec<OwnedValue>> {
        let prepared = self.prepare().await?;
        log::trace!("calling {}.{} on {}", self.iface, method, self.object);
        prepared.iface.call(method, args).await
    }

    /// Starts listening for the next change of property `name` on the bound interface.
    ///
    /// The listener is installed before this returns, so a change that happens between this call
    /// and awaiting the returned [`PropertyWait`] is not lost. Changes to other properties or
    /// other interfaces are ignored.
    pub async fn wait_prop_change(&self, name: &str) -> Result<PropertyWait> {
        let props = self.props_proxy().await?;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let iface = self.iface.clone();
        let name = name.to_owned();
        let id = props.events().on(move |change: &PropertiesChanged| {
            if change.interface != iface {
                return;
            }
            if let Some(value) = change.changed.get(&name) {
                let tx = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(tx) = tx {
                    let _ = tx.send(value.clone());
                }
            }
        });

        Ok(PropertyWait {
            rx,
            props,
            id: Some(id),
        })
    }

    /// Removes every listener on [`BusHelper::events`] and on the underlying properties proxy.
    ///
    /// The helper goes back to the unprepared state; the next operation prepares it again and
    /// installs a fresh forwarding listener.
    pub async fn remove_listeners(&self) {
        self.events.remove_all();
        if let Some(prepared) = self.state.lock().await.take() {
            if let Some(props) = &prepared.props {
                props.events().remove_all();
            }
        }
    }
}

impl fmt::Debug for BusHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusHelper")
            .field("service", &self.service)
            .field("object", &self.object)
            .field("iface", &self.iface)
            .field("options", &self.options)
            .finish()
    }
}

/// A pending property change, returned by [`BusHelper::wait_prop_change`].
///
/// Resolves with the new value. Dropping it removes the underlying listener.
pub struct PropertyWait {
    rx: oneshot::Receiver<OwnedValue>,
    props: Arc<dyn PropertiesProxy>,
    id: Option<ListenerId>,
}

impl PropertyWait {
    fn detach(&mut self) {
        if let Some(id) = self.id.take() {
            self.props.events().off(id);
        }
    }
}

impl Future for PropertyWait {
    type Output = Result<OwnedValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let res = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Ok(value),
            Poll::Ready(Err(oneshot::Canceled)) => Err(Error::from(
                "property listener was removed before a change arrived",
            )),
            Poll::Pending => return Poll::Pending,
        };
        self.detach();
        Poll::Ready(res)
    }
}

impl Drop for PropertyWait {
    fn drop(&mut self) {
        self.detach();
    }
}
