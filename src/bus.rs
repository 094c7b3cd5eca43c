//! The bus transport that every proxy talks through.
//!
//! The remote daemon is reached through a small set of object-safe traits, mirroring how a D-Bus
//! client sees the world: an [`ObjectProxy`] per object path, an [`InterfaceProxy`] for method
//! calls on one of its interfaces, and a [`PropertiesProxy`] for the standard
//! `org.freedesktop.DBus.Properties` interface and its `PropertiesChanged` signal.
//!
//! [`ZbusBus`] implements them on top of a [`zbus::Connection`].

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use zbus::{
    fdo,
    names::InterfaceName,
    zvariant::{OwnedValue, Structure, StructureBuilder, Value},
    Connection, Task,
};

use crate::{event::Emitter, Error, Result};

/// A `PropertiesChanged` notification received from the bus.
///
/// Values are kept exactly as received; their D-Bus signature is still available through
/// [`Value::value_signature`].
#[derive(Debug, Clone, PartialEq)]
pub struct PropertiesChanged {
    /// The interface whose properties changed.
    pub interface: String,
    pub changed: HashMap<String, OwnedValue>,
    pub invalidated: Vec<String>,
}

/// A connection to the bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Resolves the remote object at `path` exported by `service`.
    async fn object(&self, service: &str, path: &str) -> Result<Arc<dyn ObjectProxy>>;

    /// Closes the connection.
    ///
    /// Subsequent calls to [`Bus::object`] fail, and so does every proxy obtained from this bus
    /// before it was closed.
    async fn close(&self) -> Result<()>;
}

/// A resolved remote object.
#[async_trait]
pub trait ObjectProxy: Send + Sync {
    /// The flat list of every object path the service currently exports.
    async fn nodes(&self) -> Result<Vec<String>>;

    /// Returns a proxy for calling methods of the interface `name` on this object.
    async fn interface(&self, name: &str) -> Result<Arc<dyn InterfaceProxy>>;

    /// Returns a proxy for the standard properties interface of this object.
    ///
    /// Once this returns, `PropertiesChanged` notifications are delivered to
    /// [`PropertiesProxy::events`].
    async fn properties(&self) -> Result<Arc<dyn PropertiesProxy>>;
}

/// Method calls on one interface of a remote object.
#[async_trait]
pub trait InterfaceProxy: Send + Sync {
    /// Invokes `method` with one value per D-Bus argument and returns the reply arguments as-is.
    async fn call(&self, method: &str, args: Vec<OwnedValue>) -> Result<Vec<OwnedValue>>;
}

/// The `org.freedesktop.DBus.Properties` interface of a remote object.
#[async_trait]
pub trait PropertiesProxy: Send + Sync {
    async fn get(&self, interface: &str, name: &str) -> Result<OwnedValue>;

    async fn get_all(&self, interface: &str) -> Result<HashMap<String, OwnedValue>>;

    async fn set(&self, interface: &str, name: &str, value: OwnedValue) -> Result<()>;

    /// Listeners for the `PropertiesChanged` signal of this object, for all interfaces.
    ///
    /// Notifications are delivered in the order the bus delivers them.
    fn events(&self) -> &Emitter<PropertiesChanged>;
}

/// The connection slot shared by a [`ZbusBus`] and every proxy it hands out.
///
/// Proxies keep their own clone of the [`Connection`], so closing empties the slot and every
/// operation checks it first.
#[derive(Clone)]
struct Link(Arc<RwLock<Option<Connection>>>);

impl Link {
    fn conn(&self) -> Result<Connection> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::from("bus connection closed"))
    }

    fn ensure_open(&self) -> Result<()> {
        self.conn().map(drop)
    }

    fn is_open(&self) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take(&self) -> Option<Connection> {
        self.0.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A [`Bus`] backed by a [`zbus::Connection`].
pub struct ZbusBus {
    link: Link,
}

impl ZbusBus {
    /// Connects to the system bus, where BlueZ lives.
    pub async fn system() -> Result<Self> {
        Ok(Self::new(Connection::system().await.map_err(Error::from)?))
    }

    pub fn new(conn: Connection) -> Self {
        Self {
            link: Link(Arc::new(RwLock::new(Some(conn)))),
        }
    }
}

#[async_trait]
impl Bus for ZbusBus {
    async fn object(&self, service: &str, path: &str) -> Result<Arc<dyn ObjectProxy>> {
        self.link.ensure_open()?;
        Ok(Arc::new(ZbusObject {
            link: self.link.clone(),
            service: service.to_owned(),
            path: path.to_owned(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.link.take() {
            log::debug!("closing bus connection {}", conn.server_guid());
        }
        Ok(())
    }
}

struct ZbusObject {
    link: Link,
    service: String,
    path: String,
}

#[async_trait]
impl ObjectProxy for ZbusObject {
    async fn nodes(&self) -> Result<Vec<String>> {
        let conn = self.link.conn()?;

        // BlueZ exports everything through the object manager at `/`, which gives us the flat
        // list of live paths in one round trip.
        let manager = fdo::ObjectManagerProxy::builder(&conn)
            .destination(self.service.clone())
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        let nodes = objects
            .keys()
            .map(|path| path.as_str().to_owned())
            .collect::<Vec<_>>();
        log::trace!("{} exports {} objects", self.service, nodes.len());
        Ok(nodes)
    }

    async fn interface(&self, name: &str) -> Result<Arc<dyn InterfaceProxy>> {
        let conn = self.link.conn()?;
        let proxy = zbus::Proxy::new(
            &conn,
            self.service.clone(),
            self.path.clone(),
            name.to_owned(),
        )
        .await
        .map_err(Error::from)?;
        Ok(Arc::new(ZbusInterface {
            link: self.link.clone(),
            proxy,
        }))
    }

    async fn properties(&self) -> Result<Arc<dyn PropertiesProxy>> {
        let conn = self.link.conn()?;
        let proxy = fdo::PropertiesProxy::builder(&conn)
            .destination(self.service.clone())
            .map_err(Error::from)?
            .path(self.path.clone())
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;

        // Subscribe before returning so that no change is missed by a caller that registers a
        // listener right after.
        let mut stream = proxy
            .receive_properties_changed()
            .await
            .map_err(Error::from)?;
        let events = Emitter::new();
        let sink = events.clone();
        let link = self.link.clone();
        let path = self.path.clone();
        let pump = conn.executor().spawn(
            async move {
                while let Some(signal) = stream.next().await {
                    if !link.is_open() {
                        break;
                    }
                    match signal.args() {
                        Ok(args) => {
                            let change = PropertiesChanged {
                                interface: args.interface_name.to_string(),
                                changed: args
                                    .changed_properties
                                    .iter()
                                    .map(|(name, value)| {
                                        (name.to_string(), OwnedValue::from(value.clone()))
                                    })
                                    .collect(),
                                invalidated: args
                                    .invalidated_properties
                                    .iter()
                                    .map(|name| name.to_string())
                                    .collect(),
                            };
                            log::trace!(
                                "{}: {} changed {:?}",
                                path,
                                change.interface,
                                change.changed.keys()
                            );
                            sink.emit(&change);
                        }
                        Err(e) => log::warn!("malformed PropertiesChanged on {}: {}", path, e),
                    }
                }
                log::debug!("property change stream of {} ended", path);
            },
            "bluebus::properties",
        );

        Ok(Arc::new(ZbusProperties {
            link: self.link.clone(),
            proxy,
            events,
            _pump: pump,
        }))
    }
}

struct ZbusInterface {
    link: Link,
    proxy: zbus::Proxy<'static>,
}

#[async_trait]
impl InterfaceProxy for ZbusInterface {
    async fn call(&self, method: &str, args: Vec<OwnedValue>) -> Result<Vec<OwnedValue>> {
        self.link.ensure_open()?;
        let reply = if args.is_empty() {
            self.proxy.call_method(method, &()).await
        } else {
            let body = args
                .iter()
                .fold(StructureBuilder::new(), |body, arg| {
                    body.append_field(Value::clone(arg))
                })
                .build();
            self.proxy.call_method(method, &body).await
        }
        .map_err(Error::from)?;

        // Methods without return values reply with no body at all.
        match reply.body_signature() {
            Ok(signature) if !signature.as_str().is_empty() => {}
            Ok(_) | Err(zbus::Error::NoBodySignature) => return Ok(Vec::new()),
            Err(e) => return Err(Error::from(e)),
        }
        let body = reply.body::<Structure<'_>>().map_err(Error::from)?;
        Ok(body
            .fields()
            .iter()
            .map(|field| OwnedValue::from(field.clone()))
            .collect())
    }
}

struct ZbusProperties {
    link: Link,
    proxy: fdo::PropertiesProxy<'static>,
    events: Emitter<PropertiesChanged>,
    _pump: Task<()>,
}

fn interface_name(name: &str) -> Result<InterfaceName<'_>> {
    InterfaceName::try_from(name).map_err(Error::from)
}

#[async_trait]
impl PropertiesProxy for ZbusProperties {
    async fn get(&self, interface: &str, name: &str) -> Result<OwnedValue> {
        self.link.ensure_open()?;
        self.proxy
            .get(interface_name(interface)?, name)
            .await
            .map_err(Error::from)
    }

    async fn get_all(&self, interface: &str) -> Result<HashMap<String, OwnedValue>> {
        self.link.ensure_open()?;
        self.proxy
            .get_all(interface_name(interface)?)
            .await
            .map_err(Error::from)
    }

    async fn set(&self, interface: &str, name: &str, value: OwnedValue) -> Result<()> {
        self.link.ensure_open()?;
        self.proxy
            .set(interface_name(interface)?, name, &value)
            .await
            .map_err(Error::from)
    }

    fn events(&self) -> &Emitter<PropertiesChanged> {
        &self.events
    }
}

#[cfg(all(test, unix, not(feature = "tokio")))]
mod tests {
    use std::{os::unix::net::UnixStream, sync::Mutex};

    use futures_util::future::try_join;
    use zbus::{dbus_interface, zvariant::OwnedObjectPath, ConnectionBuilder, Guid, SignalContext};

    use super::*;
    use crate::{
        value::{decode, dict_arg, TypedValue},
        Session,
    };

    const SERVICE: &str = "org.bluez";
    const ADAPTER: &str = "/org/bluez/hci0";
    const CHARACTERISTIC: &str = "/org/bluez/hci0/dev_11_11_11_11_11_11/service0001/char0002";
    const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
    const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

    /// Method calls received by the fake daemon, in order.
    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeManager {
        log: Log,
    }

    #[dbus_interface(name = "org.freedesktop.DBus.ObjectManager")]
    impl FakeManager {
        fn get_managed_objects(&self) -> fdo::ManagedObjects {
            self.log.lock().unwrap().push("GetManagedObjects".into());
            [ADAPTER, CHARACTERISTIC]
                .into_iter()
                .map(|path| (OwnedObjectPath::try_from(path).unwrap(), HashMap::new()))
                .collect()
        }
    }

    struct FakeAdapter {
        discovering: bool,
        log: Log,
    }

    #[dbus_interface(name = "org.bluez.Adapter1")]
    impl FakeAdapter {
        fn set_discovery_filter(&self, filter: HashMap<String, OwnedValue>) {
            let transport = filter
                .get("Transport")
                .and_then(|v| decode::<String>(v.clone()).ok())
                .unwrap_or_default();
            self.log
                .lock()
                .unwrap()
                .push(format!("SetDiscoveryFilter Transport={}", transport));
        }

        fn start_discovery(&mut self) {
            self.log.lock().unwrap().push("StartDiscovery".into());
            self.discovering = true;
        }

        fn stop_discovery(&mut self) {
            self.log.lock().unwrap().push("StopDiscovery".into());
            self.discovering = false;
        }

        #[dbus_interface(property)]
        fn discovering(&self) -> bool {
            self.discovering
        }
    }

    struct FakeCharacteristic {
        value: Vec<u8>,
    }

    #[dbus_interface(name = "org.bluez.GattCharacteristic1")]
    impl FakeCharacteristic {
        fn read_value(&self, options: HashMap<String, OwnedValue>) -> Vec<u8> {
            let offset = options
                .get("offset")
                .and_then(|v| decode::<u16>(v.clone()).ok())
                .unwrap_or(0);
            self.value
                .get(usize::from(offset)..)
                .unwrap_or_default()
                .to_vec()
        }

        fn write_value(&mut self, value: Vec<u8>, _options: HashMap<String, OwnedValue>) {
            self.value = value;
        }

        async fn start_notify(
            &mut self,
            #[zbus(signal_context)] ctxt: SignalContext<'_>,
        ) -> fdo::Result<()> {
            self.value = vec![7];
            self.value_changed(&ctxt).await?;
            Ok(())
        }

        #[dbus_interface(property)]
        fn value(&self) -> Vec<u8> {
            self.value.clone()
        }
    }

    /// Connects a [`ZbusBus`] to a fake daemon over a socket pair.
    ///
    /// The daemon's end of the connection is returned as well and must be kept alive.
    async fn connect(log: &Log) -> (Connection, ZbusBus) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (daemon, client) = UnixStream::pair().unwrap();
        let guid = Guid::generate();
        let daemon = ConnectionBuilder::unix_stream(daemon)
            .server(&guid)
            .p2p()
            .serve_at("/", FakeManager { log: log.clone() })
            .unwrap()
            .serve_at(
                ADAPTER,
                FakeAdapter {
                    discovering: false,
                    log: log.clone(),
                },
            )
            .unwrap()
            .serve_at(
                CHARACTERISTIC,
                FakeCharacteristic {
                    value: b"bar".to_vec(),
                },
            )
            .unwrap()
            .build();
        let client = ConnectionBuilder::unix_stream(client).p2p().build();
        let (daemon, client) = try_join(daemon, client).await.unwrap();
        (daemon, ZbusBus::new(client))
    }

    #[pollster::test]
    async fn discovery_round_trip() {
        let log = Log::default();
        let (_daemon, bus) = connect(&log).await;
        let session = Session::with_bus(Arc::new(bus));

        let adapter = session.bluetooth().get_adapter("hci0").await.unwrap();
        adapter.start_discovery().await.unwrap();
        assert!(adapter.is_discovering().await.unwrap());
        adapter.stop_discovery().await.unwrap();
        assert!(!adapter.is_discovering().await.unwrap());

        // Only the adapter lookup lists the exported objects; preparing the adapter itself
        // does not.
        assert_eq!(
            *log.lock().unwrap(),
            [
                "GetManagedObjects",
                "SetDiscoveryFilter Transport=le",
                "StartDiscovery",
                "StopDiscovery",
            ]
        );
    }

    #[pollster::test]
    async fn nodes_are_listed_on_demand() {
        let log = Log::default();
        let (_daemon, bus) = connect(&log).await;

        let object = bus.object(SERVICE, ADAPTER).await.unwrap();
        object.interface(ADAPTER_INTERFACE).await.unwrap();
        object.properties().await.unwrap();
        assert!(log.lock().unwrap().is_empty());

        let mut nodes = object.nodes().await.unwrap();
        nodes.sort();
        assert_eq!(nodes, [ADAPTER, CHARACTERISTIC]);
        object.nodes().await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["GetManagedObjects", "GetManagedObjects"]);
    }

    #[pollster::test]
    async fn byte_replies_and_value_changes() {
        let log = Log::default();
        let (_daemon, bus) = connect(&log).await;
        let object = bus.object(SERVICE, CHARACTERISTIC).await.unwrap();
        let iface = object.interface(CHARACTERISTIC_INTERFACE).await.unwrap();
        let props = object.properties().await.unwrap();

        let reply = iface
            .call(
                "ReadValue",
                vec![dict_arg([("offset", TypedValue::uint16(1))])],
            )
            .await
            .unwrap();
        assert_eq!(reply.len(), 1);
        assert_eq!(decode::<Vec<u8>>(reply[0].clone()).unwrap(), b"ar");

        let reply = iface
            .call(
                "WriteValue",
                vec![
                    OwnedValue::from(Value::from(vec![1u8, 2])),
                    dict_arg([("type", TypedValue::string("request"))]),
                ],
            )
            .await
            .unwrap();
        assert!(reply.is_empty());
        let value = props.get(CHARACTERISTIC_INTERFACE, "Value").await.unwrap();
        assert_eq!(decode::<Vec<u8>>(value).unwrap(), [1, 2]);

        let mut changes = props.events().stream();
        assert!(iface.call("StartNotify", Vec::new()).await.unwrap().is_empty());
        let change = changes.next().await.unwrap();
        assert_eq!(change.interface, CHARACTERISTIC_INTERFACE);
        assert_eq!(
            decode::<Vec<u8>>(change.changed["Value"].clone()).unwrap(),
            [7]
        );
    }

    #[pollster::test]
    async fn close_fails_prepared_proxies() {
        let log = Log::default();
        let (_daemon, bus) = connect(&log).await;
        let object = bus.object(SERVICE, ADAPTER).await.unwrap();
        let iface = object.interface(ADAPTER_INTERFACE).await.unwrap();
        let props = object.properties().await.unwrap();
        assert!(iface.call("StartDiscovery", Vec::new()).await.unwrap().is_empty());

        bus.close().await.unwrap();
        iface.call("StopDiscovery", Vec::new()).await.unwrap_err();
        props.get(ADAPTER_INTERFACE, "Discovering").await.unwrap_err();
        props.get_all(ADAPTER_INTERFACE).await.unwrap_err();
        object.nodes().await.unwrap_err();
        assert!(object.properties().await.is_err());
        assert!(bus.object(SERVICE, ADAPTER).await.is_err());

        assert_eq!(*log.lock().unwrap(), ["StartDiscovery"]);
    }
}
