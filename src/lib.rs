//! BlueZ D-Bus bindings.
//!
//! Start with a [`Session`], which owns the bus connection, and walk down from the
//! [`Bluetooth`] root handle: [`Adapter`] → [`Device`] → [`GattServer`] → [`GattService`] →
//! [`GattCharacteristic`].
//!
//! [`Device`]: device::Device
//! [`GattServer`]: gatt::GattServer
//! [`GattService`]: gatt::GattService
//! [`GattCharacteristic`]: gatt::GattCharacteristic

mod adapter;
pub mod address;
pub mod bus;
pub mod device;
mod error;
pub mod event;
pub mod gatt;
pub mod helper;
pub mod path;
pub mod uuid;
pub mod value;

#[cfg(test)]
mod mock;

pub use adapter::{Adapter, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};
pub use error::{Error, ErrorKind, Result};

use std::{fmt, sync::Arc};

use bus::{Bus, ZbusBus};
use helper::{BusHelper, HelperOptions};

/// Well-known bus name of the BlueZ daemon.
pub(crate) const SERVICE: &str = "org.bluez";

/// A cloneable handle to the bus connection.
///
/// Every handle obtained through a [`Session`] shares its connection. The connection stays open
/// until [`Session::destroy`] is called.
#[derive(Clone)]
pub struct Session {
    bus: Arc<dyn Bus>,
}

impl Session {
    /// Connects to the system bus.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_bus(Arc::new(ZbusBus::system().await?)))
    }

    /// Creates a session on top of an existing [`Bus`] implementation.
    pub fn with_bus(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Returns the root handle for enumerating adapters.
    pub fn bluetooth(&self) -> Bluetooth {
        Bluetooth::new(self.bus.clone())
    }

    /// Closes the bus connection.
    ///
    /// Every handle created from this session fails with a bus error afterwards, including
    /// handles that were already in use.
    pub async fn destroy(self) -> Result<()> {
        log::debug!("destroying session");
        self.bus.close().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

/// The root of the BlueZ object tree, used to look up [`Adapter`]s.
pub struct Bluetooth {
    bus: Arc<dyn Bus>,
    helper: BusHelper,
}

impl Bluetooth {
    fn new(bus: Arc<dyn Bus>) -> Self {
        let helper = BusHelper::new(
            bus.clone(),
            SERVICE,
            "/org/bluez",
            "org.bluez.AgentManager1",
            HelperOptions {
                use_props: false,
                use_props_events: false,
            },
        );
        Self { bus, helper }
    }

    /// Returns the names of all adapters on the system (eg. `hci0`).
    pub async fn adapters(&self) -> Result<Vec<String>> {
        self.helper.children().await
    }

    /// Returns the first adapter.
    ///
    /// Fails with [`ErrorKind::NoAdaptersFound`] if the system has none.
    pub async fn default_adapter(&self) -> Result<Adapter> {
        match self.adapters().await?.first() {
            Some(name) => Ok(Adapter::new(self.bus.clone(), name)),
            None => Err(Error::from(ErrorKind::NoAdaptersFound)),
        }
    }

    /// Returns the adapter called `name`.
    ///
    /// Fails with [`ErrorKind::AdapterNotFound`] if there is no such adapter.
    pub async fn get_adapter(&self, name: &str) -> Result<Adapter> {
        if !self.adapters().await?.iter().any(|a| a == name) {
            return Err(Error::from(ErrorKind::AdapterNotFound));
        }
        Ok(Adapter::new(self.bus.clone(), name))
    }

    /// Returns all adapters that are powered on.
    ///
    /// Adapters whose state cannot be queried are skipped.
    pub async fn active_adapters(&self) -> Result<Vec<Adapter>> {
        let mut active = Vec::new();
        for name in self.adapters().await? {
            let adapter = Adapter::new(self.bus.clone(), &name);
            match adapter.is_powered().await {
                Ok(true) => active.push(adapter),
                Ok(false) => {}
                Err(e) => log::warn!("skipping adapter {}: {}", name, e),
            }
        }
        Ok(active)
    }
}

impl fmt::Debug for Bluetooth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bluetooth")
            .field("path", &self.helper.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::Value;

    use super::*;
    use crate::mock::MockBus;

    const ADAPTER: &str = "org.bluez.Adapter1";

    fn session(bus: &MockBus) -> Session {
        Session::with_bus(bus.handle())
    }

    #[pollster::test]
    async fn adapters() {
        let bus = MockBus::new();
        bus.set_nodes(&[
            "/org/bluez",
            "/org/bluez/hci0",
            "/org/bluez/hci0/dev_11_11_11_11_11_11",
            "/org/bluez/hci1",
        ]);
        let bluetooth = session(&bus).bluetooth();

        assert_eq!(bluetooth.adapters().await.unwrap(), ["hci0", "hci1"]);
        assert_eq!(
            bluetooth.default_adapter().await.unwrap().device_name(),
            "hci0"
        );
        assert_eq!(
            bluetooth.get_adapter("hci1").await.unwrap().path(),
            "/org/bluez/hci1"
        );
        let err = bluetooth.get_adapter("hci2").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AdapterNotFound));

        // Enumeration never touches the properties interface.
        assert_eq!(bus.property_proxies("/org/bluez"), 0);
    }

    #[pollster::test]
    async fn no_adapters() {
        let bus = MockBus::new();
        bus.set_nodes(&["/org/bluez"]);
        let bluetooth = session(&bus).bluetooth();

        assert!(bluetooth.adapters().await.unwrap().is_empty());
        let err = bluetooth.default_adapter().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NoAdaptersFound));
    }

    #[pollster::test]
    async fn active_adapters() {
        let bus = MockBus::new();
        bus.set_nodes(&[
            "/org/bluez",
            "/org/bluez/hci0",
            "/org/bluez/hci1",
            "/org/bluez/hci2",
        ]);
        bus.set_prop("/org/bluez/hci0", ADAPTER, "Powered", Value::from(false));
        bus.set_prop("/org/bluez/hci1", ADAPTER, "Powered", Value::from(true));
        // hci2 has no properties and is skipped.
        let bluetooth = session(&bus).bluetooth();

        let active = bluetooth.active_adapters().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_name(), "hci1");
    }

    #[pollster::test]
    async fn destroy_closes_the_bus() {
        let bus = MockBus::new();
        bus.set_nodes(&["/org/bluez", "/org/bluez/hci0"]);
        let session = session(&bus);
        let bluetooth = session.bluetooth();

        session.destroy().await.unwrap();
        assert!(bus.is_closed());
        bluetooth.adapters().await.unwrap_err();
    }

    #[pollster::test]
    async fn destroy_fails_handles_in_use() {
        let bus = MockBus::new();
        bus.set_nodes(&["/org/bluez", "/org/bluez/hci0"]);
        bus.set_prop("/org/bluez/hci0", ADAPTER, "Powered", Value::from(true));
        bus.set_prop("/org/bluez/hci0", ADAPTER, "Discovering", Value::from(false));
        let session = session(&bus);
        let adapter = session.bluetooth().get_adapter("hci0").await.unwrap();
        assert!(adapter.is_powered().await.unwrap());

        session.destroy().await.unwrap();
        adapter.is_powered().await.unwrap_err();
        adapter.start_discovery().await.unwrap_err();
        assert!(bus.method_calls().is_empty());
    }
}
