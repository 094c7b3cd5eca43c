//! BlueZ [`Device`] access.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    address::AddressType,
    bus::{Bus, PropertiesChanged},
    event::{Emitter, EventStream, ListenerId},
    gatt::GattServer,
    helper::{BusHelper, HelperOptions},
    uuid::Uuid,
    value::{decode, decode_buffers},
    Error, Result, SERVICE,
};

pub(crate) const INTERFACE: &str = "org.bluez.Device1";

/// The connection state reported with a [`DeviceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
}

/// Connection changes of a [`Device`], as reported by BlueZ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device's `Connected` property became `true`.
    Connect(ConnectionState),
    /// The device's `Connected` property became `false`.
    Disconnect(ConnectionState),
}

impl DeviceEvent {
    fn from_connected(connected: bool) -> Self {
        let state = ConnectionState { connected };
        if connected {
            Self::Connect(state)
        } else {
            Self::Disconnect(state)
        }
    }
}

/// A reference to a remote BlueZ device.
///
/// Instances of this type can be obtained from [`Adapter::get_device`] or
/// [`Adapter::wait_device`].
///
/// [`Adapter::get_device`]: crate::Adapter::get_device
/// [`Adapter::wait_device`]: crate::Adapter::wait_device
#[derive(Clone)]
pub struct Device {
    bus: Arc<dyn Bus>,
    helper: Arc<BusHelper>,
    events: Emitter<DeviceEvent>,
    /// The listener translating `Connected` changes into [`DeviceEvent`]s, while connected.
    watcher: Arc<Mutex<Option<ListenerId>>>,
}

impl Device {
    pub(crate) fn new(bus: Arc<dyn Bus>, adapter: &str, id: &str) -> Self {
        let helper = BusHelper::new(
            bus.clone(),
            SERVICE,
            format!("/org/bluez/{}/{}", adapter, id),
            INTERFACE,
            HelperOptions {
                use_props: true,
                use_props_events: true,
            },
        );
        Self {
            bus,
            helper: Arc::new(helper),
            events: Emitter::new(),
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the object path of the device.
    pub fn path(&self) -> &str {
        self.helper.path()
    }

    /// Returns the remote device's name.
    pub async fn name(&self) -> Result<String> {
        decode(self.helper.prop("Name").await?)
    }

    /// Returns the hardware address of the device.
    pub async fn address(&self) -> Result<String> {
        decode(self.helper.prop("Address").await?)
    }

    /// Returns the raw address type (`public` or `random`).
    pub async fn address_type_str(&self) -> Result<String> {
        decode(self.helper.prop("AddressType").await?)
    }

    /// Returns the type of the device's hardware address returned by [`Device::address`].
    pub async fn address_type(&self) -> Result<AddressType> {
        AddressType::from_str(&self.address_type_str().await?)
    }

    /// Returns the user-friendly name assigned to the device.
    pub async fn alias(&self) -> Result<String> {
        decode(self.helper.prop("Alias").await?)
    }

    /// Returns the Received Signal Strength Indicator (RSSI) of the remote device.
    ///
    /// Only available while the device is being discovered.
    pub async fn rssi(&self) -> Result<i16> {
        decode(self.helper.prop("RSSI").await?)
    }

    /// Returns the advertised transmit power level.
    pub async fn tx_power(&self) -> Result<i16> {
        decode(self.helper.prop("TxPower").await?)
    }

    /// Returns the advertised manufacturer specific data, keyed by company identifier.
    pub async fn manufacturer_data(&self) -> Result<HashMap<u16, Vec<u8>>> {
        decode_buffers(self.helper.prop("ManufacturerData").await?)
    }

    /// Returns the raw advertising data, keyed by AD type.
    pub async fn advertising_data(&self) -> Result<HashMap<u8, Vec<u8>>> {
        decode_buffers(self.helper.prop("AdvertisingData").await?)
    }

    /// Returns the advertised service data, keyed by service UUID.
    pub async fn service_data(&self) -> Result<HashMap<String, Vec<u8>>> {
        decode_buffers(self.helper.prop("ServiceData").await?)
    }

    /// Returns the list of service [`Uuid`]s the device is advertising.
    ///
    /// This list is available without performing full service discovery or connecting to the
    /// device, but is typically truncated unless connected to or paired with the [`Device`].
    pub async fn service_uuids(&self) -> Result<Vec<Uuid>> {
        let uuids: Vec<String> = decode(self.helper.prop("UUIDs").await?)?;
        uuids
            .iter()
            .map(|s| s.parse().map_err(Error::from))
            .collect()
    }

    pub async fn is_paired(&self) -> Result<bool> {
        decode(self.helper.prop("Paired").await?)
    }

    pub async fn is_connected(&self) -> Result<bool> {
        decode(self.helper.prop("Connected").await?)
    }

    /// Initiates pairing with the device.
    pub async fn pair(&self) -> Result<()> {
        self.helper.call_method("Pair", Vec::new()).await?;
        Ok(())
    }

    /// Cancels a pairing operation started with [`Device::pair`].
    pub async fn cancel_pair(&self) -> Result<()> {
        self.helper.call_method("CancelPair", Vec::new()).await?;
        Ok(())
    }

    fn watcher(&self) -> std::sync::MutexGuard<'_, Option<ListenerId>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects to the device.
    ///
    /// From now on until [`Device::disconnect`], every change of the device's `Connected`
    /// property is reported as a [`DeviceEvent`] (see [`Device::on_connection_change`]). This
    /// includes disconnects initiated by the remote device.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut watcher = self.watcher();
            if watcher.is_none() {
                let events = self.events.clone();
                let path = self.path().to_string();
                *watcher = Some(self.helper.events().on(move |change: &PropertiesChanged| {
                    let Some(value) = change.changed.get("Connected") else {
                        return;
                    };
                    match decode::<bool>(value.clone()) {
                        Ok(connected) => {
                            log::debug!("{}: connected = {}", path, connected);
                            events.emit(&DeviceEvent::from_connected(connected));
                        }
                        Err(e) => log::warn!("{}: malformed `Connected` value: {}", path, e),
                    }
                }));
            }
        }

        if let Err(e) = self.helper.call_method("Connect", Vec::new()).await {
            self.detach_watcher();
            return Err(e);
        }
        Ok(())
    }

    fn detach_watcher(&self) {
        if let Some(id) = self.watcher().take() {
            self.helper.events().off(id);
        }
    }

    /// Disconnects from the device and stops reporting connection changes.
    ///
    /// Listeners registered through [`Device::on_connection_change`] stay registered and will see
    /// events again after the next [`Device::connect`].
    pub async fn disconnect(&self) -> Result<()> {
        self.helper.call_method("Disconnect", Vec::new()).await?;
        self.helper.remove_listeners().await;
        self.watcher().take();
        Ok(())
    }

    /// Registers a callback for connection changes reported while connected.
    pub fn on_connection_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    /// Removes a callback registered with [`Device::on_connection_change`].
    pub fn off_connection_change(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Returns a stream of connection changes reported while connected.
    pub fn events(&self) -> EventStream<DeviceEvent> {
        self.events.stream()
    }

    /// Returns the GATT server of this (connected) device, with all of its services and
    /// characteristics resolved.
    ///
    /// Waits for BlueZ to finish service discovery if necessary, which can take a while after
    /// [`Device::connect`].
    pub async fn gatt(&self) -> Result<GattServer> {
        let server = GattServer::new(self.bus.clone(), self.path());
        server.init().await?;
        Ok(server)
    }

    /// Returns a human-readable description like `"<name> [<address>]"`.
    pub async fn describe(&self) -> Result<String> {
        let name = self.name().await?;
        let address = self.address().await?;
        Ok(format!("{} [{}]", name, address))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.helper.path())
            .finish()
    }
}
