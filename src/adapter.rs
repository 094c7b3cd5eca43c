use std::{fmt, pin::pin, sync::Arc, time::Duration};

use futures_timer::Delay;
use futures_util::future::{select, Either};

use crate::{
    address::{decode_device_id, encode_device_id, AddressType},
    bus::Bus,
    device::Device,
    error::ErrorKind,
    helper::{BusHelper, HelperOptions},
    value::{decode, dict_arg, TypedValue},
    Error, Result, SERVICE,
};

/// Default time [`Adapter::wait_device`] waits for a device to show up.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval at which [`Adapter::wait_device`] checks for the device.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const INTERFACE: &str = "org.bluez.Adapter1";

/// A BlueZ Bluetooth adapter (the local radio, eg. `hci0`).
///
/// Obtained from [`Bluetooth::get_adapter`][crate::Bluetooth::get_adapter] or
/// [`Bluetooth::default_adapter`][crate::Bluetooth::default_adapter].
#[derive(Clone)]
pub struct Adapter {
    bus: Arc<dyn Bus>,
    name: String,
    helper: Arc<BusHelper>,
}

impl Adapter {
    const PATH_PREFIX: &'static str = "/org/bluez/";

    pub(crate) fn new(bus: Arc<dyn Bus>, name: &str) -> Self {
        let helper = BusHelper::new(
            bus.clone(),
            SERVICE,
            format!("{}{}", Self::PATH_PREFIX, name),
            INTERFACE,
            HelperOptions::default(),
        );
        Self {
            bus,
            name: name.to_string(),
            helper: Arc::new(helper),
        }
    }

    /// Returns the adapter's device name (eg. `hci0`).
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Returns the object path of the adapter.
    pub fn path(&self) -> &str {
        self.helper.path()
    }

    /// Returns the Bluetooth device address of this [`Adapter`].
    pub async fn address(&self) -> Result<String> {
        decode(self.helper.prop("Address").await?)
    }

    /// Returns the raw address type (`public` or `random`).
    pub async fn address_type_str(&self) -> Result<String> {
        decode(self.helper.prop("AddressType").await?)
    }

    /// Returns the type of device address used by this [`Adapter`].
    pub async fn address_type(&self) -> Result<AddressType> {
        AddressType::from_str(&self.address_type_str().await?)
    }

    /// Returns the Bluetooth system name.
    pub async fn name(&self) -> Result<String> {
        decode(self.helper.prop("Name").await?)
    }

    /// Returns the user-friendly name of the adapter.
    pub async fn alias(&self) -> Result<String> {
        decode(self.helper.prop("Alias").await?)
    }

    pub async fn is_powered(&self) -> Result<bool> {
        decode(self.helper.prop("Powered").await?)
    }

    /// Returns whether this [`Adapter`] is currently performing device discovery.
    pub async fn is_discovering(&self) -> Result<bool> {
        decode(self.helper.prop("Discovering").await?)
    }

    /// Starts discovering Bluetooth LE devices.
    ///
    /// Fails with [`ErrorKind::AlreadyDiscovering`] if discovery is already running, without
    /// touching the discovery filter.
    pub async fn start_discovery(&self) -> Result<()> {
        if self.is_discovering().await? {
            return Err(Error::from(ErrorKind::AlreadyDiscovering));
        }

        let filter = dict_arg([("Transport", TypedValue::string("le"))]);
        self.helper
            .call_method("SetDiscoveryFilter", vec![filter])
            .await?;
        self.helper.call_method("StartDiscovery", Vec::new()).await?;
        log::debug!("{}: discovery started", self.name);
        Ok(())
    }

    /// Stops device discovery.
    ///
    /// Fails with [`ErrorKind::NotDiscovering`] if no discovery is running.
    pub async fn stop_discovery(&self) -> Result<()> {
        if !self.is_discovering().await? {
            return Err(Error::from(ErrorKind::NotDiscovering));
        }
        self.helper.call_method("StopDiscovery", Vec::new()).await?;
        log::debug!("{}: discovery stopped", self.name);
        Ok(())
    }

    /// Returns the addresses of all devices currently known to this [`Adapter`].
    pub async fn devices(&self) -> Result<Vec<String>> {
        Ok(self
            .helper
            .children()
            .await?
            .iter()
            .map(|id| decode_device_id(id))
            .collect())
    }

    /// Returns the [`Device`] with the given hardware address.
    ///
    /// Fails with [`ErrorKind::DeviceNotFound`] if the adapter does not know the device (yet).
    pub async fn get_device(&self, address: &str) -> Result<Device> {
        let id = encode_device_id(address);
        let children = self.helper.children().await?;
        if !children.contains(&id) {
            return Err(Error::from(ErrorKind::DeviceNotFound));
        }
        Ok(Device::new(self.bus.clone(), &self.name, &id))
    }

    /// Waits until the device with the given address is known to the adapter, using
    /// [`DEFAULT_WAIT_TIMEOUT`] and [`DEFAULT_POLL_INTERVAL`].
    pub async fn wait_device(&self, address: &str) -> Result<Device> {
        self.wait_device_with(address, DEFAULT_WAIT_TIMEOUT, DEFAULT_POLL_INTERVAL)
            .await
    }

    /// Waits until the device with the given address is known to the adapter.
    ///
    /// The adapter is checked every `poll_interval`. Fails with
    /// [`ErrorKind::OperationTimedOut`] once `timeout` elapses. Errors other than
    /// [`ErrorKind::DeviceNotFound`] abort the wait.
    ///
    /// Device discovery has to be running (see [`Adapter::start_discovery`]) for new devices to
    /// appear.
    pub async fn wait_device_with(
        &self,
        address: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Device> {
        log::debug!("{}: waiting up to {:?} for {}", self.name, timeout, address);

        let lookup = pin!(async {
            loop {
                Delay::new(poll_interval).await;
                match self.get_device(address).await {
                    Ok(device) => return Ok(device),
                    Err(e) if e.is(&ErrorKind::DeviceNotFound) => {
                        log::trace!("{} not found yet", address);
                    }
                    Err(e) => return Err(e),
                }
            }
        });
        let deadline = pin!(Delay::new(timeout));

        // Whichever side loses is dropped here, which cancels its timer.
        match select(lookup, deadline).await {
            Either::Left((res, _)) => res,
            Either::Right(((), _)) => {
                log::debug!("{}: gave up waiting for {}", self.name, address);
                Err(Error::from(ErrorKind::OperationTimedOut))
            }
        }
    }

    /// Returns a human-readable description like `"<name> [<address>]"`.
    pub async fn describe(&self) -> Result<String> {
        let name = self.name().await?;
        let address = self.address().await?;
        Ok(format!("{} [{}]", name, address))
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("path", &self.helper.path())
            .finish()
    }
}
