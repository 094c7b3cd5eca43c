//! The GATT profile of a connected device: a [`GattServer`] holding [`GattService`]s, which
//! hold [`GattCharacteristic`]s.
//!
//! Each level caches its children by [`Uuid`] when `init` runs. [`Device::gatt`] initializes
//! the whole tree.
//!
//! [`Device::gatt`]: crate::device::Device::gatt

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use zbus::zvariant::{OwnedValue, Value};

use crate::{
    bus::{Bus, PropertiesChanged},
    device,
    error::ErrorKind,
    event::{Emitter, EventStream, ListenerId},
    helper::{BusHelper, HelperOptions},
    uuid::Uuid,
    value::{decode, dict_arg, TypedValue},
    Error, Result, SERVICE,
};

const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

type Cache<T> = Arc<RwLock<HashMap<Uuid, T>>>;

fn cached<T: Clone>(cache: &Cache<T>, uuid: &Uuid) -> Option<T> {
    cache
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(uuid)
        .cloned()
}

fn cached_keys<T>(cache: &Cache<T>) -> Vec<Uuid> {
    let mut keys = cache
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .copied()
        .collect::<Vec<_>>();
    keys.sort();
    keys
}

fn replace<T>(cache: &Cache<T>, contents: HashMap<Uuid, T>) {
    *cache.write().unwrap_or_else(PoisonError::into_inner) = contents;
}

/// The GATT server of a connected [`Device`].
///
/// [`Device`]: crate::device::Device
pub struct GattServer {
    bus: Arc<dyn Bus>,
    helper: BusHelper,
    services: Cache<GattService>,
}

impl GattServer {
    const RESOLVED: &'static str = "ServicesResolved";

    pub(crate) fn new(bus: Arc<dyn Bus>, device_path: &str) -> Self {
        let helper = BusHelper::new(
            bus.clone(),
            SERVICE,
            device_path,
            device::INTERFACE,
            HelperOptions::default(),
        );
        Self {
            bus,
            helper,
            services: Arc::default(),
        }
    }

    /// (Re-)discovers all services of the device, including their characteristics.
    ///
    /// If BlueZ has not finished resolving the device's services yet, this waits until it has.
    /// The previous cache is discarded up front; the new one becomes visible only once every
    /// service has been initialized.
    pub async fn init(&self) -> Result<()> {
        replace(&self.services, HashMap::new());

        loop {
            let change = self.helper.wait_prop_change(Self::RESOLVED).await?;
            if decode::<bool>(self.helper.prop(Self::RESOLVED).await?)? {
                break;
            }
            log::debug!("{}: waiting for services to be resolved", self.helper.path());
            if decode::<bool>(change.await?)? {
                break;
            }
        }

        let mut services = HashMap::new();
        for id in self.helper.children().await? {
            let path = format!("{}/{}", self.helper.path(), id);
            let service = GattService::new(self.bus.clone(), &path);
            let uuid = service.uuid().await?;
            service.init().await?;
            log::trace!("{}: service {}", path, uuid);
            services.insert(uuid, service);
        }
        log::debug!(
            "{}: {} services resolved",
            self.helper.path(),
            services.len()
        );

        replace(&self.services, services);
        Ok(())
    }

    /// Returns the [`Uuid`]s of all services found by the last [`GattServer::init`].
    pub fn services(&self) -> Vec<Uuid> {
        cached_keys(&self.services)
    }

    /// Returns the service with the given [`Uuid`].
    ///
    /// Fails with [`ErrorKind::ServiceNotAvailable`] if the last [`GattServer::init`] did not find
    /// such a service.
    pub fn get_primary_service(&self, uuid: Uuid) -> Result<GattService> {
        cached(&self.services, &uuid).ok_or_else(|| Error::from(ErrorKind::ServiceNotAvailable))
    }
}

impl fmt::Debug for GattServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattServer")
            .field("path", &self.helper.path())
            .field("services", &self.services())
            .finish()
    }
}

/// A GATT service of a Bluetooth LE device.
///
/// To obtain [`GattService`]s, use [`GattServer::get_primary_service`].
#[derive(Clone)]
pub struct GattService {
    bus: Arc<dyn Bus>,
    helper: Arc<BusHelper>,
    characteristics: Cache<GattCharacteristic>,
}

impl GattService {
    fn new(bus: Arc<dyn Bus>, path: &str) -> Self {
        let helper = BusHelper::new(
            bus.clone(),
            SERVICE,
            path,
            SERVICE_INTERFACE,
            HelperOptions::default(),
        );
        Self {
            bus,
            helper: Arc::new(helper),
            characteristics: Arc::default(),
        }
    }

    pub fn path(&self) -> &str {
        self.helper.path()
    }

    /// (Re-)discovers all characteristics of this service.
    pub async fn init(&self) -> Result<()> {
        replace(&self.characteristics, HashMap::new());

        let mut characteristics = HashMap::new();
        for id in self.helper.children().await? {
            let path = format!("{}/{}", self.helper.path(), id);
            let characteristic = GattCharacteristic::new(&self.bus, &path);
            let uuid = characteristic.uuid().await?;
            log::trace!("{}: characteristic {}", path, uuid);
            characteristics.insert(uuid, characteristic);
        }

        replace(&self.characteristics, characteristics);
        Ok(())
    }

    /// Returns a [`bool`] indicating whether this [`GattService`] is a primary service.
    ///
    /// If `false`, the service is secondary.
    pub async fn is_primary(&self) -> Result<bool> {
        decode(self.helper.prop("Primary").await?)
    }

    /// Returns the [`Uuid`] identifying this [`GattService`].
    pub async fn uuid(&self) -> Result<Uuid> {
        let uuid: String = decode(self.helper.prop("UUID").await?)?;
        uuid.parse().map_err(Error::from)
    }

    /// Returns the [`Uuid`]s of all characteristics found by the last [`GattService::init`].
    pub fn characteristics(&self) -> Vec<Uuid> {
        cached_keys(&self.characteristics)
    }

    /// Returns the [`GattCharacteristic`] of this service identified by the given [`Uuid`].
    ///
    /// Fails with [`ErrorKind::CharacteristicNotAvailable`] if the service does not expose any
    /// characteristic with the given [`Uuid`].
    pub fn get_characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic> {
        cached(&self.characteristics, &uuid)
            .ok_or_else(|| Error::from(ErrorKind::CharacteristicNotAvailable))
    }

    /// Returns the service's [`Uuid`] as a string.
    pub async fn describe(&self) -> Result<String> {
        Ok(self.uuid().await?.to_string())
    }
}

impl fmt::Debug for GattService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattService")
            .field("path", &self.helper.path())
            .finish()
    }
}

bitflags::bitflags! {
    /// The operations a [`GattCharacteristic`] supports, as advertised in its `Flags` property.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicFlags: u32 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const WRITE = 1 << 3;
        /// The device can notify the host of changes made to the value.
        ///
        /// If set, [`GattCharacteristic::start_notifications`] can be used to receive them.
        const NOTIFY = 1 << 4;
        /// Like [`CharacteristicFlags::NOTIFY`], but acknowledged by the host.
        const INDICATE = 1 << 5;
        const AUTHENTICATED_SIGNED_WRITES = 1 << 6;
        const EXTENDED_PROPERTIES = 1 << 7;
        const RELIABLE_WRITE = 1 << 8;
        const WRITABLE_AUXILIARIES = 1 << 9;
        const ENCRYPT_READ = 1 << 10;
        const ENCRYPT_WRITE = 1 << 11;
        const ENCRYPT_NOTIFY = 1 << 12;
        const ENCRYPT_INDICATE = 1 << 13;
        const ENCRYPT_AUTHENTICATED_READ = 1 << 14;
        const ENCRYPT_AUTHENTICATED_WRITE = 1 << 15;
        const ENCRYPT_AUTHENTICATED_NOTIFY = 1 << 16;
        const ENCRYPT_AUTHENTICATED_INDICATE = 1 << 17;
        const SECURE_READ = 1 << 18;
        const SECURE_WRITE = 1 << 19;
        const SECURE_NOTIFY = 1 << 20;
        const SECURE_INDICATE = 1 << 21;
        const AUTHORIZE = 1 << 22;
    }
}

impl CharacteristicFlags {
    fn from_bluez_name(name: &str) -> Option<Self> {
        Some(match name {
            "broadcast" => Self::BROADCAST,
            "read" => Self::READ,
            "write-without-response" => Self::WRITE_WITHOUT_RESPONSE,
            "write" => Self::WRITE,
            "notify" => Self::NOTIFY,
            "indicate" => Self::INDICATE,
            "authenticated-signed-writes" => Self::AUTHENTICATED_SIGNED_WRITES,
            "extended-properties" => Self::EXTENDED_PROPERTIES,
            "reliable-write" => Self::RELIABLE_WRITE,
            "writable-auxiliaries" => Self::WRITABLE_AUXILIARIES,
            "encrypt-read" => Self::ENCRYPT_READ,
            "encrypt-write" => Self::ENCRYPT_WRITE,
            "encrypt-notify" => Self::ENCRYPT_NOTIFY,
            "encrypt-indicate" => Self::ENCRYPT_INDICATE,
            "encrypt-authenticated-read" => Self::ENCRYPT_AUTHENTICATED_READ,
            "encrypt-authenticated-write" => Self::ENCRYPT_AUTHENTICATED_WRITE,
            "encrypt-authenticated-notify" => Self::ENCRYPT_AUTHENTICATED_NOTIFY,
            "encrypt-authenticated-indicate" => Self::ENCRYPT_AUTHENTICATED_INDICATE,
            "secure-read" => Self::SECURE_READ,
            "secure-write" => Self::SECURE_WRITE,
            "secure-notify" => Self::SECURE_NOTIFY,
            "secure-indicate" => Self::SECURE_INDICATE,
            "authorize" => Self::AUTHORIZE,
            _ => return None,
        })
    }

    /// Collects BlueZ flag names into a set of flags. Unknown names are skipped.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().fold(Self::empty(), |flags, name| {
            match Self::from_bluez_name(name) {
                Some(flag) => flags | flag,
                None => {
                    log::trace!("ignoring unknown characteristic flag `{}`", name);
                    flags
                }
            }
        })
    }
}

/// Acknowledgement semantics of a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteKind {
    /// Reliable write procedure (prepared write + execute).
    #[default]
    Reliable,
    /// Write with response.
    Request,
    /// Write without response.
    Command,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reliable => "reliable",
            Self::Request => "request",
            Self::Command => "command",
        }
    }
}

/// Options for [`GattCharacteristic::write_value`].
///
/// A plain `u16` converts into options with that offset and the default [`WriteKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    pub offset: u16,
    pub kind: WriteKind,
}

impl From<u16> for WriteOptions {
    fn from(offset: u16) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }
}

impl From<WriteKind> for WriteOptions {
    fn from(kind: WriteKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}

/// A Bluetooth characteristic that is part of some [`GattService`].
///
/// A characteristic stores a value that can be (depending on the specific characteristic) read
/// and/or written by the host.
#[derive(Clone)]
pub struct GattCharacteristic {
    helper: Arc<BusHelper>,
    events: Emitter<Vec<u8>>,
    /// The listener translating `Value` changes into events, while notifying.
    watcher: Arc<Mutex<Option<ListenerId>>>,
}

impl GattCharacteristic {
    fn new(bus: &Arc<dyn Bus>, path: &str) -> Self {
        let helper = BusHelper::new(
            bus.clone(),
            SERVICE,
            path,
            CHARACTERISTIC_INTERFACE,
            HelperOptions {
                use_props: true,
                use_props_events: true,
            },
        );
        Self {
            helper: Arc::new(helper),
            events: Emitter::new(),
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &str {
        self.helper.path()
    }

    /// Returns the [`Uuid`] identifying this [`GattCharacteristic`].
    ///
    /// The returned [`Uuid`] determines the data format of the characteristic's value. For standard
    /// services and characteristics, [`Uuid`]s are assigned by the Bluetooth SIG and documented in
    /// their "Assigned Numbers" document. For vendor-specific characteristics, consult the vendor
    /// for documentation.
    pub async fn uuid(&self) -> Result<Uuid> {
        let uuid: String = decode(self.helper.prop("UUID").await?)?;
        uuid.parse().map_err(Error::from)
    }

    /// Returns the raw BlueZ flag names (eg. `read`, `notify`).
    pub async fn get_flags(&self) -> Result<Vec<String>> {
        decode(self.helper.prop("Flags").await?)
    }

    /// Returns the [`CharacteristicFlags`] associated with this [`GattCharacteristic`].
    ///
    /// These flags indicate which operations the [`GattCharacteristic`] supports.
    pub async fn flags(&self) -> Result<CharacteristicFlags> {
        let names = self.get_flags().await?;
        Ok(CharacteristicFlags::from_names(
            names.iter().map(String::as_str),
        ))
    }

    pub async fn is_notifying(&self) -> Result<bool> {
        decode(self.helper.prop("Notifying").await?)
    }

    /// Reads the value of this characteristic, starting at `offset`.
    pub async fn read_value(&self, offset: u16) -> Result<Vec<u8>> {
        let options = dict_arg([("offset", TypedValue::uint16(offset))]);
        let reply = self.helper.call_method("ReadValue", vec![options]).await?;
        let value = reply
            .into_iter()
            .next()
            .ok_or_else(|| Error::from("ReadValue returned no value"))?;
        decode(value)
    }

    /// Writes a new value to this characteristic.
    ///
    /// `value` has to be a byte buffer (`ay`); anything else fails with
    /// [`ErrorKind::InvalidPayloadType`] without contacting the device. `options` is either a
    /// [`WriteOptions`] or just an offset.
    pub async fn write_value<'a>(
        &self,
        value: impl Into<Value<'a>>,
        options: impl Into<WriteOptions>,
    ) -> Result<()> {
        let value = value.into();
        if value.value_signature().as_str() != "ay" {
            return Err(Error::from(ErrorKind::InvalidPayloadType));
        }
        let options = options.into();
        let options = dict_arg([
            ("offset", TypedValue::uint16(options.offset)),
            ("type", TypedValue::string(options.kind.as_str())),
        ]);
        self.helper
            .call_method("WriteValue", vec![OwnedValue::from(value), options])
            .await?;
        Ok(())
    }

    /// Writes a new value and waits for the device to acknowledge it.
    pub async fn write_value_with_response<'a>(
        &self,
        value: impl Into<Value<'a>>,
        offset: u16,
    ) -> Result<()> {
        self.write_value(
            value,
            WriteOptions {
                offset,
                kind: WriteKind::Request,
            },
        )
        .await
    }

    /// Writes a new value without requesting an acknowledgement.
    pub async fn write_value_without_response<'a>(
        &self,
        value: impl Into<Value<'a>>,
        offset: u16,
    ) -> Result<()> {
        self.write_value(
            value,
            WriteOptions {
                offset,
                kind: WriteKind::Command,
            },
        )
        .await
    }

    fn watcher(&self) -> MutexGuard<'_, Option<ListenerId>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach_watcher(&self) {
        if let Some(id) = self.watcher().take() {
            self.helper.events().off(id);
        }
    }

    /// Enables notifications (or indications) for this characteristic.
    ///
    /// Every value the device sends from now on until [`GattCharacteristic::stop_notifications`]
    /// is reported to [`GattCharacteristic::on_value_changed`] listeners. Values arriving while
    /// the `StartNotify` call is still in flight are reported too.
    pub async fn start_notifications(&self) -> Result<()> {
        {
            let mut watcher = self.watcher();
            if watcher.is_none() {
                let events = self.events.clone();
                let path = self.path().to_string();
                *watcher = Some(self.helper.events().on(move |change: &PropertiesChanged| {
                    let Some(value) = change.changed.get("Value") else {
                        return;
                    };
                    match decode::<Vec<u8>>(value.clone()) {
                        Ok(value) => events.emit(&value),
                        Err(e) => log::warn!("{}: malformed `Value`: {}", path, e),
                    }
                }));
            }
        }

        if let Err(e) = self.helper.call_method("StartNotify", Vec::new()).await {
            self.detach_watcher();
            return Err(e);
        }
        log::debug!("{}: notifications started", self.path());
        Ok(())
    }

    /// Disables notifications for this characteristic.
    ///
    /// Once this returns, no further values are reported.
    pub async fn stop_notifications(&self) -> Result<()> {
        self.helper.call_method("StopNotify", Vec::new()).await?;
        self.helper.remove_listeners().await;
        self.watcher().take();
        log::debug!("{}: notifications stopped", self.path());
        Ok(())
    }

    /// Registers a callback for values received while notifications are enabled.
    pub fn on_value_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Vec<u8>) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    /// Removes a callback registered with [`GattCharacteristic::on_value_changed`].
    pub fn off_value_changed(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Returns a stream of the values received while notifications are enabled.
    pub fn value_stream(&self) -> EventStream<Vec<u8>> {
        self.events.stream()
    }

    /// Returns the characteristic's [`Uuid`] as a string.
    pub async fn describe(&self) -> Result<String> {
        Ok(self.uuid().await?.to_string())
    }
}

impl fmt::Debug for GattCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattCharacteristic")
            .field("path", &self.helper.path())
            .finish()
    }
}
