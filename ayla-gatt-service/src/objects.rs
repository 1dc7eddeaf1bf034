//! Property maps for the exported GATT object tree and the advertisement.
//!
//! BlueZ learns our services by calling `GetManagedObjects` on the
//! application root and reading these maps; the advertisement object serves
//! the same shape from `GetAll`.

use crate::bluez;
use bitflags::bitflags;
use dbus::arg::{PropMap, RefArg, Variant};
use dbus::Path;
use std::collections::HashMap;

bitflags! {
    /// GATT characteristic property flags.
    pub struct ChrcFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl ChrcFlags {
    /// The flag names BlueZ expects in the `Flags` property.
    pub fn names(self) -> Vec<String> {
        let all = [
            (ChrcFlags::BROADCAST, "broadcast"),
            (ChrcFlags::READ, "read"),
            (ChrcFlags::WRITE_WITHOUT_RESPONSE, "write-without-response"),
            (ChrcFlags::WRITE, "write"),
            (ChrcFlags::NOTIFY, "notify"),
            (ChrcFlags::INDICATE, "indicate"),
            (
                ChrcFlags::AUTHENTICATED_SIGNED_WRITES,
                "authenticated-signed-writes",
            ),
            (ChrcFlags::EXTENDED_PROPERTIES, "extended-properties"),
        ];
        all.iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name.to_string())
            .collect()
    }
}

/// The `GetManagedObjects` reply shape: path → interface → properties.
pub type ObjectTree = HashMap<Path<'static>, HashMap<String, PropMap>>;

/// Current characteristic values, spliced into the tree as the `Value`
/// properties.
pub struct TreeValues<'a> {
    pub dsn: &'a [u8],
    pub duid: &'a [u8],
    pub connect: &'a [u8],
    pub status: &'a [u8],
    pub scan: &'a [u8],
    pub result: &'a [u8],
    pub setup_token: &'a [u8],
}

fn variant<T: RefArg + 'static>(value: T) -> Variant<Box<dyn RefArg>> {
    Variant(Box::new(value))
}

/// The advertisement record: a peripheral advertising the Wi-Fi
/// configuration service, named after the adapter address, and not
/// discoverable at the adapter level (the daemon drives that itself).
pub fn advertisement_props(local_name: &str, service_uuids: &[&str]) -> PropMap {
    let mut props = PropMap::new();
    props.insert("Type".to_string(), variant("peripheral".to_string()));
    props.insert("LocalName".to_string(), variant(local_name.to_string()));
    props.insert(
        "ServiceUUIDs".to_string(),
        variant(
            service_uuids
                .iter()
                .map(|uuid| uuid.to_string())
                .collect::<Vec<String>>(),
        ),
    );
    props.insert("Discoverable".to_string(), variant(false));
    props
}

fn meta_ifaces(entry: &mut HashMap<String, PropMap>) {
    entry.insert(bluez::INTROSPECTABLE_IFACE.to_string(), PropMap::new());
    entry.insert(bluez::PROPERTIES_IFACE.to_string(), PropMap::new());
}

fn profile_entry() -> HashMap<String, PropMap> {
    let mut entry = HashMap::new();
    meta_ifaces(&mut entry);
    let mut props = PropMap::new();
    props.insert("UUIDs".to_string(), variant(vec!["Ayla".to_string()]));
    entry.insert(bluez::GATT_PROFILE_IFACE.to_string(), props);
    entry
}

fn service_entry(uuid: &str, primary: bool) -> HashMap<String, PropMap> {
    let mut entry = HashMap::new();
    meta_ifaces(&mut entry);
    let mut props = PropMap::new();
    props.insert("UUID".to_string(), variant(uuid.to_string()));
    props.insert("Primary".to_string(), variant(primary));
    entry.insert(bluez::GATT_SERVICE_IFACE.to_string(), props);
    entry
}

fn characteristic_entry(
    uuid: &str,
    service_path: &str,
    value: &[u8],
    flags: ChrcFlags,
) -> HashMap<String, PropMap> {
    let mut entry = HashMap::new();
    meta_ifaces(&mut entry);
    let mut props = PropMap::new();
    props.insert("UUID".to_string(), variant(uuid.to_string()));
    props.insert(
        "Service".to_string(),
        variant(Path::from(service_path.to_string())),
    );
    props.insert("Notifying".to_string(), variant(false));
    props.insert("NotifyAcquired".to_string(), variant(false));
    props.insert("Value".to_string(), variant(value.to_vec()));
    props.insert("Flags".to_string(), variant(flags.names()));
    entry.insert(bluez::GATT_CHRC_IFACE.to_string(), props);
    entry
}

/// Build the full `GetManagedObjects` reply for the application tree.
pub fn managed_objects(values: &TreeValues) -> ObjectTree {
    let mut tree = ObjectTree::new();
    tree.insert(Path::from(bluez::APP_PATH), profile_entry());

    tree.insert(
        Path::from(bluez::IDENTITY_SERVICE_PATH),
        service_entry(bluez::IDENTITY_SERVICE_UUID, true),
    );
    tree.insert(
        Path::from(bluez::DSN_CHRC_PATH),
        characteristic_entry(
            bluez::DSN_CHRC_UUID,
            bluez::IDENTITY_SERVICE_PATH,
            values.dsn,
            ChrcFlags::READ,
        ),
    );
    tree.insert(
        Path::from(bluez::DUID_CHRC_PATH),
        characteristic_entry(
            bluez::DUID_CHRC_UUID,
            bluez::IDENTITY_SERVICE_PATH,
            values.duid,
            ChrcFlags::READ,
        ),
    );

    tree.insert(
        Path::from(bluez::CONFIG_SERVICE_PATH),
        service_entry(bluez::CONFIG_SERVICE_UUID, true),
    );
    tree.insert(
        Path::from(bluez::CONNECT_CHRC_PATH),
        characteristic_entry(
            bluez::CONNECT_CHRC_UUID,
            bluez::CONFIG_SERVICE_PATH,
            values.connect,
            ChrcFlags::WRITE,
        ),
    );
    tree.insert(
        Path::from(bluez::STATE_CHRC_PATH),
        characteristic_entry(
            bluez::STATE_CHRC_UUID,
            bluez::CONFIG_SERVICE_PATH,
            values.status,
            ChrcFlags::READ | ChrcFlags::NOTIFY,
        ),
    );
    tree.insert(
        Path::from(bluez::SCAN_CHRC_PATH),
        characteristic_entry(
            bluez::SCAN_CHRC_UUID,
            bluez::CONFIG_SERVICE_PATH,
            values.scan,
            ChrcFlags::WRITE,
        ),
    );
    tree.insert(
        Path::from(bluez::RESULT_CHRC_PATH),
        characteristic_entry(
            bluez::RESULT_CHRC_UUID,
            bluez::CONFIG_SERVICE_PATH,
            values.result,
            ChrcFlags::READ | ChrcFlags::NOTIFY,
        ),
    );

    tree.insert(
        Path::from(bluez::SETUP_SERVICE_PATH),
        service_entry(bluez::SETUP_SERVICE_UUID, true),
    );
    tree.insert(
        Path::from(bluez::SETUP_TOKEN_CHRC_PATH),
        characteristic_entry(
            bluez::SETUP_TOKEN_CHRC_UUID,
            bluez::SETUP_SERVICE_PATH,
            values.setup_token,
            ChrcFlags::WRITE,
        ),
    );

    tree
}
