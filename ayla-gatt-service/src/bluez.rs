//! BlueZ and D-Bus names used by the provisioning service.

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const BLUEZ_PATH: &str = "/org/bluez";

pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_IFACE: &str = "org.bluez.Device1";
pub const AGENT_MANAGER_IFACE: &str = "org.bluez.AgentManager1";
pub const GATT_MANAGER_IFACE: &str = "org.bluez.GattManager1";
pub const GATT_SERVICE_IFACE: &str = "org.bluez.GattService1";
pub const GATT_CHRC_IFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_PROFILE_IFACE: &str = "org.bluez.GattProfile1";
pub const ADV_MANAGER_IFACE: &str = "org.bluez.LEAdvertisingManager1";

pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";

pub const ERROR_REJECTED: &str = "org.bluez.Error.Rejected";

/// Root of the exported GATT application. BlueZ walks it with
/// `GetManagedObjects`, so it must be the path registered with
/// `RegisterApplication`.
pub const APP_ROOT_PATH: &str = "/";
pub const OBJECT_MANAGER_PATH: &str = "/";

pub const AGENT_PATH: &str = "/ayla/agent1";
pub const ADV_PATH: &str = "/ayla/advertisement1";

pub const APP_PATH: &str = "/ayla/app";
pub const IDENTITY_SERVICE_PATH: &str = "/ayla/app/serv_ayla";
pub const DSN_CHRC_PATH: &str = "/ayla/app/serv_ayla/dsn";
pub const DUID_CHRC_PATH: &str = "/ayla/app/serv_ayla/duid";
pub const CONFIG_SERVICE_PATH: &str = "/ayla/app/serv_conf";
pub const CONNECT_CHRC_PATH: &str = "/ayla/app/serv_conf/connect";
pub const STATE_CHRC_PATH: &str = "/ayla/app/serv_conf/state";
pub const SCAN_CHRC_PATH: &str = "/ayla/app/serv_conf/scan";
pub const RESULT_CHRC_PATH: &str = "/ayla/app/serv_conf/result";
pub const SETUP_SERVICE_PATH: &str = "/ayla/app/serv_conn";
pub const SETUP_TOKEN_CHRC_PATH: &str = "/ayla/app/serv_conn/setup";

pub const IDENTITY_SERVICE_UUID: &str = "0000FE28-0000-1000-8000-00805F9B34FB";
pub const DSN_CHRC_UUID: &str = "00000001-FE28-435B-991A-F1B21BB9BCD0";
pub const DUID_CHRC_UUID: &str = "00000002-FE28-435B-991A-F1B21BB9BCD0";
pub const CONFIG_SERVICE_UUID: &str = "1CF0FE66-3ECF-4D6E-A9FC-E287AB124B96";
pub const CONNECT_CHRC_UUID: &str = "1F80AF6A-2B71-4E35-94E5-00F854D8F16F";
pub const STATE_CHRC_UUID: &str = "1F80AF6C-2B71-4E35-94E5-00F854D8F16F";
pub const SCAN_CHRC_UUID: &str = "1F80AF6D-2B71-4E35-94E5-00F854D8F16F";
pub const RESULT_CHRC_UUID: &str = "1F80AF6E-2B71-4E35-94E5-00F854D8F16F";
pub const SETUP_SERVICE_UUID: &str = "FCE3EC41-59B6-4873-AE36-FAB25BD59ADC";
pub const SETUP_TOKEN_CHRC_UUID: &str = "7E9869ED-4DB3-4520-88EA-1C21EF1BA834";
