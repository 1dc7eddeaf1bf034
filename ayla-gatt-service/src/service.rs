//! The provisioning service itself: bring-up state machine, GATT method
//! handlers, notification emission and advertising control.

use crate::bluez;
use crate::broker::Broker;
use crate::hci;
use crate::objects::{self, TreeValues};
use crate::payload::{self, ConnectPayload, LinkState, ScanResultPayload, StatusPayload};
use crate::wifi::{ConnState, ConnectRequest, ScanEntry, Security, WifiControl};
use ayla_dbus_client::{args, ClientError, Filter, FilterToken, DEFAULT_CALL_TIMEOUT};
use ayla_reactor::{Reactor, Timer};
use dbus::arg::{ArgType, PropMap, Variant};
use dbus::strings::ErrorName;
use dbus::{Message, Path};
use log::{debug, error, warn};
use serde_derive::Deserialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::rc::{Rc, Weak};
use std::time::Duration;
use thiserror::Error;

const STEP_RETRY_DELAY: Duration = Duration::from_secs(1);
const ADV_UPDATE_DELAY: Duration = Duration::from_secs(1);
const NOW: Duration = Duration::from_millis(0);

/// Object paths exported for the GATT application, with the interface each
/// one serves.
const GATT_PATHS: [(&str, &str); 11] = [
    (bluez::APP_PATH, bluez::GATT_PROFILE_IFACE),
    (bluez::IDENTITY_SERVICE_PATH, bluez::GATT_SERVICE_IFACE),
    (bluez::DSN_CHRC_PATH, bluez::GATT_CHRC_IFACE),
    (bluez::DUID_CHRC_PATH, bluez::GATT_CHRC_IFACE),
    (bluez::CONFIG_SERVICE_PATH, bluez::GATT_SERVICE_IFACE),
    (bluez::CONNECT_CHRC_PATH, bluez::GATT_CHRC_IFACE),
    (bluez::STATE_CHRC_PATH, bluez::GATT_CHRC_IFACE),
    (bluez::SCAN_CHRC_PATH, bluez::GATT_CHRC_IFACE),
    (bluez::RESULT_CHRC_PATH, bluez::GATT_CHRC_IFACE),
    (bluez::SETUP_SERVICE_PATH, bluez::GATT_SERVICE_IFACE),
    (bluez::SETUP_TOKEN_CHRC_PATH, bluez::GATT_CHRC_IFACE),
];

/// An error raised while building or sending a bus message.
#[derive(Debug, Error)]
pub enum GattError {
    #[error("message construction failed: {0}")]
    Message(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Bring-up phase of the service. Forward transitions happen one step at a
/// time as each action completes; WAITING and READY are the two resting
/// states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BringUp {
    Init,
    PowerOn,
    RegAgent,
    RegDefaultAgent,
    GetLocalAddr,
    SignalSubscribe,
    RequestManagedObjects,
    Waiting,
    RegAppPaths,
    RegApp,
    RegAdvPath,
    RegAdv,
    Ready,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Object path of the adapter hosting the GATT application.
    pub adapter_path: String,
    /// HCI device name handed to the advertising control tool.
    pub hci_device: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            adapter_path: "/org/bluez/hci0".to_string(),
            hci_device: "hci0".to_string(),
        }
    }
}

struct Inner {
    state: BringUp,
    /// BlueZ's unique bus name, learned from reply senders.
    bus_name: Option<String>,
    dsn: [u8; payload::DSN_LEN],
    dsn_set: bool,
    duid: [u8; payload::ADDR_LEN],
    adv_name: String,
    adv_enabled: bool,
    connect: ConnectPayload,
    status: StatusPayload,
    scan_cmd: u8,
    last_result: ScanResultPayload,
    status_notify: bool,
    result_notify: bool,
    setup_token: String,
    /// PropertiesChanged subscriptions per adapter/device path.
    devices: HashMap<String, FilterToken>,
    added_filter: Option<FilterToken>,
    removed_filter: Option<FilterToken>,
    scan_results: Vec<ScanEntry>,
    scan_cursor: usize,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            state: BringUp::Init,
            bus_name: None,
            dsn: [0; payload::DSN_LEN],
            dsn_set: false,
            duid: [0; payload::ADDR_LEN],
            adv_name: String::new(),
            adv_enabled: false,
            connect: ConnectPayload::default(),
            status: StatusPayload::default(),
            scan_cmd: 0,
            last_result: ScanResultPayload::default(),
            status_notify: false,
            result_notify: false,
            setup_token: String::new(),
            devices: HashMap::new(),
            added_filter: None,
            removed_filter: None,
            scan_results: Vec::new(),
            scan_cursor: 0,
        }
    }
}

/// The BLE Wi-Fi provisioning service.
///
/// Owns all of its state; registers its handlers into the broker client and
/// its timers into the reactor. Create with [`GattService::new`], then call
/// [`GattService::start`] to hook the Wi-Fi collaborator callbacks and
/// begin bring-up.
pub struct GattService {
    reactor: Rc<Reactor>,
    broker: Rc<dyn Broker>,
    wifi: Rc<dyn WifiControl>,
    config: Config,
    inner: RefCell<Inner>,
    step_timer: Timer,
    adv_timer: Timer,
    weak: Weak<GattService>,
}

impl GattService {
    pub fn new(
        reactor: Rc<Reactor>,
        broker: Rc<dyn Broker>,
        wifi: Rc<dyn WifiControl>,
        config: Config,
    ) -> Rc<GattService> {
        Rc::new_cyclic(|weak: &Weak<GattService>| {
            let w = weak.clone();
            let step_timer = reactor.timer(move || {
                if let Some(svc) = w.upgrade() {
                    svc.step();
                }
            });
            let w = weak.clone();
            let adv_timer = reactor.timer(move || {
                if let Some(svc) = w.upgrade() {
                    svc.adv_timeout();
                }
            });
            GattService {
                reactor: reactor.clone(),
                broker,
                wifi,
                config,
                inner: RefCell::new(Inner::new()),
                step_timer,
                adv_timer,
                weak: weak.clone(),
            }
        })
    }

    /// Register the Wi-Fi collaborator callbacks and start bring-up.
    pub fn start(self: &Rc<Self>) {
        let w = Rc::downgrade(self);
        self.wifi.on_scan_complete(Box::new(move || {
            if let Some(svc) = w.upgrade() {
                svc.scan_complete();
            }
        }));
        let w = Rc::downgrade(self);
        self.wifi.on_connect_state_change(Box::new(move || {
            if let Some(svc) = w.upgrade() {
                svc.connect_state_change();
            }
        }));
        let w = Rc::downgrade(self);
        self.wifi.on_ap_mode_change(Box::new(move |enable| {
            if let Some(svc) = w.upgrade() {
                svc.set_advertising(enable);
            }
        }));
        self.step();
    }

    /// Reverse every registration: object-manager and device subscriptions,
    /// GATT and advertisement paths, the agent, and LE advertising.
    pub fn cleanup(&self) {
        self.unsubscribe_object_signals();
        let tokens: Vec<FilterToken> = self
            .inner
            .borrow_mut()
            .devices
            .drain()
            .map(|(_, token)| token)
            .collect();
        for token in tokens {
            self.broker.remove_filter(token);
        }
        self.unregister_app_paths();
        self.broker.unregister_object(bluez::ADV_PATH);
        self.remove_agent();
        self.reactor.timer_cancel(&self.step_timer);
        self.reactor.timer_cancel(&self.adv_timer);
        self.apply_advertising(false);
    }

    pub fn state(&self) -> BringUp {
        self.inner.borrow().state
    }

    pub fn advertising_enabled(&self) -> bool {
        self.inner.borrow().adv_enabled
    }

    pub fn status_notify_enabled(&self) -> bool {
        self.inner.borrow().status_notify
    }

    pub fn result_notify_enabled(&self) -> bool {
        self.inner.borrow().result_notify
    }

    /// Paths with a live PropertiesChanged subscription.
    pub fn subscribed_paths(&self) -> Vec<String> {
        self.inner.borrow().devices.keys().cloned().collect()
    }

    /* Bring-up state machine */

    fn step(&self) {
        let state = self.state();
        debug!("bring-up state {:?}", state);
        let result = match state {
            BringUp::Init => {
                self.set_state(BringUp::PowerOn);
                self.reactor.timer_set(&self.step_timer, STEP_RETRY_DELAY);
                Ok(())
            }
            BringUp::PowerOn => self.power_on(),
            BringUp::RegAgent => self.register_agent(),
            BringUp::RegDefaultAgent => self.register_default_agent(),
            BringUp::GetLocalAddr => self.get_local_address(),
            BringUp::SignalSubscribe => self.subscribe_object_signals(),
            BringUp::RequestManagedObjects => self.request_managed_objects(),
            BringUp::Waiting => {
                let enabled = self.inner.borrow().adv_enabled;
                if enabled {
                    self.advance(BringUp::RegAppPaths);
                }
                Ok(())
            }
            BringUp::RegAppPaths => self.register_app_paths(),
            BringUp::RegApp => self.register_application(),
            BringUp::RegAdvPath => self.register_adv_path(),
            BringUp::RegAdv => self.register_advertisement(),
            BringUp::Ready => {
                self.reactor.timer_cancel(&self.step_timer);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("bring-up step {:?} failed: {}", state, err);
            self.retry_step();
        }
    }

    fn set_state(&self, state: BringUp) {
        self.inner.borrow_mut().state = state;
    }

    fn advance(&self, state: BringUp) {
        self.set_state(state);
        self.reactor.timer_set(&self.step_timer, NOW);
    }

    fn retry_step(&self) {
        self.reactor.timer_set(&self.step_timer, STEP_RETRY_DELAY);
    }

    /// Issue a bring-up method call. `on_ok` runs with the reply; any
    /// failure logs and re-arms the step timer so the action retries.
    fn call(
        &self,
        msg: Message,
        on_ok: impl FnOnce(&GattService, Message) + 'static,
    ) -> Result<(), GattError> {
        let weak = self.weak.clone();
        self.broker.send_async(
            msg,
            DEFAULT_CALL_TIMEOUT,
            Box::new(move |result| {
                let Some(svc) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(reply) => on_ok(&svc, reply),
                    Err(err) => {
                        warn!("method call failed: {}", err);
                        svc.retry_step();
                    }
                }
            }),
        )?;
        Ok(())
    }

    /// Issue a tear-down method call whose outcome is only logged.
    fn call_logged(&self, msg: Message, what: &'static str) {
        let result = self.broker.send_async(
            msg,
            DEFAULT_CALL_TIMEOUT,
            Box::new(move |result| match result {
                Ok(_) => debug!("{} completed", what),
                Err(err) => warn!("{} failed: {}", what, err),
            }),
        );
        if let Err(err) = result {
            warn!("{}: send failed: {}", what, err);
        }
    }

    fn note_bus_name(&self, reply: &Message) {
        let sender = reply.sender().map(|name| name.to_string());
        let mut inner = self.inner.borrow_mut();
        if inner.bus_name.is_none() {
            match sender {
                Some(name) => inner.bus_name = Some(name),
                None => warn!("no bus name populated"),
            }
        }
    }

    fn power_on(&self) -> Result<(), GattError> {
        let msg = args::prop_set(
            bluez::BLUEZ_SERVICE,
            &self.config.adapter_path,
            bluez::ADAPTER_IFACE,
            "Powered",
            true,
        )
        .map_err(GattError::Message)?;
        debug!("power on adapter {}", self.config.adapter_path);
        self.call(msg, |svc, reply| {
            svc.note_bus_name(&reply);
            debug!("adapter powered on");
            svc.advance(BringUp::RegAgent);
        })
    }

    fn register_agent(&self) -> Result<(), GattError> {
        let weak = self.weak.clone();
        self.broker.register_object(
            bluez::AGENT_PATH,
            None,
            Rc::new(move |msg| {
                if let Some(svc) = weak.upgrade() {
                    svc.agent_method(bluez::AGENT_PATH, msg);
                }
            }),
        )?;
        let msg = Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            bluez::BLUEZ_PATH,
            bluez::AGENT_MANAGER_IFACE,
            "RegisterAgent",
        )
        .map_err(GattError::Message)?
        .append2(Path::from(bluez::AGENT_PATH), "NoInputNoOutput");
        self.call(msg, |svc, _| {
            debug!("registered connection agent on {}", bluez::AGENT_PATH);
            svc.advance(BringUp::RegDefaultAgent);
        })
    }

    fn register_default_agent(&self) -> Result<(), GattError> {
        let msg = Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            bluez::BLUEZ_PATH,
            bluez::AGENT_MANAGER_IFACE,
            "RequestDefaultAgent",
        )
        .map_err(GattError::Message)?
        .append1(Path::from(bluez::AGENT_PATH));
        self.call(msg, |svc, reply| {
            debug!("registered default agent");
            svc.note_bus_name(&reply);
            svc.advance(BringUp::GetLocalAddr);
        })
    }

    fn get_local_address(&self) -> Result<(), GattError> {
        let msg = args::prop_get(
            bluez::BLUEZ_SERVICE,
            &self.config.adapter_path,
            bluez::ADAPTER_IFACE,
            "Address",
        )
        .map_err(GattError::Message)?;
        self.call(msg, |svc, reply| {
            let mut iter = reply.iter_init();
            let Some(addr) = args::parse_str(&mut iter) else {
                warn!("Address reply malformed");
                svc.retry_step();
                return;
            };
            svc.set_local_address(addr);
            svc.advance(BringUp::SignalSubscribe);
        })
    }

    /// Record the adapter address as the DUID and derive the advertised
    /// local name from its twelve hex digits.
    fn set_local_address(&self, addr: &str) {
        let mut inner = self.inner.borrow_mut();
        inner.duid = [0; payload::ADDR_LEN];
        for (i, byte) in addr.bytes().take(payload::ADDR_LEN).enumerate() {
            inner.duid[i] = byte;
        }
        let digits: String = addr.chars().filter(|c| *c != ':').take(12).collect();
        inner.adv_name = format!("Ayla-{}", digits);
        debug!("local address {}, advertising as {}", addr, inner.adv_name);
    }

    fn subscribe_object_signals(&self) -> Result<(), GattError> {
        // Re-subscribing on a retry starts from a clean slate.
        self.unsubscribe_object_signals();
        let bus_name = self.inner.borrow().bus_name.clone();
        debug!("subscribing interface signals from {:?}", bus_name);

        let weak = self.weak.clone();
        let handler: Rc<dyn Fn(&Message)> = Rc::new(move |msg| {
            if let Some(svc) = weak.upgrade() {
                svc.object_manager_signal(msg);
            }
        });

        let mut filter = Filter::signal();
        filter.sender = bus_name.clone();
        filter.interface = Some(bluez::OBJECT_MANAGER_IFACE.to_string());
        filter.member = Some("InterfacesAdded".to_string());
        filter.path = Some(bluez::OBJECT_MANAGER_PATH.to_string());
        let added = self.broker.add_signal_filter(filter, handler.clone())?;
        self.inner.borrow_mut().added_filter = Some(added);

        let mut filter = Filter::signal();
        filter.sender = bus_name;
        filter.interface = Some(bluez::OBJECT_MANAGER_IFACE.to_string());
        filter.member = Some("InterfacesRemoved".to_string());
        filter.path = Some(bluez::OBJECT_MANAGER_PATH.to_string());
        let removed = self.broker.add_signal_filter(filter, handler)?;
        self.inner.borrow_mut().removed_filter = Some(removed);

        self.advance(BringUp::RequestManagedObjects);
        Ok(())
    }

    fn unsubscribe_object_signals(&self) {
        let (added, removed) = {
            let mut inner = self.inner.borrow_mut();
            (inner.added_filter.take(), inner.removed_filter.take())
        };
        if let Some(token) = added {
            self.broker.remove_filter(token);
        }
        if let Some(token) = removed {
            self.broker.remove_filter(token);
        }
    }

    fn request_managed_objects(&self) -> Result<(), GattError> {
        let msg = Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            bluez::OBJECT_MANAGER_PATH,
            bluez::OBJECT_MANAGER_IFACE,
            "GetManagedObjects",
        )
        .map_err(GattError::Message)?;
        self.call(msg, |svc, reply| svc.handle_managed_objects(&reply))
    }

    /// Walk the managed-object tree and subscribe to PropertiesChanged for
    /// every adapter and device already present.
    fn handle_managed_objects(&self, reply: &Message) {
        debug!("handling managed objects");
        let bus_name = reply.sender().map(|name| name.to_string());
        let mut iter = reply.iter_init();
        if iter.arg_type() != ArgType::Array {
            warn!("invalid managed objects array");
            self.retry_step();
            return;
        }
        let Some(mut entries) = iter.recurse(ArgType::Array) else {
            self.retry_step();
            return;
        };
        loop {
            if entries.arg_type() == ArgType::Invalid {
                break;
            }
            if let Some((path, mut ifaces)) = args::parse_dict_entry(&mut entries) {
                self.subscribe_listed_interfaces(bus_name.as_deref(), path, &mut ifaces);
            }
            if !entries.next() {
                break;
            }
        }
        debug!("request managed object finished");
        self.advance(BringUp::Waiting);
    }

    /// From an `a{sa{sv}}` interface map, subscribe for the path when it
    /// hosts an adapter or device.
    fn subscribe_listed_interfaces(
        &self,
        bus_name: Option<&str>,
        path: &str,
        ifaces: &mut dbus::arg::Iter,
    ) {
        if ifaces.arg_type() != ArgType::Array {
            warn!("invalid interface array for {}", path);
            return;
        }
        let Some(mut list) = ifaces.recurse(ArgType::Array) else {
            return;
        };
        loop {
            if list.arg_type() == ArgType::Invalid {
                break;
            }
            if let Some((iface, _props)) = args::parse_dict_entry(&mut list) {
                debug!("obj path {}, interface {}", path, iface);
                if iface == bluez::DEVICE_IFACE || iface == bluez::ADAPTER_IFACE {
                    self.subscribe_device(bus_name, path);
                }
            }
            if !list.next() {
                break;
            }
        }
    }

    fn subscribe_device(&self, bus_name: Option<&str>, path: &str) {
        {
            let inner = self.inner.borrow();
            if inner.devices.contains_key(path) {
                debug!("path {} already subscribed", path);
                return;
            }
        }
        let weak = self.weak.clone();
        let owned = path.to_string();
        let mut filter = Filter::signal();
        filter.sender = bus_name.map(str::to_string);
        filter.interface = Some(bluez::PROPERTIES_IFACE.to_string());
        filter.member = Some("PropertiesChanged".to_string());
        filter.path = Some(path.to_string());
        match self.broker.add_signal_filter(
            filter,
            Rc::new(move |msg| {
                if let Some(svc) = weak.upgrade() {
                    svc.properties_changed(&owned, msg);
                }
            }),
        ) {
            Ok(token) => {
                debug!("subscribed PropertiesChanged for {}", path);
                self.inner
                    .borrow_mut()
                    .devices
                    .insert(path.to_string(), token);
            }
            Err(err) => warn!("failed to subscribe PropertiesChanged for {}: {}", path, err),
        }
    }

    fn unsubscribe_device(&self, path: &str) {
        let token = self.inner.borrow_mut().devices.remove(path);
        let Some(token) = token else {
            debug!("no subscription for {}", path);
            return;
        };
        debug!("unsubscribed {}", path);
        self.broker.remove_filter(token);
        // Re-assert advertising once the stack has settled after the removal.
        self.reactor.timer_set(&self.adv_timer, ADV_UPDATE_DELAY);
    }

    /* ObjectManager and Properties signal handlers */

    fn object_manager_signal(&self, msg: &Message) {
        let Some(member) = msg.member() else {
            warn!("missing signal member");
            return;
        };
        let sender = msg.sender().map(|name| name.to_string());
        let mut iter = msg.iter_init();
        if iter.arg_type() != ArgType::ObjectPath {
            warn!("missing object path");
            return;
        }
        let Some(path) = args::parse_str(&mut iter) else {
            warn!("missing object path");
            return;
        };
        let path = path.to_string();
        iter.next();
        debug!("signal {} for {}", &*member, path);

        match &*member {
            "InterfacesAdded" => {
                self.subscribe_listed_interfaces(sender.as_deref(), &path, &mut iter);
            }
            "InterfacesRemoved" => {
                if iter.arg_type() != ArgType::Array {
                    warn!("invalid interface array for {}", path);
                    return;
                }
                let Some(mut list) = iter.recurse(ArgType::Array) else {
                    return;
                };
                loop {
                    if list.arg_type() == ArgType::Invalid {
                        break;
                    }
                    if let Some(iface) = args::parse_str(&mut list) {
                        debug!("obj path {}, interface {} removed", path, iface);
                        if iface == bluez::DEVICE_IFACE || iface == bluez::ADAPTER_IFACE {
                            self.unsubscribe_device(&path);
                        }
                    }
                    if !list.next() {
                        break;
                    }
                }
            }
            other => warn!("unsupported signal member: {}", other),
        }
    }

    /// PropertiesChanged on a subscribed path: adapter Powered/Discovering
    /// and device Connected changes all re-assert the advertising posture.
    fn properties_changed(&self, path: &str, msg: &Message) {
        let mut iter = msg.iter_init();
        let Some(iface) = args::parse_str(&mut iter) else {
            warn!("missing interface content");
            return;
        };
        debug!("path {}, interface {}", path, iface);
        let keys: &[&str] = match iface {
            bluez::DEVICE_IFACE => &["Connected"],
            bluez::ADAPTER_IFACE => &["Powered", "Discovering"],
            other => {
                warn!("unsupported signal interface: {}", other);
                return;
            }
        };
        iter.next();
        if let Some((name, value)) = Self::find_bool_property(&mut iter, keys) {
            debug!("property {} changed to {}", name, value);
            self.update_adv();
        }
    }

    /// Scan an `a{sv}` dictionary for the first of `keys` holding a
    /// boolean. A match of the wrong type drops the whole message.
    fn find_bool_property<'a>(
        iter: &mut dbus::arg::Iter<'a>,
        keys: &[&str],
    ) -> Option<(&'a str, bool)> {
        if iter.arg_type() != ArgType::Array {
            warn!("changed properties not a dictionary");
            return None;
        }
        let mut dict = iter.recurse(ArgType::Array)?;
        loop {
            if dict.arg_type() == ArgType::Invalid {
                return None;
            }
            if let Some((name, mut value)) = args::parse_dict_entry(&mut dict) {
                if keys.contains(&name) {
                    return args::parse_bool(&mut value).map(|flag| (name, flag));
                }
            }
            if !dict.next() {
                return None;
            }
        }
    }

    /* Application, agent and advertisement object registration */

    fn register_app_paths(&self) -> Result<(), GattError> {
        debug!("register application object paths");
        let weak = self.weak.clone();
        self.broker.register_object(
            bluez::APP_ROOT_PATH,
            Some(bluez::OBJECT_MANAGER_IFACE),
            Rc::new(move |msg| {
                if let Some(svc) = weak.upgrade() {
                    svc.app_method(msg);
                }
            }),
        )?;
        let mut registered: Vec<&str> = Vec::new();
        for (path, interface) in GATT_PATHS {
            let weak = self.weak.clone();
            let result = self.broker.register_object(
                path,
                Some(interface),
                Rc::new(move |msg| {
                    if let Some(svc) = weak.upgrade() {
                        svc.gatt_method(path, msg);
                    }
                }),
            );
            match result {
                Ok(()) => registered.push(path),
                Err(err) => {
                    warn!("failed to register path {}: {}", path, err);
                    for path in registered.iter().rev() {
                        self.broker.unregister_object(path);
                    }
                    self.broker.unregister_object(bluez::APP_ROOT_PATH);
                    return Err(err.into());
                }
            }
        }
        self.advance(BringUp::RegApp);
        Ok(())
    }

    fn unregister_app_paths(&self) {
        debug!("unregister application object paths");
        for (path, _) in GATT_PATHS {
            self.broker.unregister_object(path);
        }
        self.broker.unregister_object(bluez::APP_ROOT_PATH);
    }

    fn register_application(&self) -> Result<(), GattError> {
        debug!("method_call RegisterApplication");
        let msg = Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            self.config.adapter_path.as_str(),
            bluez::GATT_MANAGER_IFACE,
            "RegisterApplication",
        )
        .map_err(GattError::Message)?
        .append2(Path::from(bluez::APP_ROOT_PATH), PropMap::new());
        let result = self.call(msg, |svc, _| {
            debug!("register application completed");
            svc.advance(BringUp::RegAdvPath);
        });
        if result.is_err() {
            self.unregister_app_paths();
        }
        result
    }

    fn register_adv_path(&self) -> Result<(), GattError> {
        debug!("register advertisement object path");
        let weak = self.weak.clone();
        self.broker.register_object(
            bluez::ADV_PATH,
            None,
            Rc::new(move |msg| {
                if let Some(svc) = weak.upgrade() {
                    svc.agent_method(bluez::ADV_PATH, msg);
                }
            }),
        )?;
        self.advance(BringUp::RegAdv);
        Ok(())
    }

    fn register_advertisement(&self) -> Result<(), GattError> {
        debug!("method_call RegisterAdvertisement");
        let msg = Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            self.config.adapter_path.as_str(),
            bluez::ADV_MANAGER_IFACE,
            "RegisterAdvertisement",
        )
        .map_err(GattError::Message)?
        .append2(Path::from(bluez::ADV_PATH), PropMap::new());
        self.call(msg, |svc, _| {
            debug!("register advertisement completed");
            svc.advance(BringUp::Ready);
        })
    }

    fn remove_agent(&self) {
        debug!("method_call UnregisterAgent");
        match Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            bluez::BLUEZ_PATH,
            bluez::AGENT_MANAGER_IFACE,
            "UnregisterAgent",
        ) {
            Ok(msg) => {
                self.call_logged(msg.append1(Path::from(bluez::AGENT_PATH)), "unregister agent")
            }
            Err(err) => warn!("message allocation failed: {}", err),
        }
        self.broker.unregister_object(bluez::AGENT_PATH);
    }

    /// Serves both the pairing agent and the advertisement object: `GetAll`
    /// returns the advertisement record, `Release` drops the path.
    fn agent_method(&self, path: &str, msg: &Message) {
        let Some(member) = msg.member() else {
            warn!("missing method");
            return;
        };
        debug!("incoming method call {} on {}", &*member, path);
        let reply = match &*member {
            "GetAll" => {
                let mut iter = msg.iter_init();
                let Some(iface) = args::parse_str(&mut iter) else {
                    warn!("missing interface name");
                    self.reply(msg, None);
                    return;
                };
                debug!("GetAll {} on {}", iface, path);
                let inner = self.inner.borrow();
                let props = objects::advertisement_props(
                    &inner.adv_name,
                    &[bluez::CONFIG_SERVICE_UUID],
                );
                Some(msg.method_return().append1(props))
            }
            "Release" => {
                self.broker.unregister_object(path);
                return;
            }
            other => {
                warn!("unsupported method: {}", other);
                None
            }
        };
        self.reply(msg, reply);
    }

    /// `GetManagedObjects` on the application root.
    fn app_method(&self, msg: &Message) {
        let Some(member) = msg.member() else {
            warn!("missing method");
            return;
        };
        debug!("incoming method call {}", &*member);
        let reply = if &*member == "GetManagedObjects" {
            let inner = self.inner.borrow();
            let connect = inner.connect.encode();
            let status = inner.status.encode();
            let result = inner.last_result.encode();
            let scan = [inner.scan_cmd];
            let mut token = [0u8; payload::SETUP_TOKEN_LEN];
            for (i, byte) in inner
                .setup_token
                .bytes()
                .take(payload::SETUP_TOKEN_LEN)
                .enumerate()
            {
                token[i] = byte;
            }
            let tree = objects::managed_objects(&TreeValues {
                dsn: &inner.dsn,
                duid: &inner.duid,
                connect: &connect,
                status: &status,
                scan: &scan,
                result: &result,
                setup_token: &token,
            });
            Some(msg.method_return().append1(tree))
        } else {
            warn!("unsupported method: {}", &*member);
            None
        };
        self.reply(msg, reply);
    }

    /* Characteristic handlers */

    fn gatt_method(&self, path: &str, msg: &Message) {
        let Some(member) = msg.member() else {
            warn!("missing method");
            return;
        };
        debug!(
            "incoming method call {} on path {} from {}",
            &*member,
            path,
            msg.sender().as_deref().unwrap_or("-")
        );
        let reply = match &*member {
            "ReadValue" => Some(self.read_value(path, msg)),
            "WriteValue" => self.write_value(path, msg),
            "StartNotify" => {
                self.set_notify(path, true);
                Some(msg.method_return())
            }
            "StopNotify" => {
                self.set_notify(path, false);
                Some(msg.method_return())
            }
            other => {
                warn!("unsupported method: {}", other);
                None
            }
        };
        self.reply(msg, reply);
    }

    /// Reply with `reply`, or with a rejection when the handler produced
    /// none. Respects the caller's no-reply flag.
    fn reply(&self, msg: &Message, reply: Option<Message>) {
        if msg.get_no_reply() {
            return;
        }
        let reply = reply.unwrap_or_else(|| {
            msg.error(&ErrorName::from(bluez::ERROR_REJECTED), &CString::default())
        });
        if let Err(err) = self.broker.send(reply) {
            warn!("reply send failed: {}", err);
        }
    }

    fn read_value(&self, path: &str, msg: &Message) -> Message {
        let value: Vec<u8> = match path {
            bluez::DSN_CHRC_PATH => self.read_dsn(),
            bluez::DUID_CHRC_PATH => {
                let inner = self.inner.borrow();
                debug!("read duid {}", String::from_utf8_lossy(&inner.duid));
                inner.duid.to_vec()
            }
            bluez::STATE_CHRC_PATH => {
                let inner = self.inner.borrow();
                debug!(
                    "read state: ssid_len {}, error {}, state {}",
                    inner.status.ssid_len, inner.status.error, inner.status.state
                );
                inner.status.encode().to_vec()
            }
            bluez::RESULT_CHRC_PATH => self.read_scan_result(),
            other => {
                warn!("unsupported path: {}", other);
                Vec::new()
            }
        };
        msg.method_return().append1(value)
    }

    fn read_dsn(&self) -> Vec<u8> {
        let cached = {
            let inner = self.inner.borrow();
            if inner.dsn_set {
                Some(inner.dsn)
            } else {
                None
            }
        };
        let dsn = match cached {
            Some(dsn) => dsn,
            None => {
                let mut buf = [0u8; payload::DSN_LEN];
                if let Some(dsn) = self.wifi.dsn() {
                    for (i, byte) in dsn.bytes().take(payload::DSN_LEN).enumerate() {
                        buf[i] = byte;
                    }
                    let mut inner = self.inner.borrow_mut();
                    inner.dsn = buf;
                    inner.dsn_set = true;
                }
                buf
            }
        };
        debug!("read dsn {}", String::from_utf8_lossy(&dsn));
        dsn.to_vec()
    }

    /// The read cursor over the scan results: the first read after a scan
    /// fetches the set and returns entry zero; each further read returns the
    /// next entry; reads past the end return the all-zero terminator.
    fn read_scan_result(&self) -> Vec<u8> {
        let need_fetch = {
            let inner = self.inner.borrow();
            inner.scan_cursor == 0 && inner.scan_results.is_empty()
        };
        if need_fetch {
            let results = self.wifi.scan_results(payload::SCAN_LIMIT);
            debug!("got scan result {}", results.len());
            self.inner.borrow_mut().scan_results = results;
        }
        let mut inner = self.inner.borrow_mut();
        let mut record = ScanResultPayload::default();
        if inner.scan_cursor < inner.scan_results.len() {
            record = scan_record(inner.scan_cursor, &inner.scan_results[inner.scan_cursor]);
            inner.scan_cursor += 1;
        }
        inner.last_result = record;
        record.encode().to_vec()
    }

    fn write_value(&self, path: &str, msg: &Message) -> Option<Message> {
        let mut iter = msg.iter_init();
        let Some(value) = args::parse_byte_array(&mut iter) else {
            warn!("WriteValue on {} without a byte array", path);
            return None;
        };
        match path {
            bluez::CONNECT_CHRC_PATH => {
                if value.len() > payload::CONNECT_LEN {
                    warn!("WriteValue on {}: length {} too large", path, value.len());
                    return None;
                }
                let request = ConnectPayload::decode(&value)?;
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.connect = request;
                    // A fresh attempt starts with a clean status.
                    inner.status = StatusPayload::default();
                }
                debug!(
                    "connect ssid {}, security {}",
                    String::from_utf8_lossy(request.ssid()),
                    request.security
                );
                self.wifi.connect(&connect_request(&request));
                Some(msg.method_return())
            }
            bluez::SCAN_CHRC_PATH => {
                if value.len() > 1 {
                    warn!("WriteValue on {}: length {} too large", path, value.len());
                    return None;
                }
                let cmd = value.first().copied().unwrap_or(0);
                self.inner.borrow_mut().scan_cmd = cmd;
                if cmd == b'1' {
                    debug!("start wifi scan");
                    self.start_scan();
                }
                Some(msg.method_return())
            }
            bluez::SETUP_TOKEN_CHRC_PATH => {
                if value.len() > payload::SETUP_TOKEN_LEN {
                    warn!("WriteValue on {}: length {} too large", path, value.len());
                    return None;
                }
                let token = String::from_utf8_lossy(&value).to_string();
                self.inner.borrow_mut().setup_token = token.clone();
                self.wifi.set_setup_token(&token);
                Some(msg.method_return())
            }
            other => {
                warn!("unsupported path: {}", other);
                Some(msg.method_return())
            }
        }
    }

    fn set_notify(&self, path: &str, enable: bool) {
        debug!(
            "{} on {}",
            if enable { "StartNotify" } else { "StopNotify" },
            path
        );
        let mut inner = self.inner.borrow_mut();
        match path {
            bluez::RESULT_CHRC_PATH => inner.result_notify = enable,
            bluez::STATE_CHRC_PATH => inner.status_notify = enable,
            _ => {}
        }
    }

    fn start_scan(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.scan_results.clear();
            inner.scan_cursor = 0;
            inner.last_result = ScanResultPayload::default();
        }
        debug!("cleared scan results");
        self.wifi.start_scan();
    }

    /* Wi-Fi collaborator events */

    /// Scan finished: stream every result to a notifying peer, closing with
    /// the all-zero terminator.
    pub fn scan_complete(&self) {
        let (notify, advertising) = {
            let inner = self.inner.borrow();
            (inner.result_notify, inner.adv_enabled)
        };
        debug!(
            "scan complete: result notify {}, advertising {}",
            notify, advertising
        );
        if notify && advertising {
            self.send_scan_results();
        }
    }

    fn send_scan_results(&self) {
        let results = self.wifi.scan_results(payload::SCAN_LIMIT);
        debug!("got scan result count {}", results.len());
        for (index, entry) in results.iter().enumerate() {
            let record = scan_record(index, entry);
            self.send_value_changed(bluez::RESULT_CHRC_PATH, &record.encode());
            self.inner.borrow_mut().last_result = record;
        }
        // The empty record tells the peer the set is complete.
        let terminator = ScanResultPayload::default();
        self.send_value_changed(bluez::RESULT_CHRC_PATH, &terminator.encode());
        self.inner.borrow_mut().last_result = terminator;
    }

    /// Connection attempt progressed: rebuild the status payload and notify
    /// a subscribed peer.
    pub fn connect_state_change(&self) {
        self.refresh_status();
        let (notify, status) = {
            let inner = self.inner.borrow();
            (inner.status_notify, inner.status)
        };
        debug!("status notify {}", notify);
        if notify {
            self.send_value_changed(bluez::STATE_CHRC_PATH, &status.encode());
        }
    }

    fn refresh_status(&self) {
        let status = self.wifi.status();
        let mut rendered = StatusPayload::default();
        for (i, byte) in status.ssid.iter().take(payload::SSID_LEN).enumerate() {
            rendered.ssid[i] = *byte;
        }
        rendered.ssid_len = status.ssid.len().min(payload::SSID_LEN) as u8;
        rendered.error = status.error.wire_value();
        rendered.state = link_state(status.state) as u8;
        debug!(
            "ssid_len {}, error {}, state {}",
            rendered.ssid_len, rendered.error, rendered.state
        );
        self.inner.borrow_mut().status = rendered;
    }

    fn send_value_changed(&self, path: &str, value: &[u8]) {
        debug!("sending PropertiesChanged signal on {}", path);
        let msg = match Message::new_signal(path, bluez::PROPERTIES_IFACE, "PropertiesChanged") {
            Ok(msg) => msg,
            Err(err) => {
                error!("signal allocation for {} failed: {}", path, err);
                return;
            }
        };
        let mut props = PropMap::new();
        props.insert("Value".to_string(), Variant(Box::new(value.to_vec())));
        let msg = msg.append2(bluez::GATT_CHRC_IFACE, props);
        if let Err(err) = self.broker.send(msg) {
            error!("PropertiesChanged send on {} failed: {}", path, err);
        }
    }

    /* Advertising control */

    /// The Wi-Fi collaborator's AP-mode callback: open or close the
    /// provisioning window. Closing it schedules the tear-down back to
    /// WAITING once the stack has settled.
    pub fn set_advertising(&self, enable: bool) {
        self.apply_advertising(enable);
        if !enable {
            self.reactor.timer_set(&self.adv_timer, ADV_UPDATE_DELAY);
        }
    }

    fn apply_advertising(&self, enable: bool) {
        debug!("{} adv", if enable { "enabling" } else { "disabling" });
        match hci::set_le_advertising(&self.config.hci_device, enable) {
            Ok(status) if !status.success() => {
                warn!("hciconfig {} exited with {}", self.config.hci_device, status)
            }
            Err(err) => warn!("hciconfig {} failed: {}", self.config.hci_device, err),
            Ok(_) => {}
        }
        self.inner.borrow_mut().adv_enabled = enable;
        let waiting = self.inner.borrow().state == BringUp::Waiting;
        if enable && waiting {
            self.advance(BringUp::RegAppPaths);
        }
    }

    fn update_adv(&self) {
        let enable = self.inner.borrow().adv_enabled;
        debug!("adv enable flag {}", enable);
        self.apply_advertising(enable);
    }

    /// Delayed advertising update. If the window was closed while READY,
    /// release the application and advertisement and fall back to WAITING.
    fn adv_timeout(&self) {
        let (enabled, state) = {
            let inner = self.inner.borrow();
            (inner.adv_enabled, inner.state)
        };
        if !enabled && state == BringUp::Ready {
            self.teardown_application();
        }
        self.update_adv();
    }

    fn teardown_application(&self) {
        debug!("releasing application and advertisement");
        self.unregister_app_paths();
        match Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            self.config.adapter_path.as_str(),
            bluez::GATT_MANAGER_IFACE,
            "UnregisterApplication",
        ) {
            Ok(msg) => self.call_logged(
                msg.append1(Path::from(bluez::APP_ROOT_PATH)),
                "unregister application",
            ),
            Err(err) => warn!("message allocation failed: {}", err),
        }
        self.broker.unregister_object(bluez::ADV_PATH);
        match Message::new_method_call(
            bluez::BLUEZ_SERVICE,
            self.config.adapter_path.as_str(),
            bluez::ADV_MANAGER_IFACE,
            "UnregisterAdvertisement",
        ) {
            Ok(msg) => self.call_logged(
                msg.append1(Path::from(bluez::ADV_PATH)),
                "unregister advertisement",
            ),
            Err(err) => warn!("message allocation failed: {}", err),
        }
        self.set_state(BringUp::Waiting);
    }
}

fn scan_record(index: usize, entry: &ScanEntry) -> ScanResultPayload {
    let mut record = ScanResultPayload::default();
    record.index = index as u8;
    for (i, byte) in entry.ssid.iter().take(payload::SSID_LEN).enumerate() {
        record.ssid[i] = *byte;
    }
    record.ssid_len = entry.ssid.len().min(payload::SSID_LEN) as u8;
    record.bssid = entry.bssid;
    record.rssi = entry.rssi;
    record.security = entry.security.wire_value();
    record
}

fn connect_request(payload: &ConnectPayload) -> ConnectRequest {
    ConnectRequest {
        ssid: payload.ssid().to_vec(),
        bssid: payload.bssid,
        key: payload.key().to_vec(),
        security: Security::from_wire(payload.security),
    }
}

fn link_state(state: ConnState) -> LinkState {
    match state {
        ConnState::Disabled => LinkState::Disabled,
        ConnState::Joining => LinkState::ConnectingWifi,
        ConnState::Dhcp => LinkState::ConnectingNet,
        ConnState::WaitingForCloud => LinkState::ConnectingCloud,
        ConnState::Up => LinkState::Up,
        ConnState::Selecting | ConnState::Idle | ConnState::Failed => LinkState::None,
    }
}
