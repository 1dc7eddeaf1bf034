//! End-to-end provisioning scenarios, driven through a recording broker and
//! a scripted Wi-Fi backend.

use ayla_dbus_client::{ClientError, Filter, FilterToken};
use ayla_gatt_service::payload::{CONNECT_LEN, SCAN_RESULT_LEN};
use ayla_gatt_service::wifi::{
    ConnState, ConnectRequest, ScanEntry, Security, WifiControl, WifiError, WifiStatus,
};
use ayla_gatt_service::{bluez, BringUp, Broker, Config, GattService};
use ayla_reactor::Reactor;
use dbus::arg::{prop_cast, PropMap, Variant};
use dbus::message::MessageType;
use dbus::{Message, Path};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

type ReplyHandler = Box<dyn FnOnce(Result<Message, ClientError>)>;
type SignalHandler = Rc<dyn Fn(&Message)>;

/// Records everything the service asks of the bus and lets tests script
/// the replies.
#[derive(Default)]
struct RecordingBroker {
    /// (interface, member) of every async method call, in order.
    calls: RefCell<Vec<(String, String)>>,
    pending: RefCell<VecDeque<(Message, ReplyHandler)>>,
    sent: RefCell<Vec<Message>>,
    filters: RefCell<HashMap<u64, (Filter, SignalHandler)>>,
    objects: RefCell<HashMap<String, SignalHandler>>,
    next_token: Cell<u64>,
    next_serial: Cell<u32>,
}

impl RecordingBroker {
    fn complete_next(&self, build: impl FnOnce(&Message) -> Result<Message, ClientError>) {
        let entry = self.pending.borrow_mut().pop_front();
        let (msg, handler) = entry.expect("no pending method call");
        handler(build(&msg));
    }

    fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }

    fn invoke_object(&self, path: &str, msg: &Message) {
        let handler = self
            .objects
            .borrow()
            .get(path)
            .cloned()
            .unwrap_or_else(|| panic!("no handler for {}", path));
        handler(msg);
    }

    fn deliver_signal(&self, msg: &Message) {
        let handlers: Vec<SignalHandler> = self
            .filters
            .borrow()
            .values()
            .filter(|(filter, _)| filter.matches(msg))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(msg);
        }
    }

    fn filter_members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .filters
            .borrow()
            .values()
            .filter_map(|(filter, _)| filter.member.clone())
            .collect();
        members.sort();
        members
    }

    fn object_count(&self) -> usize {
        self.objects.borrow().len()
    }

    fn filter_count(&self) -> usize {
        self.filters.borrow().len()
    }

    fn has_object(&self, path: &str) -> bool {
        self.objects.borrow().contains_key(path)
    }
}

impl Broker for RecordingBroker {
    fn unique_name(&self) -> Option<String> {
        Some(":1.42".to_string())
    }

    fn send(&self, mut msg: Message) -> Result<u32, ClientError> {
        self.next_serial.set(self.next_serial.get() + 1);
        msg.set_serial(self.next_serial.get());
        self.sent.borrow_mut().push(msg);
        Ok(self.next_serial.get())
    }

    fn send_async(
        &self,
        mut msg: Message,
        _timeout: Duration,
        handler: ReplyHandler,
    ) -> Result<u32, ClientError> {
        self.next_serial.set(self.next_serial.get() + 1);
        msg.set_serial(self.next_serial.get());
        let interface = msg.interface().map(|i| i.to_string()).unwrap_or_default();
        let member = msg.member().map(|m| m.to_string()).unwrap_or_default();
        self.calls.borrow_mut().push((interface, member));
        self.pending.borrow_mut().push_back((msg, handler));
        Ok(self.next_serial.get())
    }

    fn add_signal_filter(
        &self,
        filter: Filter,
        handler: SignalHandler,
    ) -> Result<FilterToken, ClientError> {
        let id = self.next_token.get();
        self.next_token.set(id + 1);
        self.filters.borrow_mut().insert(id, (filter, handler));
        Ok(FilterToken::new(id))
    }

    fn remove_filter(&self, token: FilterToken) {
        self.filters.borrow_mut().remove(&token.value());
    }

    fn register_object(
        &self,
        path: &str,
        _interface: Option<&str>,
        handler: SignalHandler,
    ) -> Result<(), ClientError> {
        self.objects.borrow_mut().insert(path.to_string(), handler);
        Ok(())
    }

    fn unregister_object(&self, path: &str) {
        self.objects.borrow_mut().remove(path);
    }
}

/// Scripted Wi-Fi backend.
#[derive(Default)]
struct FakeWifi {
    scan_complete: RefCell<Option<Box<dyn Fn()>>>,
    state_change: RefCell<Option<Box<dyn Fn()>>>,
    ap_mode: RefCell<Option<Box<dyn Fn(bool)>>>,
    results: RefCell<Vec<ScanEntry>>,
    status: RefCell<WifiStatus>,
    connects: RefCell<Vec<ConnectRequest>>,
    tokens: RefCell<Vec<String>>,
    scans: Cell<u32>,
}

impl FakeWifi {
    fn fire_scan_complete(&self) {
        let callback = self.scan_complete.borrow();
        callback.as_ref().expect("scan callback not registered")();
    }

    fn fire_state_change(&self) {
        let callback = self.state_change.borrow();
        callback.as_ref().expect("state callback not registered")();
    }

    fn fire_ap_mode(&self, enable: bool) {
        let callback = self.ap_mode.borrow();
        callback.as_ref().expect("ap-mode callback not registered")(enable);
    }
}

impl WifiControl for FakeWifi {
    fn dsn(&self) -> Option<String> {
        Some("AC000W000000001".to_string())
    }

    fn start_scan(&self) {
        self.scans.set(self.scans.get() + 1);
    }

    fn scan_results(&self, limit: usize) -> Vec<ScanEntry> {
        self.results.borrow().iter().take(limit).cloned().collect()
    }

    fn connect(&self, request: &ConnectRequest) {
        self.connects.borrow_mut().push(request.clone());
    }

    fn status(&self) -> WifiStatus {
        self.status.borrow().clone()
    }

    fn set_setup_token(&self, token: &str) {
        self.tokens.borrow_mut().push(token.to_string());
    }

    fn on_scan_complete(&self, callback: Box<dyn Fn()>) {
        *self.scan_complete.borrow_mut() = Some(callback);
    }

    fn on_connect_state_change(&self, callback: Box<dyn Fn()>) {
        *self.state_change.borrow_mut() = Some(callback);
    }

    fn on_ap_mode_change(&self, callback: Box<dyn Fn(bool)>) {
        *self.ap_mode.borrow_mut() = Some(callback);
    }
}

struct Harness {
    reactor: Rc<Reactor>,
    broker: Rc<RecordingBroker>,
    wifi: Rc<FakeWifi>,
    service: Rc<GattService>,
}

impl Harness {
    fn new() -> Harness {
        let reactor = Rc::new(Reactor::new().unwrap());
        let broker = Rc::new(RecordingBroker::default());
        let wifi = Rc::new(FakeWifi::default());
        let service =
            GattService::new(reactor.clone(), broker.clone(), wifi.clone(), Config::default());
        service.start();
        Harness {
            reactor,
            broker,
            wifi,
            service,
        }
    }

    /// Run one reactor iteration; zero-delay timers fire immediately.
    fn turn(&self) {
        self.reactor.turn(Some(Duration::from_millis(20))).unwrap();
    }

    /// Wait out the initial one-second step delay.
    fn pass_init(&self) {
        assert_eq!(self.service.state(), BringUp::PowerOn);
        self.reactor
            .turn(Some(Duration::from_millis(1200)))
            .unwrap();
    }

    fn managed_objects_reply(call: &Message) -> Result<Message, ClientError> {
        let mut tree: HashMap<Path<'static>, HashMap<String, PropMap>> = HashMap::new();
        let mut entry = HashMap::new();
        entry.insert(bluez::ADAPTER_IFACE.to_string(), PropMap::new());
        tree.insert(Path::from("/org/bluez/hci0"), entry);
        Ok(call.method_return().append1(tree))
    }

    fn bring_up_to_waiting(&self) {
        self.pass_init();

        // Powered=true
        self.broker.complete_next(|call| Ok(call.method_return()));
        assert_eq!(self.service.state(), BringUp::RegAgent);
        self.turn();

        // RegisterAgent
        self.broker.complete_next(|call| Ok(call.method_return()));
        assert_eq!(self.service.state(), BringUp::RegDefaultAgent);
        self.turn();

        // RequestDefaultAgent
        self.broker.complete_next(|call| Ok(call.method_return()));
        assert_eq!(self.service.state(), BringUp::GetLocalAddr);
        self.turn();

        // Get(Adapter1, Address)
        self.broker
            .complete_next(|call| Ok(call.method_return().append1(Variant("AA:BB:CC:DD:EE:FF"))));
        assert_eq!(self.service.state(), BringUp::SignalSubscribe);
        self.turn();
        assert_eq!(self.service.state(), BringUp::RequestManagedObjects);
        self.turn();

        // GetManagedObjects
        self.broker.complete_next(Self::managed_objects_reply);
        assert_eq!(self.service.state(), BringUp::Waiting);
        self.turn();
    }

    fn bring_up_to_ready(&self) {
        self.bring_up_to_waiting();
        self.wifi.fire_ap_mode(true);
        assert_eq!(self.service.state(), BringUp::RegAppPaths);
        self.turn();
        assert_eq!(self.service.state(), BringUp::RegApp);
        self.turn();

        // RegisterApplication
        self.broker.complete_next(|call| Ok(call.method_return()));
        assert_eq!(self.service.state(), BringUp::RegAdvPath);
        self.turn();
        assert_eq!(self.service.state(), BringUp::RegAdv);
        self.turn();

        // RegisterAdvertisement
        self.broker.complete_next(|call| Ok(call.method_return()));
        assert_eq!(self.service.state(), BringUp::Ready);
        self.turn();
        self.broker.take_sent();
    }

    fn chrc_call(path: &str, member: &str) -> Message {
        let mut msg = Message::new_method_call(":1.55", path, bluez::GATT_CHRC_IFACE, member).unwrap();
        msg.set_serial(1);
        msg
    }

    fn write_value(&self, path: &str, value: Vec<u8>) -> Message {
        self.broker.take_sent();
        let msg = Self::chrc_call(path, "WriteValue").append1(value);
        self.broker.invoke_object(path, &msg);
        self.broker
            .take_sent()
            .pop()
            .expect("write produced no reply")
    }

    fn read_value(&self, path: &str) -> Vec<u8> {
        self.broker.take_sent();
        let msg = Self::chrc_call(path, "ReadValue");
        self.broker.invoke_object(path, &msg);
        let reply = self
            .broker
            .take_sent()
            .pop()
            .expect("read produced no reply");
        reply.read1().unwrap()
    }

    fn start_notify(&self, path: &str) {
        let msg = Self::chrc_call(path, "StartNotify");
        self.broker.invoke_object(path, &msg);
        self.broker.take_sent();
    }
}

fn value_of(signal: &Message) -> Vec<u8> {
    let (iface, props): (String, PropMap) = signal.read2().unwrap();
    assert_eq!(iface, bluez::GATT_CHRC_IFACE);
    prop_cast::<Vec<u8>>(&props, "Value").unwrap().clone()
}

#[test]
fn bring_up_follows_the_exact_call_sequence() {
    let h = Harness::new();
    h.bring_up_to_waiting();

    let calls = h.broker.calls.borrow().clone();
    let expected = vec![
        (bluez::PROPERTIES_IFACE.to_string(), "Set".to_string()),
        (
            bluez::AGENT_MANAGER_IFACE.to_string(),
            "RegisterAgent".to_string(),
        ),
        (
            bluez::AGENT_MANAGER_IFACE.to_string(),
            "RequestDefaultAgent".to_string(),
        ),
        (bluez::PROPERTIES_IFACE.to_string(), "Get".to_string()),
        (
            bluez::OBJECT_MANAGER_IFACE.to_string(),
            "GetManagedObjects".to_string(),
        ),
    ];
    assert_eq!(calls, expected);

    // The two object-manager subscriptions went in between Get and
    // GetManagedObjects, and the adapter path got a properties
    // subscription from the managed-objects walk.
    let members = h.broker.filter_members();
    assert_eq!(
        members,
        vec![
            "InterfacesAdded".to_string(),
            "InterfacesRemoved".to_string(),
            "PropertiesChanged".to_string(),
        ]
    );
    assert_eq!(
        h.service.subscribed_paths(),
        vec!["/org/bluez/hci0".to_string()]
    );
}

#[test]
fn the_local_name_derives_from_the_adapter_address() {
    let h = Harness::new();
    h.bring_up_to_ready();

    let mut msg = Message::new_method_call(
        ":1.55",
        bluez::ADV_PATH,
        bluez::PROPERTIES_IFACE,
        "GetAll",
    )
    .unwrap()
    .append1("org.bluez.LEAdvertisement1");
    msg.set_serial(1);
    h.broker.invoke_object(bluez::ADV_PATH, &msg);

    let reply = h.broker.take_sent().pop().expect("GetAll got no reply");
    let props: PropMap = reply.read1().unwrap();
    let name: &String = prop_cast(&props, "LocalName").unwrap();
    assert_eq!(name, "Ayla-AABBCCDDEEFF");
    assert_eq!(name.len(), 17);
    let uuids: &Vec<String> = prop_cast(&props, "ServiceUUIDs").unwrap();
    assert_eq!(uuids, &vec![bluez::CONFIG_SERVICE_UUID.to_string()]);
}

#[test]
fn scan_results_notify_with_big_endian_rssi_and_a_terminator() {
    let h = Harness::new();
    h.bring_up_to_ready();
    h.start_notify(bluez::RESULT_CHRC_PATH);

    *h.wifi.results.borrow_mut() = vec![
        ScanEntry {
            ssid: b"Home".to_vec(),
            bssid: [1, 2, 3, 4, 5, 6],
            rssi: -42,
            security: Security::Wpa2Personal,
        },
        ScanEntry {
            ssid: b"Guest".to_vec(),
            bssid: [1, 2, 3, 4, 5, 7],
            rssi: -70,
            security: Security::Open,
        },
    ];

    // The peer kicks off the scan...
    let reply = h.write_value(bluez::SCAN_CHRC_PATH, vec![b'1']);
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    assert_eq!(h.wifi.scans.get(), 1);

    // ...and the collaborator reports completion.
    h.broker.take_sent();
    h.wifi.fire_scan_complete();

    let signals = h.broker.take_sent();
    assert_eq!(signals.len(), 3);
    for signal in &signals {
        assert_eq!(signal.msg_type(), MessageType::Signal);
        assert_eq!(&*signal.path().unwrap(), bluez::RESULT_CHRC_PATH);
        assert_eq!(&*signal.member().unwrap(), "PropertiesChanged");
    }

    let first = value_of(&signals[0]);
    assert_eq!(first.len(), SCAN_RESULT_LEN);
    assert_eq!(&first[1..5], b"Home");
    assert_eq!(&first[40..42], &[0xFF, 0xD6]);
    assert_eq!(first[42], 3);

    let second = value_of(&signals[1]);
    assert_eq!(second[0], 1);
    assert_eq!(&second[40..42], &[0xFF, 0xBA]);

    let terminator = value_of(&signals[2]);
    assert_eq!(terminator.len(), SCAN_RESULT_LEN);
    assert!(terminator.iter().all(|b| *b == 0));
}

#[test]
fn connect_writes_reach_the_collaborator_and_notify_state() {
    let h = Harness::new();
    h.bring_up_to_ready();
    h.start_notify(bluez::STATE_CHRC_PATH);
    assert!(h.service.status_notify_enabled());

    let mut value = vec![0u8; CONNECT_LEN];
    value[0..4].copy_from_slice(b"Home");
    value[32] = 4;
    value[39..47].copy_from_slice(b"secret12");
    value[103] = 8;
    value[104] = 3;
    let reply = h.write_value(bluez::CONNECT_CHRC_PATH, value);
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);

    let connects = h.wifi.connects.borrow();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].ssid, b"Home");
    assert_eq!(connects[0].key, b"secret12");
    assert_eq!(connects[0].bssid, [0; 6]);
    assert_eq!(connects[0].security, Security::Wpa2Personal);
    drop(connects);

    // The collaborator starts joining and reports the change.
    *h.wifi.status.borrow_mut() = WifiStatus {
        ssid: b"Home".to_vec(),
        error: WifiError::None,
        state: ConnState::Joining,
    };
    h.broker.take_sent();
    h.wifi.fire_state_change();

    let signals = h.broker.take_sent();
    assert_eq!(signals.len(), 1);
    assert_eq!(&*signals[0].path().unwrap(), bluez::STATE_CHRC_PATH);
    let value = value_of(&signals[0]);
    assert_eq!(&value[0..4], b"Home");
    assert_eq!(value[32], 4);
    assert_eq!(value[33], 0);
    assert_eq!(value[34], 2);
}

#[test]
fn interfaces_removed_drops_the_subscription_and_reasserts_later() {
    let h = Harness::new();
    h.bring_up_to_ready();
    assert_eq!(
        h.service.subscribed_paths(),
        vec!["/org/bluez/hci0".to_string()]
    );

    let signal = Message::new_signal("/", bluez::OBJECT_MANAGER_IFACE, "InterfacesRemoved")
        .unwrap()
        .append2(
            Path::from("/org/bluez/hci0"),
            vec![bluez::ADAPTER_IFACE.to_string()],
        );
    h.broker.deliver_signal(&signal);

    assert!(h.service.subscribed_paths().is_empty());
    // The service stays up; only the delayed advertising re-assert was
    // scheduled.
    assert_eq!(h.service.state(), BringUp::Ready);
}

#[test]
fn interfaces_added_subscribes_new_devices() {
    let h = Harness::new();
    h.bring_up_to_waiting();

    let mut ifaces: HashMap<String, PropMap> = HashMap::new();
    ifaces.insert(bluez::DEVICE_IFACE.to_string(), PropMap::new());
    let signal = Message::new_signal("/", bluez::OBJECT_MANAGER_IFACE, "InterfacesAdded")
        .unwrap()
        .append2(Path::from("/org/bluez/hci0/dev_AA_BB"), ifaces);
    h.broker.deliver_signal(&signal);

    let mut paths = h.service.subscribed_paths();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/org/bluez/hci0".to_string(),
            "/org/bluez/hci0/dev_AA_BB".to_string(),
        ]
    );
}

#[test]
fn start_notify_is_idempotent() {
    let h = Harness::new();
    h.bring_up_to_ready();

    h.start_notify(bluez::STATE_CHRC_PATH);
    assert!(h.service.status_notify_enabled());
    h.start_notify(bluez::STATE_CHRC_PATH);
    assert!(h.service.status_notify_enabled());

    // No notifications were produced by the subscription itself.
    assert!(h.broker.take_sent().is_empty());
}

#[test]
fn overlong_writes_are_rejected_without_touching_state() {
    let h = Harness::new();
    h.bring_up_to_ready();

    let reply = h.write_value(bluez::CONNECT_CHRC_PATH, vec![1u8; CONNECT_LEN + 1]);
    assert_eq!(reply.msg_type(), MessageType::Error);
    assert!(h.wifi.connects.borrow().is_empty());

    let reply = h.write_value(bluez::SETUP_TOKEN_CHRC_PATH, vec![b'x'; 9]);
    assert_eq!(reply.msg_type(), MessageType::Error);
    assert!(h.wifi.tokens.borrow().is_empty());
}

#[test]
fn setup_token_passes_through() {
    let h = Harness::new();
    h.bring_up_to_ready();

    let reply = h.write_value(bluez::SETUP_TOKEN_CHRC_PATH, b"tok42".to_vec());
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    assert_eq!(*h.wifi.tokens.borrow(), vec!["tok42".to_string()]);
}

#[test]
fn result_reads_advance_a_cursor_and_end_with_the_terminator() {
    let h = Harness::new();
    h.bring_up_to_ready();

    *h.wifi.results.borrow_mut() = vec![
        ScanEntry {
            ssid: b"One".to_vec(),
            bssid: [1; 6],
            rssi: -10,
            security: Security::Wpa,
        },
        ScanEntry {
            ssid: b"Two".to_vec(),
            bssid: [2; 6],
            rssi: -20,
            security: Security::Wep,
        },
    ];
    h.write_value(bluez::SCAN_CHRC_PATH, vec![b'1']);

    let first = h.read_value(bluez::RESULT_CHRC_PATH);
    assert_eq!(first[0], 0);
    assert_eq!(&first[1..4], b"One");
    let second = h.read_value(bluez::RESULT_CHRC_PATH);
    assert_eq!(second[0], 1);
    assert_eq!(&second[1..4], b"Two");
    let third = h.read_value(bluez::RESULT_CHRC_PATH);
    assert!(third.iter().all(|b| *b == 0));
    // Still terminated on further reads.
    let fourth = h.read_value(bluez::RESULT_CHRC_PATH);
    assert!(fourth.iter().all(|b| *b == 0));
}

#[test]
fn identity_reads_return_dsn_and_duid() {
    let h = Harness::new();
    h.bring_up_to_ready();

    let dsn = h.read_value(bluez::DSN_CHRC_PATH);
    assert_eq!(dsn, b"AC000W000000001".to_vec());

    let duid = h.read_value(bluez::DUID_CHRC_PATH);
    assert_eq!(duid, b"AA:BB:CC:DD:EE:FF".to_vec());
}

#[test]
fn closing_the_window_regresses_to_waiting_and_releases_objects() {
    let h = Harness::new();
    h.bring_up_to_ready();
    let populated = h.broker.object_count();
    // Agent, advertisement, root, and the eleven application paths.
    assert_eq!(populated, 14);

    h.wifi.fire_ap_mode(false);
    assert_eq!(h.service.state(), BringUp::Ready);

    // The tear-down runs from the delayed advertising update.
    h.reactor.turn(Some(Duration::from_millis(1200))).unwrap();
    assert_eq!(h.service.state(), BringUp::Waiting);
    assert!(h.broker.has_object(bluez::AGENT_PATH));
    assert!(!h.broker.has_object(bluez::ADV_PATH));
    assert!(!h.broker.has_object(bluez::CONNECT_CHRC_PATH));
    assert_eq!(h.broker.object_count(), 1);

    // Re-opening the window brings the application back without repeating
    // the early bring-up steps.
    h.wifi.fire_ap_mode(true);
    assert_eq!(h.service.state(), BringUp::RegAppPaths);
}

#[test]
fn cleanup_leaves_no_live_registrations() {
    let h = Harness::new();
    h.bring_up_to_ready();

    h.service.cleanup();
    assert_eq!(h.broker.object_count(), 0);
    assert_eq!(h.broker.filter_count(), 0);
}
