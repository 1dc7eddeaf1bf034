//! A callback-driven D-Bus client runtime for single-threaded daemons.
//!
//! This crate pairs the low-level [`dbus`] channel with an
//! [`ayla_reactor::Reactor`]: socket readiness and dispatch both run as
//! reactor callbacks, so every message handler executes on the reactor
//! thread and no locking is needed anywhere.
//!
//! Start by creating a [`Client`] with [`Client::connect`]. Incoming
//! messages are routed, in order, to the pending-reply table (keyed by the
//! serial of the outgoing call), to every matching [`Filter`] handler, and,
//! for method calls, to the handler registered for the target object path.
//! Method calls addressed to a path nobody registered are answered with an
//! error so the caller is not left waiting.

pub mod args;
mod filter;

pub use crate::filter::Filter;

use ayla_reactor::{Reactor, ReactorError, Readiness};
use dbus::channel::{BusType, Channel};
use dbus::message::MessageType;
use dbus::strings::ErrorName;
use dbus::Message;
use log::{debug, trace, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default timeout for method calls, matching the bus daemon's own default.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_IFACE: &str = "org.freedesktop.DBus";
/// Error name returned for method calls addressed to unregistered paths.
const UNHANDLED_ERROR: &str = "org.bluez.Error.Rejected";
/// Error name the bus daemon uses for calls that got no reply in time.
const NO_REPLY_ERROR: &str = "org.freedesktop.DBus.Error.NoReply";

/// An error raised by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to the message bus")]
    NotConnected,
    #[error("message bus error: {0}")]
    Dbus(#[from] dbus::Error),
    #[error("message construction failed: {0}")]
    BadMessage(String),
    #[error("message send failed")]
    SendFailed,
    #[error("no reply within the timeout")]
    TimedOut,
    #[error("disconnected while a reply was pending")]
    Disconnected,
    #[error("call rejected by peer: {0}")]
    Peer(String),
    #[error("synchronous call attempted from a dispatch handler")]
    InDispatch,
    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

fn call_error(err: dbus::Error) -> ClientError {
    match err.name() {
        Some(NO_REPLY_ERROR) => ClientError::TimedOut,
        Some(name) => ClientError::Peer(name.to_string()),
        None => ClientError::Peer("unknown".to_string()),
    }
}

/// Handle returned by [`Client::add_filter`], used to remove the filter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FilterToken(u64);

impl FilterToken {
    /// Mint a token. Alternate broker front-ends hand these out; the client
    /// only honours tokens it issued itself.
    pub fn new(value: u64) -> FilterToken {
        FilterToken(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

type MessageHandler = Rc<dyn Fn(&Message)>;
type ReplyHandler = Box<dyn FnOnce(Result<Message, ClientError>)>;

struct FilterEntry {
    token: FilterToken,
    filter: Option<Filter>,
    handler: MessageHandler,
}

struct ObjectEntry {
    interface: Option<String>,
    handler: MessageHandler,
}

struct PendingCall {
    deadline: Instant,
    handler: ReplyHandler,
}

/// A connection to the system message bus, dispatching on a [`Reactor`].
pub struct Client {
    reactor: Rc<Reactor>,
    channel: RefCell<Option<Channel>>,
    unique_name: RefCell<Option<String>>,
    watched_fd: Cell<Option<RawFd>>,
    filters: RefCell<Vec<FilterEntry>>,
    objects: RefCell<HashMap<String, ObjectEntry>>,
    pending: RefCell<HashMap<u32, PendingCall>>,
    next_filter: Cell<u64>,
    dispatch_timer: RefCell<Option<ayla_reactor::Timer>>,
    expiry_timer: RefCell<Option<ayla_reactor::Timer>>,
    dispatching: Cell<bool>,
    tracing: Cell<bool>,
}

impl Client {
    /// Open a private connection to the system bus, obtain a unique name and
    /// hook socket readiness and dispatch into the reactor. Any messages the
    /// bus queued during registration are dispatched on the next iteration.
    pub fn connect(reactor: Rc<Reactor>) -> Result<Rc<Client>, ClientError> {
        let mut channel = Channel::get_private(BusType::System)?;
        channel.set_watch_enabled(true);
        let watch = channel.watch();
        let unique_name = channel.unique_name().map(|name| name.to_string());
        debug!(
            "connected to the system bus as {}",
            unique_name.as_deref().unwrap_or("?")
        );

        let client = Rc::new(Client {
            reactor: reactor.clone(),
            channel: RefCell::new(Some(channel)),
            unique_name: RefCell::new(unique_name),
            watched_fd: Cell::new(None),
            filters: RefCell::new(Vec::new()),
            objects: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashMap::new()),
            next_filter: Cell::new(0),
            dispatch_timer: RefCell::new(None),
            expiry_timer: RefCell::new(None),
            dispatching: Cell::new(false),
            tracing: Cell::new(false),
        });

        let weak = Rc::downgrade(&client);
        let dispatch_timer = reactor.timer(move || {
            if let Some(client) = weak.upgrade() {
                client.dispatch();
            }
        });
        *client.dispatch_timer.borrow_mut() = Some(dispatch_timer);

        let weak = Rc::downgrade(&client);
        let expiry_timer = reactor.timer(move || {
            if let Some(client) = weak.upgrade() {
                client.expire_pending();
            }
        });
        *client.expiry_timer.borrow_mut() = Some(expiry_timer);

        let weak = Rc::downgrade(&client);
        reactor.watch(watch.fd, Readiness::READABLE, move |readiness| {
            if let Some(client) = weak.upgrade() {
                client.socket_ready(readiness);
            }
        })?;
        client.watched_fd.set(Some(watch.fd));

        client.schedule_dispatch();
        Ok(client)
    }

    /// Flush and close the connection, failing every pending call with
    /// [`ClientError::Disconnected`] and releasing the handler registries.
    /// A no-op when not connected.
    pub fn disconnect(&self) {
        let channel = self.channel.borrow_mut().take();
        let Some(channel) = channel else {
            return;
        };
        self.fail_pending(|| ClientError::Disconnected);
        if let Some(fd) = self.watched_fd.take() {
            self.reactor.unwatch(fd);
        }
        if let Some(timer) = self.dispatch_timer.borrow().as_ref() {
            self.reactor.timer_cancel(timer);
        }
        if let Some(timer) = self.expiry_timer.borrow().as_ref() {
            self.reactor.timer_cancel(timer);
        }
        self.filters.borrow_mut().clear();
        self.objects.borrow_mut().clear();
        channel.flush();
        debug!("disconnected from the system bus");
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .borrow()
            .as_ref()
            .map_or(false, |channel| channel.is_connected())
    }

    /// The unique bus name assigned at connect.
    pub fn unique_name(&self) -> Option<String> {
        self.unique_name.borrow().clone()
    }

    /// Log a one-line summary of every inbound message.
    pub fn set_message_trace(&self, enable: bool) {
        self.tracing.set(enable);
    }

    /// Send a message without waiting for any reply. Outbound messages go
    /// out in call order.
    pub fn send(&self, msg: Message) -> Result<u32, ClientError> {
        let channel = self.channel.borrow();
        let channel = channel.as_ref().ok_or(ClientError::NotConnected)?;
        let serial = channel.send(msg).map_err(|_| ClientError::SendFailed)?;
        channel.flush();
        Ok(serial)
    }

    /// Send a method call; `handler` runs on the reactor thread with the
    /// reply, a peer error, or [`ClientError::TimedOut`] once `timeout`
    /// passes with no reply (late replies are dropped).
    pub fn send_async(
        &self,
        msg: Message,
        timeout: Duration,
        handler: impl FnOnce(Result<Message, ClientError>) + 'static,
    ) -> Result<u32, ClientError> {
        let serial = self.send(msg)?;
        self.pending.borrow_mut().insert(
            serial,
            PendingCall {
                deadline: Instant::now() + timeout,
                handler: Box::new(handler),
            },
        );
        self.arm_expiry();
        Ok(serial)
    }

    /// Send a method call and block on the bus socket until its reply
    /// arrives or `timeout` passes. Must not be called from inside a
    /// dispatch handler; use [`Client::send_async`] there.
    pub fn send_sync(&self, msg: Message, timeout: Duration) -> Result<Message, ClientError> {
        if self.dispatching.get() {
            return Err(ClientError::InDispatch);
        }
        let reply = {
            let channel = self.channel.borrow();
            let channel = channel.as_ref().ok_or(ClientError::NotConnected)?;
            channel.send_with_reply_and_block(msg, timeout)
        };
        // Unrelated messages queued while we were blocked are picked up on
        // the next reactor iteration.
        self.schedule_dispatch();
        reply.map_err(call_error)
    }

    /// Install an in-process filter; `None` matches every message. A filter
    /// selecting signals also installs the corresponding broker match rule.
    pub fn add_filter(
        &self,
        filter: Option<Filter>,
        handler: impl Fn(&Message) + 'static,
    ) -> Result<FilterToken, ClientError> {
        if let Some(filter) = filter.as_ref() {
            if filter.selects_signals() {
                self.bus_match("AddMatch", filter)?;
            }
        }
        let token = FilterToken(self.next_filter.get());
        self.next_filter.set(token.0 + 1);
        self.filters.borrow_mut().push(FilterEntry {
            token,
            filter,
            handler: Rc::new(handler),
        });
        Ok(token)
    }

    /// Convenience for the common case: subscribe to a signal by sender,
    /// interface, member and path.
    pub fn add_signal_filter(
        &self,
        sender: Option<&str>,
        interface: &str,
        member: &str,
        path: &str,
        handler: impl Fn(&Message) + 'static,
    ) -> Result<FilterToken, ClientError> {
        let mut filter = Filter::signal();
        filter.sender = sender.map(str::to_string);
        filter.interface = Some(interface.to_string());
        filter.member = Some(member.to_string());
        filter.path = Some(path.to_string());
        self.add_filter(Some(filter), handler)
    }

    /// Remove a filter; the matching broker rule is removed for signal
    /// filters. Unknown tokens are ignored.
    pub fn remove_filter(&self, token: FilterToken) {
        let removed = {
            let mut filters = self.filters.borrow_mut();
            match filters.iter().position(|entry| entry.token == token) {
                Some(index) => Some(filters.remove(index)),
                None => None,
            }
        };
        if let Some(entry) = removed {
            if let Some(filter) = entry.filter {
                if filter.selects_signals() {
                    if let Err(err) = self.bus_match("RemoveMatch", &filter) {
                        warn!("failed to remove match rule: {}", err);
                    }
                }
            }
        }
    }

    /// Claim `path`: method calls addressed to it are routed to `handler`,
    /// which is responsible for sending any reply. If `interface` is given,
    /// calls naming a different interface are not delivered. Re-registering
    /// a path replaces its handler.
    pub fn register_object(
        &self,
        path: &str,
        interface: Option<&str>,
        handler: impl Fn(&Message) + 'static,
    ) -> Result<(), ClientError> {
        let mut objects = self.objects.borrow_mut();
        if objects.contains_key(path) {
            warn!("object path {} re-registered", path);
        }
        objects.insert(
            path.to_string(),
            ObjectEntry {
                interface: interface.map(str::to_string),
                handler: Rc::new(handler),
            },
        );
        Ok(())
    }

    /// Release `path`. Unknown paths are ignored.
    pub fn unregister_object(&self, path: &str) {
        self.objects.borrow_mut().remove(path);
    }

    /// Number of object paths currently registered.
    pub fn registered_object_count(&self) -> usize {
        self.objects.borrow().len()
    }

    fn bus_match(&self, member: &str, filter: &Filter) -> Result<(), ClientError> {
        let rule = filter.match_rule(self.unique_name.borrow().as_deref());
        trace!("{} {}", member, rule);
        let mut msg = Message::new_method_call(DBUS_SERVICE, DBUS_PATH, DBUS_IFACE, member)
            .map_err(ClientError::BadMessage)?
            .append1(rule.as_str());
        msg.set_no_reply(true);
        self.send(msg)?;
        Ok(())
    }

    fn socket_ready(&self, _readiness: Readiness) {
        let alive = {
            let channel = self.channel.borrow();
            match channel.as_ref() {
                Some(channel) => channel.read_write(Some(Duration::from_millis(0))).is_ok(),
                None => return,
            }
        };
        if !alive {
            warn!("lost connection to the message bus");
            self.dispatch();
            self.fail_pending(|| ClientError::Disconnected);
            if let Some(fd) = self.watched_fd.take() {
                self.reactor.unwatch(fd);
            }
            return;
        }
        self.schedule_dispatch();
    }

    fn schedule_dispatch(&self) {
        if let Some(timer) = self.dispatch_timer.borrow().as_ref() {
            if !self.reactor.timer_scheduled(timer) {
                self.reactor.timer_set(timer, Duration::from_millis(0));
            }
        }
    }

    fn pop(&self) -> Option<Message> {
        let channel = self.channel.borrow();
        channel.as_ref().and_then(|channel| channel.pop_message())
    }

    /// Read more data off the socket; returns false when the connection is
    /// gone or nothing further can arrive right now.
    fn refill(&self) -> bool {
        let channel = self.channel.borrow();
        match channel.as_ref() {
            Some(channel) => channel.read_write(Some(Duration::from_millis(0))).is_ok(),
            None => false,
        }
    }

    fn dispatch(&self) {
        if self.dispatching.get() {
            return;
        }
        self.dispatching.set(true);
        loop {
            match self.pop() {
                Some(msg) => self.route(msg),
                None => {
                    // The readiness notification is edge-style; pull once
                    // more so a burst larger than one read is fully drained.
                    if !self.refill() {
                        break;
                    }
                    match self.pop() {
                        Some(msg) => self.route(msg),
                        None => break,
                    }
                }
            }
        }
        self.dispatching.set(false);
        if let Some(channel) = self.channel.borrow().as_ref() {
            channel.flush();
        }
    }

    fn route(&self, mut msg: Message) {
        if self.tracing.get() {
            debug!("{}", args::describe(&msg));
        }

        // Replies are consumed by their pending entry and seen by nobody
        // else; a reply whose call already timed out falls through.
        if let Some(serial) = msg.get_reply_serial() {
            let entry = self.pending.borrow_mut().remove(&serial);
            if let Some(call) = entry {
                let result = match msg.as_result() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(call_error(err)),
                };
                (call.handler)(result.map(|()| msg));
                return;
            }
            trace!("dropping stray reply to serial {}", serial);
            return;
        }

        let handlers: Vec<MessageHandler> = self
            .filters
            .borrow()
            .iter()
            .filter(|entry| {
                entry
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(&msg))
            })
            .map(|entry| entry.handler.clone())
            .collect();
        for handler in handlers {
            handler(&msg);
        }

        if msg.msg_type() as i32 == MessageType::MethodCall as i32 {
            let handler = msg.path().and_then(|path| {
                let objects = self.objects.borrow();
                objects.get(&*path).and_then(|entry| {
                    let wanted = match (&entry.interface, msg.interface()) {
                        (Some(registered), Some(called)) => registered.as_str() == &*called,
                        // Interface is optional on method calls.
                        _ => true,
                    };
                    wanted.then(|| entry.handler.clone())
                })
            });
            match handler {
                Some(handler) => handler(&msg),
                None => self.reject(&msg),
            }
        }
    }

    fn reject(&self, msg: &Message) {
        if msg.get_no_reply() {
            return;
        }
        warn!(
            "rejecting call to unhandled path {:?}",
            msg.path().as_deref().unwrap_or("-")
        );
        let reply = msg.error(&ErrorName::from(UNHANDLED_ERROR), &CString::default());
        if let Err(err) = self.send(reply) {
            warn!("failed to send rejection: {}", err);
        }
    }

    fn fail_pending(&self, error: impl Fn() -> ClientError) {
        let calls: Vec<PendingCall> = {
            let mut pending = self.pending.borrow_mut();
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in calls {
            (call.handler)(Err(error()));
        }
    }

    fn arm_expiry(&self) {
        let next = self
            .pending
            .borrow()
            .values()
            .map(|call| call.deadline)
            .min();
        if let Some(timer) = self.expiry_timer.borrow().as_ref() {
            match next {
                Some(deadline) => self
                    .reactor
                    .timer_set(timer, deadline.saturating_duration_since(Instant::now())),
                None => self.reactor.timer_cancel(timer),
            }
        }
    }

    fn expire_pending(&self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .borrow()
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(serial, _)| *serial)
            .collect();
        for serial in expired {
            let entry = self.pending.borrow_mut().remove(&serial);
            if let Some(call) = entry {
                warn!("method call {} timed out", serial);
                (call.handler)(Err(ClientError::TimedOut));
            }
        }
        self.arm_expiry();
    }
}
