//! The seam between the provisioning service and the message-bus client.
//!
//! The service talks to the broker exclusively through this trait so that
//! tests can substitute a recording implementation. All handlers run on the
//! reactor thread; the service therefore never calls a blocking send from
//! inside one of them.

use ayla_dbus_client::{Client, ClientError, Filter, FilterToken};
use dbus::Message;
use std::rc::Rc;
use std::time::Duration;

pub trait Broker {
    /// The unique bus name of this connection, when known.
    fn unique_name(&self) -> Option<String>;

    /// Send a message (signal, reply or fire-and-forget call).
    fn send(&self, msg: Message) -> Result<u32, ClientError>;

    /// Send a method call; the handler receives the reply, a peer error or
    /// a timeout on the reactor thread.
    fn send_async(
        &self,
        msg: Message,
        timeout: Duration,
        handler: Box<dyn FnOnce(Result<Message, ClientError>)>,
    ) -> Result<u32, ClientError>;

    /// Subscribe to signals selected by `filter`, installing the matching
    /// broker-side rule.
    fn add_signal_filter(
        &self,
        filter: Filter,
        handler: Rc<dyn Fn(&Message)>,
    ) -> Result<FilterToken, ClientError>;

    fn remove_filter(&self, token: FilterToken);

    /// Claim an object path; method calls addressed to it are delivered to
    /// `handler`, which replies itself.
    fn register_object(
        &self,
        path: &str,
        interface: Option<&str>,
        handler: Rc<dyn Fn(&Message)>,
    ) -> Result<(), ClientError>;

    fn unregister_object(&self, path: &str);
}

impl Broker for Client {
    fn unique_name(&self) -> Option<String> {
        Client::unique_name(self)
    }

    fn send(&self, msg: Message) -> Result<u32, ClientError> {
        Client::send(self, msg)
    }

    fn send_async(
        &self,
        msg: Message,
        timeout: Duration,
        handler: Box<dyn FnOnce(Result<Message, ClientError>)>,
    ) -> Result<u32, ClientError> {
        Client::send_async(self, msg, timeout, handler)
    }

    fn add_signal_filter(
        &self,
        filter: Filter,
        handler: Rc<dyn Fn(&Message)>,
    ) -> Result<FilterToken, ClientError> {
        Client::add_filter(self, Some(filter), move |msg| handler(msg))
    }

    fn remove_filter(&self, token: FilterToken) {
        Client::remove_filter(self, token);
    }

    fn register_object(
        &self,
        path: &str,
        interface: Option<&str>,
        handler: Rc<dyn Fn(&Message)>,
    ) -> Result<(), ClientError> {
        Client::register_object(self, path, interface, move |msg| handler(msg))
    }

    fn unregister_object(&self, path: &str) {
        Client::unregister_object(self, path);
    }
}
