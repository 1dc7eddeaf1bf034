use dbus::message::MessageType;
use dbus::Message;
use itertools::Itertools;

/// An in-process message filter, and the source of the broker-side match
/// rule installed for signal subscriptions.
///
/// A field left as `None` matches anything; a filter with every field unset
/// matches every message.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub msg_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub destination: Option<String>,
}

fn type_str(msg_type: MessageType) -> &'static str {
    match msg_type {
        MessageType::MethodCall => "method_call",
        MessageType::MethodReturn => "method_return",
        MessageType::Error => "error",
        MessageType::Signal => "signal",
    }
}

fn same_type(a: MessageType, b: MessageType) -> bool {
    a as i32 == b as i32
}

impl Filter {
    /// A filter selecting signal messages; callers fill in the rest.
    pub fn signal() -> Filter {
        Filter {
            msg_type: Some(MessageType::Signal),
            ..Filter::default()
        }
    }

    /// Whether this filter selects SIGNAL messages (and therefore needs a
    /// broker-side match rule).
    pub fn selects_signals(&self) -> bool {
        self.msg_type
            .map_or(false, |t| same_type(t, MessageType::Signal))
    }

    /// Evaluate the filter against a message. Fields are checked in order:
    /// message type, sender, interface, member, path, destination. A message
    /// without an interface only passes an interface filter when it is a
    /// method call, where the interface is optional.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(msg_type) = self.msg_type {
            if !same_type(msg_type, msg.msg_type()) {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            match msg.sender() {
                Some(value) if &*value == sender.as_str() => {}
                _ => return false,
            }
        }
        if let Some(interface) = &self.interface {
            match msg.interface() {
                Some(value) => {
                    if &*value != interface.as_str() {
                        return false;
                    }
                }
                None => {
                    if !same_type(msg.msg_type(), MessageType::MethodCall) {
                        return false;
                    }
                }
            }
        }
        if let Some(member) = &self.member {
            match msg.member() {
                Some(value) if &*value == member.as_str() => {}
                _ => return false,
            }
        }
        if let Some(path) = &self.path {
            match msg.path() {
                Some(value) if &*value == path.as_str() => {}
                _ => return false,
            }
        }
        if let Some(destination) = &self.destination {
            match msg.destination() {
                Some(value) if &*value == destination.as_str() => {}
                _ => return false,
            }
        }
        true
    }

    /// Render the broker-side match rule for this filter. Subscribing to
    /// messages addressed to another client additionally requires an
    /// eavesdrop rule, so one is appended when `destination` is set and
    /// differs from our own unique name.
    pub fn match_rule(&self, unique_name: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(msg_type) = self.msg_type {
            parts.push(format!("type='{}'", type_str(msg_type)));
        }
        if let Some(sender) = &self.sender {
            parts.push(format!("sender='{}'", sender));
        }
        if let Some(interface) = &self.interface {
            parts.push(format!("interface='{}'", interface));
        }
        if let Some(member) = &self.member {
            parts.push(format!("member='{}'", member));
        }
        if let Some(path) = &self.path {
            parts.push(format!("path='{}'", path));
        }
        if let Some(destination) = &self.destination {
            parts.push(format!("destination='{}'", destination));
            if let Some(name) = unique_name {
                if name != destination {
                    parts.push("eavesdrop='true'".to_string());
                }
            }
        }
        parts.iter().join(",")
    }
}
