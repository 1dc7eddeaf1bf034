//! Lenient message-argument parsing and small message builders.
//!
//! The parse helpers read a basic value out of the argument the iterator is
//! positioned on, descending through variants, and accepting any argument
//! type losslessly convertible to the requested one. They do not advance the
//! iterator; callers step with [`dbus::arg::Iter::next`]. A `None` return
//! means the argument was absent or of an unusable type; callers are
//! expected to drop the message without mutating any state.

use dbus::arg::{Append, Arg, ArgType, Iter, Variant};
use dbus::Message;

const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

pub fn parse_bool(iter: &mut Iter) -> Option<bool> {
    match iter.arg_type() {
        ArgType::Variant => parse_bool(&mut iter.recurse(ArgType::Variant)?),
        ArgType::Boolean => iter.get::<bool>(),
        ArgType::Byte => iter.get::<u8>().map(|v| v != 0),
        ArgType::Int16 => iter.get::<i16>().map(|v| v != 0),
        ArgType::UInt16 => iter.get::<u16>().map(|v| v != 0),
        ArgType::Int32 => iter.get::<i32>().map(|v| v != 0),
        ArgType::UInt32 => iter.get::<u32>().map(|v| v != 0),
        _ => None,
    }
}

pub fn parse_i64(iter: &mut Iter) -> Option<i64> {
    match iter.arg_type() {
        ArgType::Variant => parse_i64(&mut iter.recurse(ArgType::Variant)?),
        ArgType::Int16 => iter.get::<i16>().map(i64::from),
        ArgType::Int32 => iter.get::<i32>().map(i64::from),
        ArgType::Int64 => iter.get::<i64>(),
        _ => None,
    }
}

pub fn parse_u32(iter: &mut Iter) -> Option<u32> {
    match iter.arg_type() {
        ArgType::Variant => parse_u32(&mut iter.recurse(ArgType::Variant)?),
        ArgType::Byte => iter.get::<u8>().map(u32::from),
        ArgType::UInt16 => iter.get::<u16>().map(u32::from),
        ArgType::UInt32 => iter.get::<u32>(),
        _ => None,
    }
}

pub fn parse_u64(iter: &mut Iter) -> Option<u64> {
    match iter.arg_type() {
        ArgType::Variant => parse_u64(&mut iter.recurse(ArgType::Variant)?),
        ArgType::Byte => iter.get::<u8>().map(u64::from),
        ArgType::UInt16 => iter.get::<u16>().map(u64::from),
        ArgType::UInt32 => iter.get::<u32>().map(u64::from),
        ArgType::UInt64 => iter.get::<u64>(),
        _ => None,
    }
}

pub fn parse_f64(iter: &mut Iter) -> Option<f64> {
    match iter.arg_type() {
        ArgType::Variant => parse_f64(&mut iter.recurse(ArgType::Variant)?),
        ArgType::Double => iter.get::<f64>(),
        _ => None,
    }
}

/// Read a string, object path or signature, descending variants.
pub fn parse_str<'a>(iter: &mut Iter<'a>) -> Option<&'a str> {
    match iter.arg_type() {
        ArgType::Variant => parse_str(&mut iter.recurse(ArgType::Variant)?),
        ArgType::String | ArgType::ObjectPath | ArgType::Signature => iter.get::<&str>(),
        _ => None,
    }
}

/// Read a byte array (`ay`), descending variants.
pub fn parse_byte_array(iter: &mut Iter) -> Option<Vec<u8>> {
    match iter.arg_type() {
        ArgType::Variant => parse_byte_array(&mut iter.recurse(ArgType::Variant)?),
        ArgType::Array => iter.get::<Vec<u8>>(),
        _ => None,
    }
}

/// Enter the dict entry the iterator is positioned on, returning its string
/// key and an iterator positioned on its value.
pub fn parse_dict_entry<'a>(iter: &mut Iter<'a>) -> Option<(&'a str, Iter<'a>)> {
    if iter.arg_type() != ArgType::DictEntry {
        return None;
    }
    let mut entry = iter.recurse(ArgType::DictEntry)?;
    let key = parse_str(&mut entry)?;
    if !entry.next() {
        return None;
    }
    Some((key, entry))
}

/// Build a `Properties.Get` call.
pub fn prop_get(
    destination: &str,
    path: &str,
    interface: &str,
    name: &str,
) -> Result<Message, String> {
    Ok(
        Message::new_method_call(destination, path, PROPERTIES_IFACE, "Get")?
            .append2(interface, name),
    )
}

/// Build a `Properties.Set` call. The value is wrapped in a variant; the
/// `dbus` crate widens booleans to their four-byte wire form and boxes
/// strings as the broker expects.
pub fn prop_set<T: Append + Arg>(
    destination: &str,
    path: &str,
    interface: &str,
    name: &str,
    value: T,
) -> Result<Message, String> {
    Ok(
        Message::new_method_call(destination, path, PROPERTIES_IFACE, "Set")?.append3(
            interface,
            name,
            Variant(value),
        ),
    )
}

/// One-line summary of a message, for trace logging.
pub fn describe(msg: &Message) -> String {
    format!(
        "{:?}: {} -> {} {}[{}]::{}",
        msg.msg_type(),
        msg.sender().as_deref().unwrap_or("-"),
        msg.destination().as_deref().unwrap_or("-"),
        msg.interface().as_deref().unwrap_or("-"),
        msg.path().as_deref().unwrap_or("-"),
        msg.member().as_deref().unwrap_or("-"),
    )
}
