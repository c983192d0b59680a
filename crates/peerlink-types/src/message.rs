//! The message model exchanged between platforms.
//!
//! A [`Message`] is an insertion-ordered map of string keys to typed
//! [`Value`]s. It is both the wire envelope and the payload handed to local
//! delivery. Every message carries a `process` discriminator (see
//! [`Process`]) that decides whether it is platform-management traffic or an
//! application message.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Reserved message keys.
pub mod keys {
    /// Routing discriminator, see [`super::Process`].
    pub const PROCESS: &str = "process";
    /// Host the sender advertises.
    pub const SENDER_ADDRESS: &str = "sender-address";
    /// Listening port of the sender.
    pub const SENDER_PORT: &str = "sender-port";
    /// Platform ids of every node that sent or relayed the message.
    pub const SENDER_NODE_LOG: &str = "sender-node-log";
    /// Resync request; the value is the requesting node's name.
    pub const INITIALIZE_PROPAGATION: &str = "initialize-propagation";
    /// Remote shutdown notice.
    pub const SHUTDOWN: &str = "shutdown";
    /// Node location announcement.
    pub const LOCATION: &str = "location";
    /// Piggy-backed application event.
    pub const EVENT: &str = "event";
    /// Local recipient of an application message.
    pub const RECIPIENT: &str = "recipient";
    /// Already-resolved delivery target.
    pub const TARGET: &str = "target";
    /// Role selector of a rolecast.
    pub const ROLE: &str = "role";
    /// Connection key a heartbeat probe refers to.
    pub const HEARTBEAT_KEY: &str = "heartbeat-key";

    /// Keys that never describe directory entries.
    pub const RESERVED: &[&str] = &[
        PROCESS,
        SENDER_ADDRESS,
        SENDER_PORT,
        SENDER_NODE_LOG,
        INITIALIZE_PROPAGATION,
        SHUTDOWN,
        LOCATION,
        EVENT,
        RECIPIENT,
        TARGET,
        ROLE,
        HEARTBEAT_KEY,
    ];

    /// Returns true if `key` is one of the reserved protocol keys.
    pub fn is_reserved(key: &str) -> bool {
        RESERVED.contains(&key)
    }
}

/// Directory diff actions carried as values of management messages.
pub mod actions {
    /// Agent name was added on the sending peer.
    pub const ADD: &str = "add";
    /// Agent name was removed on the sending peer.
    pub const REMOVE: &str = "remove";
    /// The key is the sending peer's platform id.
    pub const PLATFORM_ID: &str = "platform-id";
}

/// The `process` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Process {
    /// Runtime-to-runtime directory traffic.
    Management,
    /// Application message for one local recipient.
    Deliver,
    /// Application message for every local agent.
    Broadcast,
    /// Application message for every local agent playing a role.
    RoleCast,
    /// Liveness probe.
    HeartbeatRequest,
    /// Answer to a liveness probe.
    HeartbeatResponse,
}

impl Process {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Management => "management",
            Self::Deliver => "deliver",
            Self::Broadcast => "broadcast",
            Self::RoleCast => "rolecast",
            Self::HeartbeatRequest => "heartbeat-request",
            Self::HeartbeatResponse => "heartbeat-response",
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Process {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "management" => Ok(Self::Management),
            "deliver" => Ok(Self::Deliver),
            "broadcast" => Ok(Self::Broadcast),
            "rolecast" => Ok(Self::RoleCast),
            "heartbeat-request" => Ok(Self::HeartbeatRequest),
            "heartbeat-response" => Ok(Self::HeartbeatResponse),
            other => Err(format!("unknown process discriminator '{other}'")),
        }
    }
}

/// A typed message value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Set(BTreeSet<String>),
    Map(Message),
}

impl Value {
    /// Borrow the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow the set content, if this is a set.
    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the nested map, if this is a map.
    pub fn as_map(&self) -> Option<&Message> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<BTreeSet<String>> for Value {
    fn from(s: BTreeSet<String>) -> Self {
        Self::Set(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<Message> for Value {
    fn from(m: Message) -> Self {
        Self::Map(m)
    }
}

/// An insertion-ordered string-keyed map of [`Value`]s.
///
/// Keys are unique: inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    entries: Vec<(String, Value)>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message with its `process` discriminator set.
    pub fn with_process(process: Process) -> Self {
        let mut msg = Self::new();
        msg.set_process(process);
        msg
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a value, returning the previous one for that key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Borrow a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Remove a key, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the message into its ordered entries.
    pub fn into_entries(self) -> Vec<(String, Value)> {
        self.entries
    }

    /// Build a message from ordered entries; later duplicates replace earlier ones.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut msg = Self::new();
        for (k, v) in entries {
            msg.insert(k, v);
        }
        msg
    }

    /// The parsed `process` discriminator, if present and known.
    pub fn process(&self) -> Option<Process> {
        self.get_str(keys::PROCESS).and_then(|s| s.parse().ok())
    }

    pub fn set_process(&mut self, process: Process) {
        self.insert(keys::PROCESS, process.as_str());
    }

    /// Platform ids this message has travelled through.
    pub fn node_log(&self) -> BTreeSet<String> {
        self.get(keys::SENDER_NODE_LOG)
            .and_then(Value::as_set)
            .cloned()
            .unwrap_or_default()
    }

    /// Append a platform id to the loop-prevention trail.
    pub fn append_node_log(&mut self, platform_id: &str) {
        let mut log = self.node_log();
        log.insert(platform_id.to_string());
        self.insert(keys::SENDER_NODE_LOG, log);
    }

    /// Short description used in log lines.
    pub fn summary(&self) -> String {
        let process = self.get_str(keys::PROCESS).unwrap_or("<none>");
        let shown: Vec<&str> = self
            .keys()
            .filter(|k| *k != keys::PROCESS)
            .take(4)
            .collect();
        let more = self.len().saturating_sub(shown.len() + 1);
        if more > 0 {
            format!("process={process} keys=[{}, +{more}]", shown.join(", "))
        } else {
            format!("process={process} keys=[{}]", shown.join(", "))
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MessageVisitor;

        impl<'de> Visitor<'de> for MessageVisitor {
            type Value = Message;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string-keyed map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Message, A::Error> {
                let mut msg = Message::new();
                while let Some((k, v)) = access.next_entry::<String, Value>()? {
                    msg.insert(k, v);
                }
                Ok(msg)
            }
        }

        deserializer.deserialize_map(MessageVisitor)
    }
}
