//! Subscription target identity: services, topics, tags, subjects, aliases.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CoreError, InvalidKey};

/// Opaque identifier for a logical service, independent of where in the
/// cluster the service currently runs.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceKey(String);

impl ServiceKey {
    const MAX_LEN: usize = 128;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw = s.into();
        validate_key("service", &raw, Self::MAX_LEN)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceKey({:?})", self.0)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ServiceKey {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        ServiceKey::parse(s)
    }
}

impl From<ServiceKey> for String {
    fn from(key: ServiceKey) -> String {
        key.0
    }
}

/// Stable name of one stream published by a service.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicKey(String);

impl TopicKey {
    const MAX_LEN: usize = 128;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw = s.into();
        validate_key("topic", &raw, Self::MAX_LEN)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({:?})", self.0)
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TopicKey {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        TopicKey::parse(s)
    }
}

impl From<TopicKey> for String {
    fn from(key: TopicKey) -> String {
        key.0
    }
}

fn validate_key(kind: &'static str, raw: &str, max_len: usize) -> Result<(), CoreError> {
    if raw.is_empty() {
        return Err(InvalidKey {
            kind,
            raw: raw.to_string(),
            reason: "empty".into(),
        }
        .into());
    }
    if raw.len() > max_len {
        return Err(InvalidKey {
            kind,
            raw: raw.to_string(),
            reason: format!("length must be <= {max_len}"),
        }
        .into());
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(InvalidKey {
            kind,
            raw: raw.to_string(),
            reason: "contains control character".into(),
        }
        .into());
    }
    Ok(())
}

/// Unordered string key/value pairs disambiguating instance-scoped subjects.
///
/// Stored sorted so subjects are usable as map keys and serialize
/// deterministically.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

/// The (service, topic, tags) triple identifying a subscription target.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub service: ServiceKey,
    pub topic: TopicKey,
    pub tags: Tags,
}

impl Subject {
    pub fn new(service: ServiceKey, topic: TopicKey, tags: Tags) -> Self {
        Self {
            service,
            topic,
            tags,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.topic)?;
        if !self.tags.is_empty() {
            write!(f, "{:?}", self.tags)?;
        }
        Ok(())
    }
}

/// Wire handle standing in for a [`Subject`] once registered.
///
/// Aliases are issued by the consumer-side client: strictly positive,
/// monotonically assigned, never reused within a connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Alias(u32);

impl Alias {
    pub fn new(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The next alias a client would assign after this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn first() -> Self {
        Self(1)
    }
}

impl fmt::Debug for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Alias({})", self.0)
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a signal with its acknowledgement.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn into_bytes(self) -> [u8; 16] {
        self.0.into_bytes()
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
