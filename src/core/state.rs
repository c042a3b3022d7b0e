//! The four stream state payload variants.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use bytes::Bytes;

/// Which end of a bounded list loses items on overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EvictionSide {
    FromHead,
    FromTail,
}

/// One typed cell of a dict-map row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// A single immutable string value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringState {
    pub value: String,
}

/// A set of opaque elements with a monotonic version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetState {
    pub version: u64,
    pub elements: BTreeSet<Bytes>,
}

impl SetState {
    pub fn new(version: u64, elements: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            version,
            elements: elements.into_iter().collect(),
        }
    }
}

/// An ordered sequence bounded by a capacity, evicting from one side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListState {
    pub capacity: usize,
    pub evict: EvictionSide,
    pub items: VecDeque<Bytes>,
}

impl ListState {
    pub fn new(capacity: usize, evict: EvictionSide) -> Self {
        Self {
            capacity,
            evict,
            items: VecDeque::new(),
        }
    }

    pub fn with_items(
        capacity: usize,
        evict: EvictionSide,
        items: impl IntoIterator<Item = Bytes>,
    ) -> Self {
        let mut state = Self::new(capacity, evict);
        for item in items {
            state.items.push_back(item);
        }
        state.enforce_capacity();
        state
    }

    /// Drops items from the configured eviction side until within capacity.
    pub(crate) fn enforce_capacity(&mut self) {
        while self.items.len() > self.capacity {
            match self.evict {
                EvictionSide::FromHead => {
                    self.items.pop_front();
                }
                EvictionSide::FromTail => {
                    self.items.pop_back();
                }
            }
        }
    }
}

/// A fixed-schema tuple keyed by a dictionary of column names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DictMapState {
    pub columns: Vec<String>,
    pub row: Vec<ColumnValue>,
}

impl DictMapState {
    pub fn new(columns: Vec<String>, row: Vec<ColumnValue>) -> Self {
        debug_assert_eq!(columns.len(), row.len(), "row must align with columns");
        Self { columns, row }
    }
}

/// Full stream payload, the unit carried by a snapshot update.
#[derive(Clone, PartialEq, Eq)]
pub enum StreamState {
    String(StringState),
    Set(SetState),
    List(ListState),
    DictMap(DictMapState),
}

impl StreamState {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(StringState {
            value: value.into(),
        })
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            StreamState::String(_) => "string",
            StreamState::Set(_) => "set",
            StreamState::List(_) => "list",
            StreamState::DictMap(_) => "dict-map",
        }
    }
}

impl fmt::Debug for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::String(s) => write!(f, "StreamState::String({:?})", s.value),
            StreamState::Set(s) => f
                .debug_struct("StreamState::Set")
                .field("version", &s.version)
                .field("len", &s.elements.len())
                .finish(),
            StreamState::List(s) => f
                .debug_struct("StreamState::List")
                .field("capacity", &s.capacity)
                .field("evict", &s.evict)
                .field("len", &s.items.len())
                .finish(),
            StreamState::DictMap(s) => f
                .debug_struct("StreamState::DictMap")
                .field("columns", &s.columns)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn list_evicts_from_head() {
        let state = ListState::with_items(2, EvictionSide::FromHead, [b("a"), b("b"), b("c")]);
        let items: Vec<_> = state.items.iter().cloned().collect();
        assert_eq!(items, vec![b("b"), b("c")]);
    }

    #[test]
    fn list_evicts_from_tail() {
        let state = ListState::with_items(2, EvictionSide::FromTail, [b("a"), b("b"), b("c")]);
        let items: Vec<_> = state.items.iter().cloned().collect();
        assert_eq!(items, vec![b("a"), b("b")]);
    }

    #[test]
    fn set_state_deduplicates() {
        let state = SetState::new(1, [b("x"), b("x"), b("y")]);
        assert_eq!(state.elements.len(), 2);
    }
}
