//! Per-variant delta algebra over [`StreamState`].
//!
//! A transition is the on-the-wire shape of a change. Application is a
//! total function: a transition that does not fit the current state
//! (cross-variant, missing base, stale set version) yields `None` and the
//! caller falls back to a full snapshot refresh.

use std::collections::BTreeSet;

use bytes::Bytes;

use super::state::{
    ColumnValue, DictMapState, ListState, SetState, StreamState, StringState,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetTransition {
    /// Full replacement carrying the new version.
    Snapshot {
        version: u64,
        elements: BTreeSet<Bytes>,
    },
    /// Partial update, valid only against the exact base version.
    Delta {
        base_version: u64,
        added: BTreeSet<Bytes>,
        removed: BTreeSet<Bytes>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListTransition {
    Snapshot { items: Vec<Bytes> },
    AddAtHead { item: Bytes },
    AddAtTail { item: Bytes },
    RemoveByValue { item: Bytes },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamStateTransition {
    String { value: String },
    Set(SetTransition),
    List(ListTransition),
    DictMap { row: Vec<ColumnValue> },
}

impl StreamStateTransition {
    pub fn variant_name(&self) -> &'static str {
        match self {
            StreamStateTransition::String { .. } => "string",
            StreamStateTransition::Set(_) => "set",
            StreamStateTransition::List(_) => "list",
            StreamStateTransition::DictMap { .. } => "dict-map",
        }
    }

    /// Whether this transition can be applied on top of `current`.
    pub fn applicable_to(&self, current: Option<&StreamState>) -> bool {
        match (self, current) {
            // Self-contained transitions need no base.
            (StreamStateTransition::String { .. }, _) => true,
            (StreamStateTransition::Set(SetTransition::Snapshot { .. }), None) => true,
            (StreamStateTransition::Set(set), Some(StreamState::Set(base))) => match set {
                SetTransition::Snapshot { .. } => true,
                SetTransition::Delta { base_version, .. } => base.version == *base_version,
            },
            (StreamStateTransition::List(_), Some(StreamState::List(_))) => true,
            (StreamStateTransition::DictMap { row }, Some(StreamState::DictMap(base))) => {
                row.len() == base.columns.len()
            }
            _ => false,
        }
    }

    /// Applies this transition, producing the successor state.
    ///
    /// Returns `None` exactly when [`applicable_to`](Self::applicable_to)
    /// is false for the same `current`.
    pub fn apply(&self, current: Option<&StreamState>) -> Option<StreamState> {
        if !self.applicable_to(current) {
            return None;
        }
        let next = match self {
            StreamStateTransition::String { value } => StreamState::String(StringState {
                value: value.clone(),
            }),
            StreamStateTransition::Set(SetTransition::Snapshot { version, elements }) => {
                StreamState::Set(SetState {
                    version: *version,
                    elements: elements.clone(),
                })
            }
            StreamStateTransition::Set(SetTransition::Delta {
                base_version,
                added,
                removed,
            }) => {
                let Some(StreamState::Set(base)) = current else {
                    return None;
                };
                let mut elements = base.elements.clone();
                for element in removed {
                    elements.remove(element);
                }
                for element in added {
                    elements.insert(element.clone());
                }
                StreamState::Set(SetState {
                    version: base_version + 1,
                    elements,
                })
            }
            StreamStateTransition::List(list) => {
                let Some(StreamState::List(base)) = current else {
                    return None;
                };
                let mut next = base.clone();
                match list {
                    ListTransition::Snapshot { items } => {
                        next.items = items.iter().cloned().collect();
                    }
                    ListTransition::AddAtHead { item } => next.items.push_front(item.clone()),
                    ListTransition::AddAtTail { item } => next.items.push_back(item.clone()),
                    ListTransition::RemoveByValue { item } => {
                        next.items.retain(|existing| existing != item);
                    }
                }
                next.enforce_capacity();
                StreamState::List(next)
            }
            StreamStateTransition::DictMap { row } => {
                let Some(StreamState::DictMap(base)) = current else {
                    return None;
                };
                StreamState::DictMap(DictMapState {
                    columns: base.columns.clone(),
                    row: row.clone(),
                })
            }
        };
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::EvictionSide;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn set_of(items: &[&str]) -> BTreeSet<Bytes> {
        items.iter().map(|s| b(s)).collect()
    }

    #[test]
    fn string_transition_is_always_applicable() {
        let t = StreamStateTransition::String {
            value: "v2".into(),
        };
        assert!(t.applicable_to(None));
        let next = t.apply(Some(&StreamState::string("v1"))).unwrap();
        assert_eq!(next, StreamState::string("v2"));
    }

    #[test]
    fn set_delta_requires_exact_base_version() {
        let base = StreamState::Set(SetState::new(3, [b("a")]));
        let delta = StreamStateTransition::Set(SetTransition::Delta {
            base_version: 3,
            added: set_of(&["b"]),
            removed: set_of(&["a"]),
        });
        let StreamState::Set(next) = delta.apply(Some(&base)).unwrap() else {
            panic!("set expected");
        };
        assert_eq!(next.version, 4);
        assert_eq!(next.elements, set_of(&["b"]));

        let stale = StreamStateTransition::Set(SetTransition::Delta {
            base_version: 5,
            added: set_of(&["c"]),
            removed: BTreeSet::new(),
        });
        assert!(!stale.applicable_to(Some(&base)));
        assert_eq!(stale.apply(Some(&base)), None);
    }

    #[test]
    fn set_snapshot_resets_version_without_base() {
        let snap = StreamStateTransition::Set(SetTransition::Snapshot {
            version: 9,
            elements: set_of(&["x"]),
        });
        let StreamState::Set(next) = snap.apply(None).unwrap() else {
            panic!("set expected");
        };
        assert_eq!(next.version, 9);
    }

    #[test]
    fn list_add_evicts_on_overflow() {
        let base = StreamState::List(ListState::with_items(
            2,
            EvictionSide::FromHead,
            [b("a"), b("b")],
        ));
        let t = StreamStateTransition::List(ListTransition::AddAtTail { item: b("c") });
        let StreamState::List(next) = t.apply(Some(&base)).unwrap() else {
            panic!("list expected");
        };
        let items: Vec<_> = next.items.iter().cloned().collect();
        assert_eq!(items, vec![b("b"), b("c")]);
    }

    #[test]
    fn list_transitions_need_a_base() {
        let t = StreamStateTransition::List(ListTransition::AddAtHead { item: b("a") });
        assert!(!t.applicable_to(None));
        assert_eq!(t.apply(None), None);
    }

    #[test]
    fn list_remove_by_value_drops_every_occurrence() {
        let base = StreamState::List(ListState::with_items(
            4,
            EvictionSide::FromTail,
            [b("a"), b("b"), b("a"), b("c")],
        ));
        let t = StreamStateTransition::List(ListTransition::RemoveByValue { item: b("a") });
        let StreamState::List(next) = t.apply(Some(&base)).unwrap() else {
            panic!("list expected");
        };
        let items: Vec<_> = next.items.iter().cloned().collect();
        assert_eq!(items, vec![b("b"), b("c")]);
    }

    #[test]
    fn dict_map_replaces_row_in_place() {
        let base = StreamState::DictMap(DictMapState::new(
            vec!["bid".into(), "ask".into(), "open".into()],
            vec![
                ColumnValue::Int(100),
                ColumnValue::Int(102),
                ColumnValue::Bool(true),
            ],
        ));
        let t = StreamStateTransition::DictMap {
            row: vec![
                ColumnValue::Int(101),
                ColumnValue::Int(103),
                ColumnValue::Bool(true),
            ],
        };
        let StreamState::DictMap(next) = t.apply(Some(&base)).unwrap() else {
            panic!("dict-map expected");
        };
        assert_eq!(next.columns.len(), 3);
        assert_eq!(next.row[0], ColumnValue::Int(101));

        let misaligned = StreamStateTransition::DictMap {
            row: vec![ColumnValue::Int(1)],
        };
        assert!(!misaligned.applicable_to(Some(&base)));
    }

    #[test]
    fn cross_variant_pairs_are_inapplicable() {
        let string = StreamState::string("v");
        let t = StreamStateTransition::Set(SetTransition::Delta {
            base_version: 0,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        });
        assert!(!t.applicable_to(Some(&string)));
        assert_eq!(t.apply(Some(&string)), None);
    }
}
