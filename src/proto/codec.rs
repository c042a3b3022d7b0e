//! Length-delimited binary encoding of dialect records.
//!
//! A transport frame carries one or more records back to back. Each record
//! is a `u32` little-endian body length followed by the body: a one-byte
//! kind tag, then kind-specific fields. Strings and blobs are `u32`-length
//! prefixed, optional fields carry a presence byte, collections carry a
//! `u32` count. Any malformed byte sequence fails decoding, which is fatal
//! for the connection.

use std::collections::BTreeSet;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{
    Alias, ColumnValue, CorrelationId, DictMapState, EvictionSide, Limits, ListState,
    ListTransition, ServiceKey, SetState, SetTransition, StreamState, StreamStateTransition,
    StringState, Subject, Tags, TopicKey,
};

use super::{
    AliasBinding, DialectMessage, OpenSubscription, RecordKind, Signal, SignalAck,
};

const LEN_PREFIX: usize = 4;

const STATE_STRING: u8 = 1;
const STATE_SET: u8 = 2;
const STATE_LIST: u8 = 3;
const STATE_DICT_MAP: u8 = 4;

const SET_SNAPSHOT: u8 = 1;
const SET_DELTA: u8 = 2;

const LIST_SNAPSHOT: u8 = 1;
const LIST_ADD_HEAD: u8 = 2;
const LIST_ADD_TAIL: u8 = 3;
const LIST_REMOVE_VALUE: u8 = 4;

const EVICT_FROM_HEAD: u8 = 0;
const EVICT_FROM_TAIL: u8 = 1;

const COLUMN_STR: u8 = 1;
const COLUMN_INT: u8 = 2;
const COLUMN_BOOL: u8 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record truncated while reading {field}")]
    Truncated { field: &'static str },
    #[error("record body {got} bytes exceeds limit {max}")]
    RecordTooLarge { max: usize, got: usize },
    #[error("frame carries more than {max} records")]
    TooManyRecords { max: usize },
    #[error("unknown record kind {0:#04x}")]
    UnknownKind(u8),
    #[error("unknown {what} tag {tag:#04x}")]
    UnknownTag { what: &'static str, tag: u8 },
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("{field} length {got} exceeds limit {max}")]
    FieldTooLarge {
        field: &'static str,
        max: usize,
        got: usize,
    },
    #[error("trailing bytes after record body")]
    TrailingBytes,
}

/// Encodes `message` as one length-prefixed record appended to `buf`.
pub fn encode_record(message: &DialectMessage, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let len_at = buf.len();
    buf.extend_from_slice(&[0u8; LEN_PREFIX]);
    let body_at = buf.len();

    buf.push(message.kind().as_u8());
    match message {
        DialectMessage::Alias(binding) => {
            put_alias(buf, binding.alias);
            put_subject(buf, &binding.subject)?;
        }
        DialectMessage::OpenSubscription(open) => {
            put_alias(buf, open.alias);
            put_opt_string(buf, open.priority_key.as_deref())?;
            put_u64(buf, open.aggregation_interval_ms);
        }
        DialectMessage::CloseSubscription { alias }
        | DialectMessage::ResetSubscription { alias }
        | DialectMessage::SubscriptionClosed { alias }
        | DialectMessage::InvalidRequest { alias } => put_alias(buf, *alias),
        DialectMessage::Signal(signal) => {
            put_subject(buf, &signal.subject)?;
            put_blob(buf, &signal.payload)?;
            put_u64(buf, signal.expire_at_ms);
            put_opt_string(buf, signal.ordering_group.as_deref())?;
            put_opt_correlation(buf, signal.correlation_id);
        }
        DialectMessage::Ping { id } | DialectMessage::Pong { id } => put_u64(buf, *id),
        DialectMessage::StreamStateUpdate { alias, state } => {
            put_alias(buf, *alias);
            put_state(buf, state)?;
        }
        DialectMessage::StreamStateTransitionUpdate { alias, transition } => {
            put_alias(buf, *alias);
            put_transition(buf, transition)?;
        }
        DialectMessage::ServiceNotAvailable { service } => {
            put_string(buf, service.as_str())?;
        }
        DialectMessage::SignalAckOk(ack) | DialectMessage::SignalAckFailed(ack) => {
            buf.extend_from_slice(&ack.correlation_id.into_bytes());
            match &ack.payload {
                Some(payload) => {
                    buf.push(1);
                    put_blob(buf, payload)?;
                }
                None => buf.push(0),
            }
        }
    }

    let body_len = buf.len() - body_at;
    let prefix = u32::try_from(body_len).map_err(|_| CodecError::FieldTooLarge {
        field: "record body",
        max: u32::MAX as usize,
        got: body_len,
    })?;
    buf[len_at..body_at].copy_from_slice(&prefix.to_le_bytes());
    Ok(())
}

/// Encodes a batch of records into one frame payload.
pub fn encode_frame(messages: &[DialectMessage]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    for message in messages {
        encode_record(message, &mut buf)?;
    }
    Ok(buf)
}

/// Decodes every record in `frame`, in arrival order.
pub fn decode_frame(frame: &[u8], limits: &Limits) -> Result<Vec<DialectMessage>, CodecError> {
    let mut messages = Vec::new();
    let mut rest = frame;
    while !rest.is_empty() {
        if messages.len() >= limits.max_frame_records {
            return Err(CodecError::TooManyRecords {
                max: limits.max_frame_records,
            });
        }
        if rest.len() < LEN_PREFIX {
            return Err(CodecError::Truncated {
                field: "record length",
            });
        }
        let body_len =
            u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if body_len > limits.max_record_bytes {
            return Err(CodecError::RecordTooLarge {
                max: limits.max_record_bytes,
                got: body_len,
            });
        }
        rest = &rest[LEN_PREFIX..];
        if rest.len() < body_len {
            return Err(CodecError::Truncated {
                field: "record body",
            });
        }
        let (body, tail) = rest.split_at(body_len);
        messages.push(decode_record(body, limits)?);
        rest = tail;
    }
    Ok(messages)
}

fn decode_record(body: &[u8], limits: &Limits) -> Result<DialectMessage, CodecError> {
    let mut reader = FieldReader::new(body, limits);
    let raw_kind = reader.u8("kind")?;
    let kind = RecordKind::parse(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;

    let message = match kind {
        RecordKind::Alias => DialectMessage::Alias(AliasBinding {
            alias: reader.alias()?,
            subject: reader.subject()?,
        }),
        RecordKind::OpenSubscription => DialectMessage::OpenSubscription(OpenSubscription {
            alias: reader.alias()?,
            priority_key: reader.opt_string("priority_key")?,
            aggregation_interval_ms: reader.u64("aggregation_interval_ms")?,
        }),
        RecordKind::CloseSubscription => DialectMessage::CloseSubscription {
            alias: reader.alias()?,
        },
        RecordKind::ResetSubscription => DialectMessage::ResetSubscription {
            alias: reader.alias()?,
        },
        RecordKind::Signal => DialectMessage::Signal(Signal {
            subject: reader.subject()?,
            payload: reader.blob("payload")?,
            expire_at_ms: reader.u64("expire_at_ms")?,
            ordering_group: reader.opt_string("ordering_group")?,
            correlation_id: reader.opt_correlation()?,
        }),
        RecordKind::Ping => DialectMessage::Ping {
            id: reader.u64("ping id")?,
        },
        RecordKind::Pong => DialectMessage::Pong {
            id: reader.u64("pong id")?,
        },
        RecordKind::StreamStateUpdate => DialectMessage::StreamStateUpdate {
            alias: reader.alias()?,
            state: reader.state()?,
        },
        RecordKind::StreamStateTransitionUpdate => DialectMessage::StreamStateTransitionUpdate {
            alias: reader.alias()?,
            transition: reader.transition()?,
        },
        RecordKind::SubscriptionClosed => DialectMessage::SubscriptionClosed {
            alias: reader.alias()?,
        },
        RecordKind::ServiceNotAvailable => DialectMessage::ServiceNotAvailable {
            service: reader.service_key()?,
        },
        RecordKind::InvalidRequest => DialectMessage::InvalidRequest {
            alias: reader.alias()?,
        },
        RecordKind::SignalAckOk => DialectMessage::SignalAckOk(reader.signal_ack()?),
        RecordKind::SignalAckFailed => DialectMessage::SignalAckFailed(reader.signal_ack()?),
    };

    if reader.remaining() != 0 {
        return Err(CodecError::TrailingBytes);
    }
    Ok(message)
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_alias(buf: &mut Vec<u8>, alias: Alias) {
    put_u32(buf, alias.get());
}

fn put_len(buf: &mut Vec<u8>, len: usize, field: &'static str) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::FieldTooLarge {
        field,
        max: u32::MAX as usize,
        got: len,
    })?;
    put_u32(buf, len);
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    put_len(buf, value.len(), "string")?;
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_opt_string(buf: &mut Vec<u8>, value: Option<&str>) -> Result<(), CodecError> {
    match value {
        Some(value) => {
            buf.push(1);
            put_string(buf, value)
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

fn put_blob(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), CodecError> {
    put_len(buf, value.len(), "blob")?;
    buf.extend_from_slice(value);
    Ok(())
}

fn put_opt_correlation(buf: &mut Vec<u8>, value: Option<CorrelationId>) {
    match value {
        Some(id) => {
            buf.push(1);
            buf.extend_from_slice(&id.into_bytes());
        }
        None => buf.push(0),
    }
}

fn put_subject(buf: &mut Vec<u8>, subject: &Subject) -> Result<(), CodecError> {
    put_string(buf, subject.service.as_str())?;
    put_string(buf, subject.topic.as_str())?;
    put_len(buf, subject.tags.len(), "tags")?;
    for (key, value) in subject.tags.iter() {
        put_string(buf, key)?;
        put_string(buf, value)?;
    }
    Ok(())
}

fn put_state(buf: &mut Vec<u8>, state: &StreamState) -> Result<(), CodecError> {
    match state {
        StreamState::String(s) => {
            buf.push(STATE_STRING);
            put_string(buf, &s.value)?;
        }
        StreamState::Set(s) => {
            buf.push(STATE_SET);
            put_u64(buf, s.version);
            put_len(buf, s.elements.len(), "set elements")?;
            for element in &s.elements {
                put_blob(buf, element)?;
            }
        }
        StreamState::List(s) => {
            buf.push(STATE_LIST);
            put_len(buf, s.capacity, "list capacity")?;
            buf.push(match s.evict {
                EvictionSide::FromHead => EVICT_FROM_HEAD,
                EvictionSide::FromTail => EVICT_FROM_TAIL,
            });
            put_len(buf, s.items.len(), "list items")?;
            for item in &s.items {
                put_blob(buf, item)?;
            }
        }
        StreamState::DictMap(s) => {
            buf.push(STATE_DICT_MAP);
            put_len(buf, s.columns.len(), "columns")?;
            for column in &s.columns {
                put_string(buf, column)?;
            }
            for value in &s.row {
                put_column_value(buf, value)?;
            }
        }
    }
    Ok(())
}

fn put_transition(buf: &mut Vec<u8>, transition: &StreamStateTransition) -> Result<(), CodecError> {
    match transition {
        StreamStateTransition::String { value } => {
            buf.push(STATE_STRING);
            put_string(buf, value)?;
        }
        StreamStateTransition::Set(set) => {
            buf.push(STATE_SET);
            match set {
                SetTransition::Snapshot { version, elements } => {
                    buf.push(SET_SNAPSHOT);
                    put_u64(buf, *version);
                    put_len(buf, elements.len(), "set elements")?;
                    for element in elements {
                        put_blob(buf, element)?;
                    }
                }
                SetTransition::Delta {
                    base_version,
                    added,
                    removed,
                } => {
                    buf.push(SET_DELTA);
                    put_u64(buf, *base_version);
                    put_len(buf, added.len(), "set added")?;
                    for element in added {
                        put_blob(buf, element)?;
                    }
                    put_len(buf, removed.len(), "set removed")?;
                    for element in removed {
                        put_blob(buf, element)?;
                    }
                }
            }
        }
        StreamStateTransition::List(list) => {
            buf.push(STATE_LIST);
            match list {
                ListTransition::Snapshot { items } => {
                    buf.push(LIST_SNAPSHOT);
                    put_len(buf, items.len(), "list items")?;
                    for item in items {
                        put_blob(buf, item)?;
                    }
                }
                ListTransition::AddAtHead { item } => {
                    buf.push(LIST_ADD_HEAD);
                    put_blob(buf, item)?;
                }
                ListTransition::AddAtTail { item } => {
                    buf.push(LIST_ADD_TAIL);
                    put_blob(buf, item)?;
                }
                ListTransition::RemoveByValue { item } => {
                    buf.push(LIST_REMOVE_VALUE);
                    put_blob(buf, item)?;
                }
            }
        }
        StreamStateTransition::DictMap { row } => {
            buf.push(STATE_DICT_MAP);
            put_len(buf, row.len(), "row")?;
            for value in row {
                put_column_value(buf, value)?;
            }
        }
    }
    Ok(())
}

fn put_column_value(buf: &mut Vec<u8>, value: &ColumnValue) -> Result<(), CodecError> {
    match value {
        ColumnValue::Str(s) => {
            buf.push(COLUMN_STR);
            put_string(buf, s)?;
        }
        ColumnValue::Int(i) => {
            buf.push(COLUMN_INT);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        ColumnValue::Bool(b) => {
            buf.push(COLUMN_BOOL);
            buf.push(u8::from(*b));
        }
    }
    Ok(())
}

struct FieldReader<'a> {
    buf: &'a [u8],
    limits: &'a Limits,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8], limits: &'a Limits) -> Self {
        Self { buf, limits }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated { field });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let raw = self.take(4, field)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        let raw = self.take(8, field)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, CodecError> {
        let raw = self.take(8, field)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(i64::from_le_bytes(bytes))
    }

    fn presence(&mut self, field: &'static str) -> Result<bool, CodecError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidField {
                field,
                reason: format!("presence byte must be 0 or 1, got {other}"),
            }),
        }
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u32(field)? as usize;
        if len > self.limits.max_key_bytes {
            return Err(CodecError::FieldTooLarge {
                field,
                max: self.limits.max_key_bytes,
                got: len,
            });
        }
        let raw = self.take(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidField {
            field,
            reason: "not valid utf-8".into(),
        })
    }

    /// Data-sized text: string state values and string columns, bounded
    /// like blobs rather than like keys.
    fn text(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u32(field)? as usize;
        if len > self.limits.max_blob_bytes {
            return Err(CodecError::FieldTooLarge {
                field,
                max: self.limits.max_blob_bytes,
                got: len,
            });
        }
        let raw = self.take(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidField {
            field,
            reason: "not valid utf-8".into(),
        })
    }

    fn opt_string(&mut self, field: &'static str) -> Result<Option<String>, CodecError> {
        if self.presence(field)? {
            Ok(Some(self.string(field)?))
        } else {
            Ok(None)
        }
    }

    fn blob(&mut self, field: &'static str) -> Result<Bytes, CodecError> {
        let len = self.u32(field)? as usize;
        if len > self.limits.max_blob_bytes {
            return Err(CodecError::FieldTooLarge {
                field,
                max: self.limits.max_blob_bytes,
                got: len,
            });
        }
        let raw = self.take(len, field)?;
        Ok(Bytes::copy_from_slice(raw))
    }

    fn count(&mut self, field: &'static str, max: usize) -> Result<usize, CodecError> {
        let count = self.u32(field)? as usize;
        if count > max {
            return Err(CodecError::FieldTooLarge {
                field,
                max,
                got: count,
            });
        }
        Ok(count)
    }

    fn alias(&mut self) -> Result<Alias, CodecError> {
        let raw = self.u32("alias")?;
        Alias::new(raw).ok_or(CodecError::InvalidField {
            field: "alias",
            reason: "must be positive".into(),
        })
    }

    fn service_key(&mut self) -> Result<ServiceKey, CodecError> {
        let raw = self.string("service")?;
        ServiceKey::parse(raw).map_err(|err| CodecError::InvalidField {
            field: "service",
            reason: err.to_string(),
        })
    }

    fn subject(&mut self) -> Result<Subject, CodecError> {
        let service = self.service_key()?;
        let raw_topic = self.string("topic")?;
        let topic = TopicKey::parse(raw_topic).map_err(|err| CodecError::InvalidField {
            field: "topic",
            reason: err.to_string(),
        })?;
        let tag_count = self.count("tags", self.limits.max_subject_tags)?;
        let mut pairs = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            let key = self.string("tag key")?;
            let value = self.string("tag value")?;
            pairs.push((key, value));
        }
        Ok(Subject::new(service, topic, Tags::from_pairs(pairs)))
    }

    fn correlation(&mut self) -> Result<CorrelationId, CodecError> {
        let raw = self.take(16, "correlation_id")?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(CorrelationId::from_bytes(bytes))
    }

    fn opt_correlation(&mut self) -> Result<Option<CorrelationId>, CodecError> {
        if self.presence("correlation_id")? {
            Ok(Some(self.correlation()?))
        } else {
            Ok(None)
        }
    }

    fn signal_ack(&mut self) -> Result<SignalAck, CodecError> {
        let correlation_id = self.correlation()?;
        let payload = if self.presence("ack payload")? {
            Some(self.blob("ack payload")?)
        } else {
            None
        };
        Ok(SignalAck {
            correlation_id,
            payload,
        })
    }

    fn elements(&mut self, field: &'static str) -> Result<BTreeSet<Bytes>, CodecError> {
        let count = self.count(field, self.limits.max_collection_items)?;
        let mut elements = BTreeSet::new();
        for _ in 0..count {
            elements.insert(self.blob(field)?);
        }
        Ok(elements)
    }

    fn items(&mut self, field: &'static str) -> Result<Vec<Bytes>, CodecError> {
        let count = self.count(field, self.limits.max_collection_items)?;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(self.blob(field)?);
        }
        Ok(items)
    }

    fn column_value(&mut self) -> Result<ColumnValue, CodecError> {
        match self.u8("column tag")? {
            COLUMN_STR => Ok(ColumnValue::Str(self.text("column value")?)),
            COLUMN_INT => Ok(ColumnValue::Int(self.i64("column value")?)),
            COLUMN_BOOL => Ok(ColumnValue::Bool(self.presence("column value")?)),
            tag => Err(CodecError::UnknownTag {
                what: "column value",
                tag,
            }),
        }
    }

    fn state(&mut self) -> Result<StreamState, CodecError> {
        match self.u8("state tag")? {
            STATE_STRING => Ok(StreamState::String(StringState {
                value: self.text("string value")?,
            })),
            STATE_SET => {
                let version = self.u64("set version")?;
                let elements = self.elements("set elements")?;
                Ok(StreamState::Set(SetState { version, elements }))
            }
            STATE_LIST => {
                let capacity = self.count("list capacity", self.limits.max_collection_items)?;
                let evict = match self.u8("evict side")? {
                    EVICT_FROM_HEAD => EvictionSide::FromHead,
                    EVICT_FROM_TAIL => EvictionSide::FromTail,
                    tag => {
                        return Err(CodecError::UnknownTag {
                            what: "evict side",
                            tag,
                        });
                    }
                };
                let items = self.items("list items")?;
                Ok(StreamState::List(ListState::with_items(
                    capacity, evict, items,
                )))
            }
            STATE_DICT_MAP => {
                let count = self.count("columns", self.limits.max_collection_items)?;
                let mut columns = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    columns.push(self.string("column name")?);
                }
                let mut row = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    row.push(self.column_value()?);
                }
                Ok(StreamState::DictMap(DictMapState { columns, row }))
            }
            tag => Err(CodecError::UnknownTag { what: "state", tag }),
        }
    }

    fn transition(&mut self) -> Result<StreamStateTransition, CodecError> {
        match self.u8("transition tag")? {
            STATE_STRING => Ok(StreamStateTransition::String {
                value: self.text("string value")?,
            }),
            STATE_SET => match self.u8("set transition tag")? {
                SET_SNAPSHOT => Ok(StreamStateTransition::Set(SetTransition::Snapshot {
                    version: self.u64("set version")?,
                    elements: self.elements("set elements")?,
                })),
                SET_DELTA => Ok(StreamStateTransition::Set(SetTransition::Delta {
                    base_version: self.u64("set base version")?,
                    added: self.elements("set added")?,
                    removed: self.elements("set removed")?,
                })),
                tag => Err(CodecError::UnknownTag {
                    what: "set transition",
                    tag,
                }),
            },
            STATE_LIST => match self.u8("list transition tag")? {
                LIST_SNAPSHOT => Ok(StreamStateTransition::List(ListTransition::Snapshot {
                    items: self.items("list items")?,
                })),
                LIST_ADD_HEAD => Ok(StreamStateTransition::List(ListTransition::AddAtHead {
                    item: self.blob("list item")?,
                })),
                LIST_ADD_TAIL => Ok(StreamStateTransition::List(ListTransition::AddAtTail {
                    item: self.blob("list item")?,
                })),
                LIST_REMOVE_VALUE => {
                    Ok(StreamStateTransition::List(ListTransition::RemoveByValue {
                        item: self.blob("list item")?,
                    }))
                }
                tag => Err(CodecError::UnknownTag {
                    what: "list transition",
                    tag,
                }),
            },
            STATE_DICT_MAP => {
                let count = self.count("row", self.limits.max_collection_items)?;
                let mut row = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    row.push(self.column_value()?);
                }
                Ok(StreamStateTransition::DictMap { row })
            }
            tag => Err(CodecError::UnknownTag {
                what: "transition",
                tag,
            }),
        }
    }
}
