//! Conversions between mqkit types and lapin wire structs.

use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use mqkit_core::{Arguments, Delivery, DeliveryMode, Envelope, ExchangeKind, Headers, Properties};
use serde_json::{Map, Number, Value};

pub(crate) fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

pub(crate) fn field_table(values: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            let items: Vec<AMQPValue> = items.iter().map(amqp_value).collect();
            AMQPValue::FieldArray(FieldArray::from(items))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => {
            Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(json_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(json_object(table)),
        AMQPValue::ByteArray(bytes) => {
            Value::Array(bytes.as_slice().iter().map(|b| Value::from(*b)).collect())
        }
        _ => Value::Null,
    }
}

fn json_object(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect()
}

fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect()
}

fn short(value: &Option<String>) -> Option<ShortString> {
    value.clone().map(ShortString::from)
}

fn string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

pub(crate) fn basic_properties(properties: &Properties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(v) = short(&properties.content_type) {
        out = out.with_content_type(v);
    }
    if let Some(v) = short(&properties.content_encoding) {
        out = out.with_content_encoding(v);
    }
    if let Some(mode) = properties.delivery_mode {
        out = out.with_delivery_mode(mode.as_u8());
    }
    if let Some(priority) = properties.priority {
        out = out.with_priority(priority);
    }
    if let Some(v) = short(&properties.correlation_id) {
        out = out.with_correlation_id(v);
    }
    if let Some(v) = short(&properties.reply_to) {
        out = out.with_reply_to(v);
    }
    if let Some(v) = short(&properties.message_id) {
        out = out.with_message_id(v);
    }
    if let Some(ts) = properties
        .timestamp
        .and_then(|t| u64::try_from(t.timestamp()).ok())
    {
        out = out.with_timestamp(ts);
    }
    if let Some(v) = short(&properties.kind) {
        out = out.with_kind(v);
    }
    if let Some(v) = short(&properties.app_id) {
        out = out.with_app_id(v);
    }
    if let Some(v) = short(&properties.user_id) {
        out = out.with_user_id(v);
    }
    if let Some(v) = short(&properties.expiration) {
        out = out.with_expiration(v);
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(ShortString::from(key.clone()), amqp_value(value));
        }
        out = out.with_headers(table);
    }
    out
}

pub(crate) fn properties(basic: &BasicProperties) -> Properties {
    Properties {
        content_type: string(basic.content_type()),
        content_encoding: string(basic.content_encoding()),
        delivery_mode: basic.delivery_mode().and_then(DeliveryMode::from_u8),
        priority: *basic.priority(),
        correlation_id: string(basic.correlation_id()),
        reply_to: string(basic.reply_to()),
        message_id: string(basic.message_id()),
        timestamp: basic
            .timestamp()
            .and_then(|ts| i64::try_from(ts).ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        kind: string(basic.kind()),
        app_id: string(basic.app_id()),
        user_id: string(basic.user_id()),
        expiration: string(basic.expiration()),
        headers: basic.headers().as_ref().map(headers).unwrap_or_default(),
    }
}

pub(crate) fn delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        envelope: Envelope {
            properties: properties(&delivery.properties),
            body: delivery.data,
        },
    }
}
