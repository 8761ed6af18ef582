//! Conversion between dynamic protobuf messages and the generic value tree

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use prost_reflect::{DeserializeOptions, DynamicMessage, Kind, MapKey, MessageDescriptor, ReflectMessage};

use trpc_common::{Error, Fields, Result, Value};

/// Build a request message from resolved request data.
///
/// Field names follow the protobuf JSON mapping: enum values by name, 64-bit
/// integers as numbers or strings, bytes as base64 text.
pub fn to_message(desc: &MessageDescriptor, data: &Fields, allow_unknown_fields: bool) -> Result<DynamicMessage> {
    let json = Value::Map(data.clone()).to_json();
    let options = DeserializeOptions::new().deny_unknown_fields(!allow_unknown_fields);
    DynamicMessage::deserialize_with_options(desc.clone(), json, &options)
        .map_err(|e| Error::Schema(format!("Invalid request data for {}: {e}", desc.full_name())))
}

/// Decode every declared field of a message into a mapping.
///
/// Unset fields with explicit presence (messages, oneof members, optionals)
/// become `Null`; other unset scalars take their default.
pub fn to_fields(message: &DynamicMessage) -> Fields {
    message
        .descriptor()
        .fields()
        .map(|field| {
            let value = if field.supports_presence() && !message.has_field(&field) {
                Value::Null
            } else {
                convert(&message.get_field(&field), &field.kind())
            };
            (field.name().to_string(), value)
        })
        .collect()
}

fn convert(value: &prost_reflect::Value, kind: &Kind) -> Value {
    use prost_reflect::Value as Proto;

    match value {
        Proto::Bool(b) => Value::Bool(*b),
        Proto::I32(v) => Value::Int(i64::from(*v)),
        Proto::I64(v) => Value::Int(*v),
        Proto::U32(v) => Value::Int(i64::from(*v)),
        Proto::U64(v) => i64::try_from(*v).map(Value::Int).unwrap_or(Value::Float(*v as f64)),
        Proto::F32(v) => Value::Float(f64::from(*v)),
        Proto::F64(v) => Value::Float(*v),
        Proto::String(s) => Value::String(s.clone()),
        Proto::Bytes(b) => Value::String(STANDARD.encode(b)),
        Proto::EnumNumber(number) => match kind {
            Kind::Enum(desc) => desc
                .get_value(*number)
                .map(|v| Value::String(v.name().to_string()))
                .unwrap_or(Value::Int(i64::from(*number))),
            _ => Value::Int(i64::from(*number)),
        },
        Proto::Message(message) => Value::Map(to_fields(message)),
        Proto::List(items) => Value::Array(items.iter().map(|item| convert(item, kind)).collect()),
        Proto::Map(entries) => {
            let value_kind = match kind {
                Kind::Message(entry) => entry.map_entry_value_field().kind(),
                other => other.clone(),
            };
            Value::Map(
                entries
                    .iter()
                    .map(|(key, value)| (map_key(key), convert(value, &value_kind)))
                    .collect(),
            )
        }
    }
}

fn map_key(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(v) => v.to_string(),
        MapKey::I64(v) => v.to_string(),
        MapKey::U32(v) => v.to_string(),
        MapKey::U64(v) => v.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use prost_reflect::DescriptorPool;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto, FileDescriptorProto,
        MessageOptions, OneofDescriptorProto,
    };

    fn field(name: &str, number: i32, ty: Type, label: Label) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            label: Some(label as i32),
            r#type: Some(ty as i32),
            ..Default::default()
        }
    }

    fn typed(mut field: FieldDescriptorProto, type_name: &str) -> FieldDescriptorProto {
        field.type_name = Some(type_name.to_string());
        field
    }

    /// `shop.Order` with an enum, a nested message, a map, a list, bytes and a oneof
    fn pool() -> DescriptorPool {
        let status = EnumDescriptorProto {
            name: Some("Status".into()),
            value: ["UNKNOWN", "OPEN", "CLOSED"]
                .iter()
                .enumerate()
                .map(|(i, name)| EnumValueDescriptorProto {
                    name: Some(name.to_string()),
                    number: Some(i as i32),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let item = DescriptorProto {
            name: Some("Item".into()),
            field: vec![
                field("sku", 1, Type::String, Label::Optional),
                field("qty", 2, Type::Int32, Label::Optional),
            ],
            ..Default::default()
        };
        let labels_entry = DescriptorProto {
            name: Some("LabelsEntry".into()),
            field: vec![
                field("key", 1, Type::String, Label::Optional),
                field("value", 2, Type::Int64, Label::Optional),
            ],
            options: Some(MessageOptions { map_entry: Some(true), ..Default::default() }),
            ..Default::default()
        };
        let mut note = field("note", 8, Type::String, Label::Optional);
        note.oneof_index = Some(0);
        let order = DescriptorProto {
            name: Some("Order".into()),
            field: vec![
                field("id", 1, Type::String, Label::Optional),
                typed(field("status", 2, Type::Enum, Label::Optional), ".shop.Status"),
                typed(field("first", 3, Type::Message, Label::Optional), ".shop.Item"),
                typed(field("items", 4, Type::Message, Label::Repeated), ".shop.Item"),
                typed(field("labels", 5, Type::Message, Label::Repeated), ".shop.Order.LabelsEntry"),
                field("payload", 6, Type::Bytes, Label::Optional),
                field("count", 7, Type::Uint64, Label::Optional),
                note,
            ],
            nested_type: vec![labels_entry],
            oneof_decl: vec![OneofDescriptorProto { name: Some("extra".into()), ..Default::default() }],
            ..Default::default()
        };
        let file = FileDescriptorProto {
            name: Some("shop.proto".into()),
            package: Some("shop".into()),
            message_type: vec![item, order],
            enum_type: vec![status],
            syntax: Some("proto3".into()),
            ..Default::default()
        };
        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file).unwrap();
        pool
    }

    fn order() -> MessageDescriptor {
        pool().get_message_by_name("shop.Order").unwrap()
    }

    fn request(json: serde_json::Value) -> Fields {
        match Value::from_json(json) {
            Value::Map(fields) => fields,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_enum_decodes_to_symbolic_name() {
        let data = request(serde_json::json!({ "id": "o-1", "status": "CLOSED" }));
        let message = to_message(&order(), &data, false).unwrap();

        let bytes = message.encode_to_vec();
        let decoded = DynamicMessage::decode(order(), bytes.as_slice()).unwrap();
        let fields = to_fields(&decoded);

        assert_eq!(fields.get("status"), Some(&Value::from("CLOSED")));
        assert_eq!(fields.get("id"), Some(&Value::from("o-1")));
    }

    #[test]
    fn test_every_declared_field_is_present() {
        let message = to_message(&order(), &Fields::new(), false).unwrap();
        let fields = to_fields(&message);

        assert_eq!(fields.len(), 8);
        assert_eq!(fields.get("status"), Some(&Value::from("UNKNOWN")));
        assert_eq!(fields.get("first"), Some(&Value::Null));
        assert_eq!(fields.get("note"), Some(&Value::Null));
        assert_eq!(fields.get("items"), Some(&Value::Array(Vec::new())));
        assert_eq!(fields.get("labels"), Some(&Value::Map(Fields::new())));
        assert_eq!(fields.get("count"), Some(&Value::Int(0)));
        assert_eq!(fields.get("payload"), Some(&Value::from("")));
    }

    #[test]
    fn test_nested_collections_and_bytes() {
        let data = request(serde_json::json!({
            "first": { "sku": "a", "qty": 2 },
            "items": [{ "sku": "b", "qty": 1 }, { "sku": "c" }],
            "labels": { "x": 5 },
            "payload": "aGk=",
            "count": "18446744073709551615",
            "note": "fragile"
        }));
        let fields = to_fields(&to_message(&order(), &data, false).unwrap());

        let expected = Value::from_json(serde_json::json!({ "sku": "a", "qty": 2 }));
        assert_eq!(fields.get("first"), Some(&expected));
        let Some(Value::Array(items)) = fields.get("items") else {
            panic!("items should be an array");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Value::from_json(serde_json::json!({ "sku": "c", "qty": 0 })));
        assert_eq!(fields.get("labels"), Some(&Value::from_json(serde_json::json!({ "x": 5 }))));
        assert_eq!(fields.get("payload"), Some(&Value::from("aGk=")));
        assert_eq!(fields.get("count"), Some(&Value::Float(u64::MAX as f64)));
        assert_eq!(fields.get("note"), Some(&Value::from("fragile")));
    }

    #[test]
    fn test_decoding_is_stable() {
        let data = request(serde_json::json!({ "id": "o-2", "items": [{ "sku": "z" }] }));
        let message = to_message(&order(), &data, false).unwrap();
        assert_eq!(to_fields(&message), to_fields(&message));
    }

    #[test]
    fn test_unknown_fields_policy() {
        let data = request(serde_json::json!({ "id": "o-3", "bogus": 1 }));
        let err = to_message(&order(), &data, false).unwrap_err();
        assert!(err.to_string().contains("shop.Order"), "{err}");

        let message = to_message(&order(), &data, true).unwrap();
        assert_eq!(to_fields(&message).get("id"), Some(&Value::from("o-3")));
    }
}
