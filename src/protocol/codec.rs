use std::sync::Arc;

use bincode::{
    Decode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice,
    error::DecodeError,
    encode_into_std_write,
};

use crate::{
    message::{Message, Value, check_types},
    schema::{ArgType, Schema},
};

use super::error::ProtocolError;

pub(crate) fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Serializes `message` into a frame payload.
///
/// The message is checked against `schema` first, so a message built from a different
/// vocabulary fails here instead of on the peer.
pub fn encode(schema: &Schema, message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let definition = schema
        .get(message.name())
        .ok_or_else(|| ProtocolError::UnknownMessage(message.name().to_string()))?;

    let values = message.values();
    if let Some((argument, _)) = definition.arguments().nth(values.len()) {
        return Err(ProtocolError::MissingArgument {
            message: message.name().to_string(),
            argument: argument.to_string(),
        });
    }
    if values.len() > definition.arity() {
        let argument = message
            .arguments()
            .nth(definition.arity())
            .map(|(n, _)| n.to_string())
            .unwrap_or_default();
        return Err(ProtocolError::UnexpectedArgument {
            message: message.name().to_string(),
            argument,
        });
    }
    check_types(definition, values)?;

    let config = config();
    let mut buf = Vec::new();
    encode_into_std_write(message.name(), &mut buf, config)?;
    for value in values {
        match value {
            Value::Int(v) => encode_into_std_write(v, &mut buf, config)?,
            Value::Float(v) => encode_into_std_write(v, &mut buf, config)?,
            Value::Str(v) => encode_into_std_write(v.as_str(), &mut buf, config)?,
            Value::Bool(v) => encode_into_std_write(v, &mut buf, config)?,
        };
    }

    Ok(buf)
}

/// Parses a frame payload into a [`Message`] of a kind known to `schema`.
pub fn decode(schema: &Schema, payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut reader = PayloadReader::new(payload);

    let name = reader.string().map_err(|fault| match fault {
        Fault::Truncated => ProtocolError::MalformedMessage("truncated message name".into()),
        Fault::Invalid(e) => ProtocolError::MalformedMessage(format!("message name: {e}")),
    })?;
    let definition = schema
        .get(&name)
        .ok_or_else(|| ProtocolError::UnknownMessage(name.clone()))?;

    let mut values = Vec::with_capacity(definition.arity());
    for (argument, kind) in definition.arguments() {
        let value = match kind {
            ArgType::Int => reader.fixed::<i64>().map(Value::Int),
            ArgType::Float => reader.fixed::<f64>().map(Value::Float),
            ArgType::Str => reader.string().map(Value::Str),
            ArgType::Bool => reader.fixed::<bool>().map(Value::Bool),
        }
        .map_err(|fault| match fault {
            Fault::Truncated => ProtocolError::MalformedMessage(format!(
                "'{name}' ends before argument '{argument}'"
            )),
            Fault::Invalid(found) => ProtocolError::TypeMismatch {
                message: name.clone(),
                argument: argument.to_string(),
                expected: kind,
                found,
            },
        })?;
        values.push(value);
    }

    if reader.remaining() > 0 {
        return Err(ProtocolError::MalformedMessage(format!(
            "{} trailing bytes after '{name}'",
            reader.remaining()
        )));
    }

    Message::from_parts(Arc::clone(definition), values)
}

enum Fault {
    Truncated,
    Invalid(String),
}

impl From<DecodeError> for Fault {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::UnexpectedEnd { .. } => Fault::Truncated,
            DecodeError::InvalidBooleanValue(byte) => Fault::Invalid(format!("byte {byte:#04x}")),
            other => Fault::Invalid(other.to_string()),
        }
    }
}

struct PayloadReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn fixed<T: Decode<()>>(&mut self) -> Result<T, Fault> {
        let (value, read) = decode_from_slice(&self.bytes[self.offset..], config())?;
        self.offset += read;
        Ok(value)
    }

    // Length is checked against the payload before anything is allocated.
    fn string(&mut self) -> Result<String, Fault> {
        let len: u64 = self.fixed()?;
        let len = usize::try_from(len).map_err(|_| Fault::Truncated)?;
        if len > self.remaining() {
            return Err(Fault::Truncated);
        }

        let bytes = &self.bytes[self.offset..self.offset + len];
        let s = std::str::from_utf8(bytes)
            .map_err(|e| Fault::Invalid(format!("invalid UTF-8 ({e})")))?;
        self.offset += len;
        Ok(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::{DefinitionList, args};

    use super::*;

    fn schema() -> Schema {
        DefinitionList::from_text(
            "Ping\nItIs hours=int minutes=int\nSay text=str loud=bool\nScale factor=float\n",
        )
        .unwrap()
        .instantiate()
        .unwrap()
    }

    #[test]
    fn encode_decode_message() {
        let schema = schema();
        let msg = Message::new(
            &schema,
            "Say",
            args!(text = "grüße, world", loud = true),
        )
        .unwrap();

        let bytes = encode(&schema, &msg).unwrap();
        assert_eq!(decode(&schema, &bytes).unwrap(), msg);
    }

    #[test]
    fn payload_layout() {
        let schema = schema();
        let msg = Message::new(&schema, "ItIs", args!(hours = 7, minutes = -1)).unwrap();

        let bytes = encode(&schema, &msg).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&4u64.to_be_bytes());
        expected.extend_from_slice(b"ItIs");
        expected.extend_from_slice(&7i64.to_be_bytes());
        expected.extend_from_slice(&(-1i64).to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn float_and_bool_layout() {
        let schema = schema();
        let scale = Message::new(&schema, "Scale", args!(factor = 0.5)).unwrap();
        let bytes = encode(&schema, &scale).unwrap();
        assert_eq!(&bytes[13..], &0.5f64.to_be_bytes());

        let say = Message::new(&schema, "Say", args!(text = "", loud = true)).unwrap();
        let bytes = encode(&schema, &say).unwrap();
        assert_eq!(bytes.last(), Some(&1u8));
    }

    #[test]
    fn decode_unknown_message() {
        let schema = schema();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u64.to_be_bytes());
        bytes.extend_from_slice(b"Nope");

        let err = decode(&schema, &bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(name) if name == "Nope"));
    }

    #[test]
    fn decode_truncated_arguments() {
        let schema = schema();
        let msg = Message::new(&schema, "ItIs", args!(hours = 7, minutes = 8)).unwrap();
        let bytes = encode(&schema, &msg).unwrap();

        let err = decode(&schema, &bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn decode_trailing_bytes() {
        let schema = schema();
        let msg = Message::new(&schema, "Ping", args!()).unwrap();
        let mut bytes = encode(&schema, &msg).unwrap();
        bytes.push(0);

        let err = decode(&schema, &bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn decode_oversized_string_length() {
        let schema = schema();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());

        let err = decode(&schema, &bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn decode_invalid_bool() {
        let schema = schema();
        let msg = Message::new(&schema, "Say", args!(text = "a", loud = false)).unwrap();
        let mut bytes = encode(&schema, &msg).unwrap();
        *bytes.last_mut().unwrap() = 7;

        let err = decode(&schema, &bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TypeMismatch {
                expected: ArgType::Bool,
                ..
            }
        ));
    }

    #[test]
    fn decode_invalid_utf8() {
        let schema = schema();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u64.to_be_bytes());
        bytes.extend_from_slice(b"Say");
        bytes.extend_from_slice(&2u64.to_be_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.push(1);

        let err = decode(&schema, &bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TypeMismatch {
                expected: ArgType::Str,
                ..
            }
        ));
    }

    #[test]
    fn encode_rejects_foreign_definition() {
        let ours = schema();
        let theirs = DefinitionList::from_text("ItIs hours=int minutes=float")
            .unwrap()
            .instantiate()
            .unwrap();
        let msg = Message::new(&theirs, "ItIs", args!(hours = 1, minutes = 2.0)).unwrap();

        let err = encode(&ours, &msg).unwrap_err();
        assert!(matches!(err, ProtocolError::TypeMismatch { .. }));
    }

    #[test]
    fn encode_rejects_missing_and_extra_arguments() {
        let ours = schema();
        let shorter = DefinitionList::from_text("ItIs hours=int")
            .unwrap()
            .instantiate()
            .unwrap();
        let longer = DefinitionList::from_text("Ping extra=int")
            .unwrap()
            .instantiate()
            .unwrap();

        let msg = Message::new(&shorter, "ItIs", args!(hours = 1)).unwrap();
        assert!(matches!(
            encode(&ours, &msg),
            Err(ProtocolError::MissingArgument { argument, .. }) if argument == "minutes"
        ));

        let msg = Message::new(&longer, "Ping", args!(extra = 1)).unwrap();
        assert!(matches!(
            encode(&ours, &msg),
            Err(ProtocolError::UnexpectedArgument { argument, .. }) if argument == "extra"
        ));
    }
}
