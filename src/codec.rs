// Copyright 2020 Joyent, Inc.

//! Body codecs, selected per message by its protocol tag.
//!
//! Codecs translate between body bytes and `serde_json::Value`, which is the
//! common data model handed to typed method handlers.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::protocol::JSON_PROTOC;

pub type CodecError = Box<dyn StdError + Send + Sync>;

pub trait Codec: Send + Sync {
    fn decode(&self, body: &[u8]) -> Result<Value, CodecError>;
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(body)?)
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }
}

/// Protocol tag to codec mapping. Starts out with [`JsonCodec`] under
/// `json`.
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let registry = CodecRegistry {
            codecs: RwLock::new(HashMap::new()),
        };
        registry.set_codec(JSON_PROTOC, JsonCodec);
        registry
    }

    pub fn set_codec<P, C>(&self, protoc: P, codec: C)
    where
        P: Into<String>,
        C: Codec + 'static,
    {
        self.codecs.write().insert(protoc.into(), Arc::new(codec));
    }

    pub fn get(&self, protoc: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.read().get(protoc).cloned()
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.codecs.read().keys().cloned().collect();
        tags.sort();
        tags
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    struct UpperCodec;

    impl Codec for UpperCodec {
        fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
            Ok(Value::from(String::from_utf8(body.to_vec())?.to_lowercase()))
        }

        fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
            let text = value.as_str().ok_or("expected a string")?;
            Ok(text.to_uppercase().into_bytes())
        }
    }

    #[test]
    fn json_is_installed_by_default() {
        let codecs = CodecRegistry::new();
        let json = codecs.get("json").unwrap();

        let value = json.decode(br#"{"A":6,"B":7}"#).unwrap();
        assert_eq!(value, json!({"A": 6, "B": 7}));
        assert_eq!(json.encode(&json!({"Pro": 42})).unwrap(), br#"{"Pro":42}"#);
        assert!(json.decode(b"{not json").is_err());
        assert!(codecs.get("msgpack").is_none());
    }

    #[test]
    fn codecs_are_pluggable() {
        let codecs = CodecRegistry::new();
        codecs.set_codec("upper", UpperCodec);

        let upper = codecs.get("upper").unwrap();
        assert_eq!(upper.decode(b"HELLO").unwrap(), json!("hello"));
        assert_eq!(upper.encode(&json!("hi")).unwrap(), b"HI");
        assert_eq!(codecs.protocols(), vec!["json", "upper"]);
    }
}
