// src/registry.rs

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A payload with a stable wire name carried in the `type` property.
pub trait MessageType: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

pub(crate) type TypedData = Arc<dyn Any + Send + Sync>;

type Decoder = Arc<dyn Fn(&Value) -> serde_json::Result<TypedData> + Send + Sync>;

/// Closed mapping from a message `type` to the Rust type it decodes into.
///
/// Built once at startup and shared by `Arc`; there is no global instance.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    decoders: HashMap<String, Decoder>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: MessageType>(&mut self) -> &mut Self {
        self.register_as::<T>(T::TYPE_NAME)
    }

    /// Registers `T` under a name other than its own, e.g. for a legacy alias.
    pub fn register_as<T>(&mut self, type_name: impl Into<String>) -> &mut Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let decoder: Decoder = Arc::new(|value: &Value| {
            let data: T = T::deserialize(value)?;
            Ok(Arc::new(data) as TypedData)
        });
        self.decoders.insert(type_name.into(), decoder);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Decodes `value` when `type_name` is registered; `Ok(None)` otherwise.
    pub(crate) fn decode(
        &self,
        type_name: Option<&str>,
        value: &Value,
    ) -> serde_json::Result<Option<TypedData>> {
        match type_name.and_then(|name| self.decoders.get(name)) {
            Some(decoder) => decoder(value).map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}
