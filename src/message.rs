// src/message.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::broker::{BrokerConnection, Delivery, DeliveryFields, MessageProperties};
use crate::errors::{MessengerError, Result};
use crate::registry::{MessageType, TypeRegistry, TypedData};

/// Reply sent when a request handler fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub name: String,
    pub message: String,
}

impl MessageType for ErrorReply {
    const TYPE_NAME: &'static str = "ErrorReply";
}

impl ErrorReply {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// An inbound delivery that passed validation.
///
/// The JSON body is parsed once here; when the `type` property names a
/// registered type the decoded value is kept alongside it.
pub struct Message {
    fields: DeliveryFields,
    properties: MessageProperties,
    content: Vec<u8>,
    json: Value,
    typed: Option<TypedData>,
    replier: Option<Arc<dyn BrokerConnection>>,
}

impl Message {
    pub fn new(
        delivery: Delivery,
        registry: &TypeRegistry,
        replier: Option<Arc<dyn BrokerConnection>>,
    ) -> Result<Self> {
        let fields = delivery
            .fields
            .ok_or_else(|| MessengerError::validation("delivery has no fields"))?;
        let properties = delivery
            .properties
            .ok_or_else(|| MessengerError::validation("delivery has no properties"))?;
        if delivery.content.is_empty() {
            return Err(MessengerError::validation("delivery has no content"));
        }

        let json: Value = serde_json::from_slice(&delivery.content)
            .map_err(|err| MessengerError::validation(format!("content is not JSON: {err}")))?;
        let typed = registry
            .decode(properties.message_type.as_deref(), &json)
            .map_err(|err| {
                MessengerError::validation(format!(
                    "content does not decode as {}: {err}",
                    properties.message_type.as_deref().unwrap_or_default()
                ))
            })?;

        Ok(Self {
            fields,
            properties,
            content: delivery.content,
            json,
            typed,
            replier,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.fields.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.fields.routing_key
    }

    pub fn consumer_tag(&self) -> &str {
        &self.fields.consumer_tag
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn message_type(&self) -> Option<&str> {
        self.properties.message_type.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.properties.headers
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn json(&self) -> &Value {
        &self.json
    }

    /// The registry-decoded payload, if its type was registered as `T`.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.typed.as_deref()?.downcast_ref::<T>()
    }

    /// Decodes the JSON body as any `T`, registered or not.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.json)?)
    }

    pub fn is_request(&self) -> bool {
        self.properties.reply_to.is_some() && self.properties.correlation_id.is_some()
    }

    /// Sends `data` back to the requester's reply queue.
    pub async fn respond<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        self.reply(data, None).await
    }

    pub async fn respond_error(&self, error: &ErrorReply) -> Result<()> {
        self.reply(error, Some(ErrorReply::TYPE_NAME)).await
    }

    async fn reply<T: Serialize + ?Sized>(&self, data: &T, message_type: Option<&str>) -> Result<()> {
        let reply_to = self
            .reply_to()
            .ok_or_else(|| MessengerError::validation("message has no reply_to"))?;
        let replier = self
            .replier
            .as_ref()
            .ok_or_else(|| MessengerError::validation("message cannot be replied to"))?;

        let content = serde_json::to_vec(data)?;
        let properties = MessageProperties {
            correlation_id: self.properties.correlation_id.clone(),
            message_type: message_type.map(str::to_owned),
            headers: self.properties.headers.clone(),
            reply_to: None,
        };
        debug!(reply_to, correlation_id = ?self.correlation_id(), "Sending reply");
        replier.publish("", reply_to, content, properties).await?;
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("fields", &self.fields)
            .field("properties", &self.properties)
            .field("json", &self.json)
            .field("typed", &self.typed.is_some())
            .finish()
    }
}
