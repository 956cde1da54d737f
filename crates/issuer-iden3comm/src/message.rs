use crate::PackerError;
use issuer_types::{media_type, Did};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Envelope kinds an agent message can travel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Plain,
    Signed,
    Zkp,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => media_type::PLAIN,
            Self::Signed => media_type::SIGNED,
            Self::Zkp => media_type::ZKP,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = PackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            media_type::PLAIN => Ok(Self::Plain),
            media_type::SIGNED => Ok(Self::Signed),
            media_type::ZKP => Ok(Self::Zkp),
            other => Err(PackerError::UnsupportedMediaType(other.to_string())),
        }
    }
}

/// The fields every Iden3comm message carries. `body` stays untyped until
/// the dispatcher knows the message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl BasicMessage {
    /// Starts a new thread.
    pub fn new(message_type: &str, from: &Did, to: Option<String>, body: Value) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            thid: Some(id.clone()),
            id,
            typ: Some(media_type::PLAIN.to_string()),
            message_type: message_type.to_string(),
            from: Some(from.to_string()),
            to,
            body,
        }
    }

    /// A response in this message's thread, addressed to its sender.
    pub fn reply(&self, message_type: &str, from: &Did, body: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            typ: self.typ.clone(),
            message_type: message_type.to_string(),
            thid: Some(self.thread_id().to_string()),
            from: Some(from.to_string()),
            to: self.from.clone(),
            body,
        }
    }

    pub fn thread_id(&self) -> &str {
        self.thid.as_deref().unwrap_or(&self.id)
    }

    /// # Errors
    ///
    /// [`PackerError::Malformed`] when `from` is missing or not a DID.
    pub fn sender(&self) -> Result<Did, PackerError> {
        self.from
            .as_deref()
            .ok_or_else(|| PackerError::Malformed("message has no sender".into()))?
            .parse()
            .map_err(|e| PackerError::Malformed(format!("sender: {e}")))
    }

    /// # Errors
    ///
    /// [`PackerError::Malformed`] when the body does not match `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, PackerError> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| PackerError::Malformed(format!("{} body: {e}", self.message_type)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequestBody {
    pub callback_url: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub scope: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferedCredential {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsOfferBody {
    pub url: String,
    pub credentials: Vec<OfferedCredential>,
}

/// `id` names the offered credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialFetchRequestBody {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialIssuanceBody {
    pub credential: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationStatusRequestBody {
    pub revocation_nonce: u64,
}
