//! Marshalling boundary for receiver descriptors and response errors.

use thiserror::Error;

use crate::message::RemoteError;
use crate::receiver::StreamReceiver;

#[derive(Clone, Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {what}: {detail}")]
    Encode { what: &'static str, detail: String },
    #[error("failed to decode {what}: {detail}")]
    Decode { what: &'static str, detail: String },
    /// The payload references receiver code this process never deployed.
    #[error("response references unknown class {class_name}")]
    UnknownClass { class_name: String },
}

/// Encodes receiver descriptors for the wire and decodes response error
/// payloads. Injected so deployments can swap the format without touching
/// the streamer.
pub trait WireCodec: Send + Sync + 'static {
    fn encode_receiver(&self, receiver: &StreamReceiver) -> Result<Vec<u8>, CodecError>;

    fn decode_receiver(&self, bytes: &[u8]) -> Result<StreamReceiver, CodecError>;

    fn encode_error(&self, error: &RemoteError) -> Result<Vec<u8>, CodecError>;

    /// Decode a response's opaque error payload.
    ///
    /// Implementations without code shipping must reject payloads that
    /// reference a receiver class they never deployed.
    fn decode_error(&self, bytes: &[u8]) -> Result<RemoteError, CodecError>;
}

/// JSON codec used by in-process clusters and as the default wire format.
#[derive(Clone, Debug, Default)]
pub struct JsonCodec {
    /// Accept error payloads that name a custom receiver class. Off unless
    /// the deployment negotiated code shipping.
    permit_foreign_classes: bool,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_foreign_classes() -> Self {
        Self {
            permit_foreign_classes: true,
        }
    }
}

impl WireCodec for JsonCodec {
    fn encode_receiver(&self, receiver: &StreamReceiver) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(receiver).map_err(|err| CodecError::Encode {
            what: "receiver",
            detail: err.to_string(),
        })
    }

    fn decode_receiver(&self, bytes: &[u8]) -> Result<StreamReceiver, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode {
            what: "receiver",
            detail: err.to_string(),
        })
    }

    fn encode_error(&self, error: &RemoteError) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(error).map_err(|err| CodecError::Encode {
            what: "response error",
            detail: err.to_string(),
        })
    }

    fn decode_error(&self, bytes: &[u8]) -> Result<RemoteError, CodecError> {
        let err: RemoteError =
            serde_json::from_slice(bytes).map_err(|err| CodecError::Decode {
                what: "response error",
                detail: err.to_string(),
            })?;
        if !self.permit_foreign_classes {
            if let Some(class_name) = &err.class_name {
                return Err(CodecError::UnknownClass {
                    class_name: class_name.clone(),
                });
            }
        }
        Ok(err)
    }
}
