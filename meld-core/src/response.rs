use serde::Serialize;
use serde_json::value::RawValue;

/// Error code vocabulary exposed to clients. These exact strings are the
/// only error surface a client ever sees; internal causes stay in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientError(pub &'static str);

pub const CLIENT_ERR_RATE_LIMIT_EXCEEDED: ClientError = ClientError("RATE_LIMIT_EXCEEDED");
pub const CLIENT_ERR_PAYLOAD_TOO_LARGE: ClientError = ClientError("PAYLOAD_TOO_LARGE");
pub const CLIENT_ERR_UPSTREAM_BODY_TOO_LARGE: ClientError = ClientError("UPSTREAM_BODY_TOO_LARGE");
pub const CLIENT_ERR_UPSTREAM_UNAVAILABLE: ClientError = ClientError("UPSTREAM_UNAVAILABLE");
pub const CLIENT_ERR_UPSTREAM_ERROR: ClientError = ClientError("UPSTREAM_ERROR");
pub const CLIENT_ERR_UPSTREAM_MALFORMED: ClientError = ClientError("UPSTREAM_MALFORMED");
pub const CLIENT_ERR_INTERNAL: ClientError = ClientError("INTERNAL");
pub const CLIENT_ERR_ABORTED: ClientError = ClientError("ABORTED");
pub const CLIENT_ERR_VALUE_CONFLICT: ClientError = ClientError("VALUE_CONFLICT");

impl ClientError {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Final JSON envelope written to the client.
///
/// `data` holds upstream bytes verbatim (no re-encoding), `errors` the
/// deduplicated client error codes. Both are omitted when empty.
#[derive(Debug, Serialize)]
pub struct ClientResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ClientError>,
}

impl ClientResponse {
    pub fn data(data: Option<Box<RawValue>>) -> Self {
        Self {
            data,
            errors: Vec::new(),
        }
    }

    pub fn error(code: ClientError) -> Self {
        Self {
            data: None,
            errors: vec![code],
        }
    }

    /// Serialize the envelope, falling back to a static INTERNAL body if
    /// serialization itself fails.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| br#"{"errors":["INTERNAL"]}"#.to_vec())
    }
}
