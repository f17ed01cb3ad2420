/// Errors from the control-plane transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The control plane returned a non-2xx status code.
    #[error("Control plane error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx response whose body did not report `"status": "ok"`.
    #[error("Control plane rejected request: {0}")]
    Rejected(String),

    /// A response body that did not have the expected shape.
    #[error("Unexpected response body: {0}")]
    Decode(String),

    /// The push channel could not deliver a frame.
    #[error("Push channel error: {0}")]
    Push(String),
}

impl TransportError {
    /// HTTP status code, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
