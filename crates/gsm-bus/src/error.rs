#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("broker setup failed after {attempts} attempt(s)")]
    SetupFailed {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("publish to `{subject}` failed after {attempts} attempt(s)")]
    PublishFailed {
        subject: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("broker is closed")]
    BrokerClosed,
    #[error("broker is not connected")]
    NotConnected,
    #[error("failed to encode event")]
    Encode(#[from] serde_json::Error),
    #[error("broker close failed")]
    Close(#[source] anyhow::Error),
}

impl BusError {
    /// Whether the upstream platform should be asked to redeliver.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::PublishFailed { .. } | BusError::BrokerClosed | BusError::NotConnected
        )
    }
}
