//! Error types surfaced by the voice client.
//!
//! Only [`ConnectError`] ever reaches the caller. Decode problems on the
//! control channel are logged and dropped where they happen, and a transport
//! drop is reported through the presence state instead of an error.

/// Microphone or speaker could not be used.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("microphone access was denied")]
    PermissionDenied,
    #[error("no audio input device is available")]
    NoInputDevice,
    #[error("no audio output device is available")]
    NoOutputDevice,
    #[error("audio device error: {0}")]
    Device(String),
}

/// Failures reported by the peer-connection implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("invalid session description: {0}")]
    Description(String),
}

/// Failures of the offer/answer exchange with the signaling service.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("signaling service rejected the credential")]
    Unauthorized,
    #[error("signaling service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed signaling answer: {0}")]
    MalformedAnswer(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no local session description is available")]
    MissingLocalDescription,
}

/// Why a `connect()` attempt failed. The message is meant for the user.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not access the microphone: {0}")]
    MediaAcquisition(#[from] MediaError),
    #[error("could not establish the voice connection: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("a voice session is already active")]
    AlreadyActive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_messages() {
        let err = ConnectError::from(MediaError::PermissionDenied);
        assert_eq!(
            err.to_string(),
            "could not access the microphone: microphone access was denied"
        );

        let err = ConnectError::from(NegotiationError::from(SignalingError::Status {
            status: 502,
            body: "bad gateway".into(),
        }));
        assert_eq!(
            err.to_string(),
            "could not establish the voice connection: signaling service returned status 502: bad gateway"
        );

        assert_eq!(
            ConnectError::AlreadyActive.to_string(),
            "a voice session is already active"
        );
    }
}
