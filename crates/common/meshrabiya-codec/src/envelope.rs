use crate::messages::DelegationMessage;
use base64::{engine::general_purpose::STANDARD, Engine};
use meshrabiya_signer::{verify_detached, Signer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A delegation message wrapped with a detached signature over its canonical
/// JSON bytes. Unsigned envelopes are only valid on the
/// verbatim-JSON flow adapter; the typed adapter drops anything that fails
/// `verify_envelope`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub wrapper: DelegationMessage,
    pub signer_public_key: String,
    pub signature: String,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("signer produced no key or signature; cannot build a signed envelope")]
    Unsigned,
}

/// Wrap and sign a delegation message. The signature covers the UTF-8 bytes
/// of the canonical JSON serialization of `message`.
pub fn encode_envelope(
    message: DelegationMessage,
    signer: &dyn Signer,
) -> Result<SignedEnvelope, EnvelopeError> {
    let bytes = serde_json::to_vec(&message)?;
    let signer_public_key = signer.public_key_b64().ok_or(EnvelopeError::Unsigned)?;
    let signature_bytes = signer.sign(&bytes).ok_or(EnvelopeError::Unsigned)?;
    let signature = STANDARD.encode(signature_bytes);
    Ok(SignedEnvelope {
        wrapper: message,
        signer_public_key,
        signature,
    })
}

/// Recompute the signature over the payload bytes using the embedded public
/// key. Returns `false` for any malformed or tampered envelope.
pub fn verify_envelope(envelope: &SignedEnvelope) -> bool {
    match serde_json::to_vec(&envelope.wrapper) {
        Ok(bytes) => verify_detached(&bytes, &envelope.signer_public_key, &envelope.signature),
        Err(e) => {
            tracing::warn!(error = %e, "failed to re-serialize envelope wrapper for verification");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ResourceOffer;
    use meshrabiya_signer::Ed25519Signer;
    use uuid::Uuid;

    fn sample() -> DelegationMessage {
        DelegationMessage::Offer(ResourceOffer {
            request_id: Uuid::new_v4(),
            offerer_id: "peer1".into(),
            available_space: 100,
            estimated_bandwidth: 1000,
        })
    }

    #[test]
    fn encode_then_verify_succeeds() {
        let signer = Ed25519Signer::generate();
        let envelope = encode_envelope(sample(), &signer).unwrap();
        assert!(verify_envelope(&envelope));
    }

    #[test]
    fn tampered_wrapper_fails_verification() {
        let signer = Ed25519Signer::generate();
        let mut envelope = encode_envelope(sample(), &signer).unwrap();
        if let DelegationMessage::Offer(ref mut offer) = envelope.wrapper {
            offer.available_space += 1;
        }
        assert!(!verify_envelope(&envelope));
    }

    #[test]
    fn unsigned_signer_refuses_to_encode() {
        let signer = meshrabiya_signer::NoSigner;
        let result = encode_envelope(sample(), &signer);
        assert!(matches!(result, Err(EnvelopeError::Unsigned)));
    }

    #[test]
    fn envelope_json_round_trips() {
        let signer = Ed25519Signer::generate();
        let envelope = encode_envelope(sample(), &signer).unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: SignedEnvelope = serde_json::from_str(&json).unwrap();
        assert!(verify_envelope(&decoded));
    }
}
