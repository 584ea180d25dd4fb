//! Wire format of the proof that accompanies an encrypted input batch.
//!
//! `numHandles (1) || numSigners (1) || handles (32 each) || signatures (65 each) || extraData`
use crate::eip712::SIGNATURE_LENGTH;
use crate::handle::{CiphertextHandle, HANDLE_LENGTH};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum InputProofError {
    #[error("input proof is truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("input proof cannot carry more than 255 {0}")]
    TooMany(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputProof {
    pub handles: Vec<CiphertextHandle>,
    pub signatures: Vec<[u8; SIGNATURE_LENGTH]>,
    pub extra_data: Vec<u8>,
}

impl InputProof {
    pub fn to_bytes(&self) -> Result<Vec<u8>, InputProofError> {
        let num_handles =
            u8::try_from(self.handles.len()).map_err(|_| InputProofError::TooMany("handles"))?;
        let num_signers = u8::try_from(self.signatures.len())
            .map_err(|_| InputProofError::TooMany("signatures"))?;
        let mut out = Vec::with_capacity(
            2 + self.handles.len() * HANDLE_LENGTH
                + self.signatures.len() * SIGNATURE_LENGTH
                + self.extra_data.len(),
        );
        out.push(num_handles);
        out.push(num_signers);
        for handle in &self.handles {
            out.extend_from_slice(handle.as_bytes());
        }
        for sig in &self.signatures {
            out.extend_from_slice(sig);
        }
        out.extend_from_slice(&self.extra_data);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InputProofError> {
        if bytes.len() < 2 {
            return Err(InputProofError::Truncated {
                needed: 2,
                actual: bytes.len(),
            });
        }
        let num_handles = bytes[0] as usize;
        let num_signers = bytes[1] as usize;
        let needed = 2 + num_handles * HANDLE_LENGTH + num_signers * SIGNATURE_LENGTH;
        if bytes.len() < needed {
            return Err(InputProofError::Truncated {
                needed,
                actual: bytes.len(),
            });
        }
        let mut offset = 2;
        let mut handles = Vec::with_capacity(num_handles);
        for _ in 0..num_handles {
            let mut buf = [0u8; HANDLE_LENGTH];
            buf.copy_from_slice(&bytes[offset..offset + HANDLE_LENGTH]);
            handles.push(CiphertextHandle::from_bytes(buf));
            offset += HANDLE_LENGTH;
        }
        let mut signatures = Vec::with_capacity(num_signers);
        for _ in 0..num_signers {
            let mut buf = [0u8; SIGNATURE_LENGTH];
            buf.copy_from_slice(&bytes[offset..offset + SIGNATURE_LENGTH]);
            signatures.push(buf);
            offset += SIGNATURE_LENGTH;
        }
        Ok(Self {
            handles,
            signatures,
            extra_data: bytes[offset..].to_vec(),
        })
    }
}
