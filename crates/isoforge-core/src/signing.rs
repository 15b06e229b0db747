//! HMAC-SHA256 signing for channel tokens and download URLs.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{BuildId, Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies short messages with a shared secret.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::InvalidInput("signing key must not be empty".to_string()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::Internal(format!("invalid signing key: {e}")))?;
        Ok(Self { mac })
    }

    /// Hex-encoded signature of `message`.
    pub fn sign(&self, message: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex signature.
    pub fn verify(&self, message: &str, signature: &str) -> bool {
        let Ok(sig_bytes) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        mac.verify_slice(&sig_bytes).is_ok()
    }

    /// Bearer token a worker uses to write its own status record.
    pub fn channel_token(&self, build_id: BuildId) -> String {
        self.sign(&format!("channel:{build_id}"))
    }

    pub fn verify_channel_token(&self, build_id: BuildId, token: &str) -> bool {
        self.verify(&format!("channel:{build_id}"), token)
    }

    /// Signature over a download grant.
    pub fn download_signature(&self, build_id: BuildId, file: &str, expires: i64) -> String {
        self.sign(&format!("download:{build_id}/{file}:{expires}"))
    }

    pub fn verify_download(
        &self,
        build_id: BuildId,
        file: &str,
        expires: i64,
        signature: &str,
    ) -> bool {
        self.verify(&format!("download:{build_id}/{file}:{expires}"), signature)
    }
}
