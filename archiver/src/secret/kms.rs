//! The key-management-service adapter contract used by envelope encryption
//! (encryption version 2), plus the production implementation against AWS
//! KMS when the `kms` feature is enabled.

use async_trait::async_trait;

use super::SecretError;

/// Binds a DEK ciphertext to the context it was encrypted under, so a DEK
/// minted for one purpose can never be silently reused for another.
#[derive(Clone, Debug)]
pub struct EncryptionContext {
    pub application: String,
    pub purpose: String,
}

impl EncryptionContext {
    #[must_use]
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            application: "archiver".into(),
            purpose: purpose.into(),
        }
    }
}

/// Capability interface over a key-management service: encrypt/decrypt a
/// data-encryption key (DEK) under an encryption context. Injected as a
/// dependency so tests can substitute a fake without touching real KMS.
#[async_trait]
pub trait Kms: Send + Sync + std::fmt::Debug {
    /// Encrypts `plaintext_dek` under `key_id`, bound to `context`.
    async fn encrypt_dek(
        &self,
        key_id: &str,
        plaintext_dek: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, SecretError>;

    /// Decrypts a DEK ciphertext, verifying it was encrypted under
    /// `context`. Fails loudly (never returns empty) on a wrong key,
    /// tampered ciphertext, or mismatched context.
    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, SecretError>;
}

#[cfg(feature = "kms")]
mod aws {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use aws_sdk_kms::primitives::Blob;
    use aws_sdk_kms::Client;

    use super::{EncryptionContext, Kms, SecretError};

    /// Production [`Kms`] implementation backed by `aws-sdk-kms`.
    #[derive(Debug)]
    pub struct AwsKms {
        client: Client,
    }

    impl AwsKms {
        #[must_use]
        pub fn new(client: Client) -> Self {
            Self { client }
        }

        fn context_map(ctx: &EncryptionContext) -> HashMap<String, String> {
            let mut map = HashMap::new();
            let _ = map.insert("application".to_owned(), ctx.application.clone());
            let _ = map.insert("purpose".to_owned(), ctx.purpose.clone());
            map
        }
    }

    #[async_trait]
    impl Kms for AwsKms {
        async fn encrypt_dek(
            &self,
            key_id: &str,
            plaintext_dek: &[u8],
            context: &EncryptionContext,
        ) -> Result<Vec<u8>, SecretError> {
            let out = self
                .client
                .encrypt()
                .key_id(key_id)
                .plaintext(Blob::new(plaintext_dek.to_vec()))
                .set_encryption_context(Some(Self::context_map(context)))
                .send()
                .await
                .map_err(|e| SecretError::Decrypt(format!("kms encrypt: {e}")))?;
            out.ciphertext_blob
                .map(|b| b.into_inner())
                .ok_or_else(|| SecretError::Decrypt("kms returned no ciphertext".into()))
        }

        async fn decrypt_dek(
            &self,
            ciphertext: &[u8],
            context: &EncryptionContext,
        ) -> Result<Vec<u8>, SecretError> {
            let out = self
                .client
                .decrypt()
                .ciphertext_blob(Blob::new(ciphertext.to_vec()))
                .set_encryption_context(Some(Self::context_map(context)))
                .send()
                .await
                .map_err(|e| SecretError::Decrypt(format!("kms decrypt: {e}")))?;
            out.plaintext
                .map(|b| b.into_inner())
                .ok_or_else(|| SecretError::Decrypt("kms returned no plaintext".into()))
        }
    }
}

#[cfg(feature = "kms")]
pub use aws::AwsKms;
