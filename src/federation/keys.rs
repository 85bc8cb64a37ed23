//! Actor signing identity
//!
//! One RSA keypair per site, generated on first start and persisted as PEM.

use std::path::Path;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use url::Url;

use super::signature::SignatureError;
use crate::error::AppError;

/// Key size for newly generated actor keys
pub const ACTOR_KEY_BITS: usize = 2048;

/// Private key plus the actor and key id it is published under
#[derive(Clone)]
pub struct SigningIdentity {
    actor: Url,
    key_id: Url,
    signing_key: SigningKey<Sha256>,
    public_key_pem: String,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("actor", &self.actor)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Build an identity from a PEM private key (PKCS#8, or PKCS#1 `RSA PRIVATE KEY`).
    pub fn from_pem(private_key_pem: &str, actor: Url) -> Result<Self, SignatureError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| SignatureError::InvalidPrivateKey(e.to_string()))?;
        Self::from_private_key(private_key, actor)
    }

    fn from_private_key(private_key: RsaPrivateKey, actor: Url) -> Result<Self, SignatureError> {
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SignatureError::InvalidPrivateKey(e.to_string()))?;

        let mut key_id = actor.clone();
        key_id.set_fragment(Some("main-key"));

        Ok(Self {
            actor,
            key_id,
            signing_key: SigningKey::<Sha256>::new(private_key),
            public_key_pem,
        })
    }

    /// Load the key at `path`, generating and persisting a new one if absent.
    pub async fn load_or_create(path: &Path, actor: Url) -> Result<Self, AppError> {
        match tokio::fs::read_to_string(path).await {
            Ok(pem) => {
                tracing::info!(path = %path.display(), "Loaded actor key");
                Ok(Self::from_pem(&pem, actor)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), bits = ACTOR_KEY_BITS, "Generating actor key");
                let private_key_pem = tokio::task::spawn_blocking(generate_private_key_pem)
                    .await
                    .map_err(|e| AppError::Internal(e.into()))?
                    .map_err(AppError::Internal)?;

                write_private_key(path, &private_key_pem).await?;
                Ok(Self::from_pem(&private_key_pem, actor)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn actor(&self) -> &Url {
        &self.actor
    }

    /// `<actor>#main-key`
    pub fn key_id(&self) -> &Url {
        &self.key_id
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub(crate) fn signing_key(&self) -> &SigningKey<Sha256> {
        &self.signing_key
    }
}

fn generate_private_key_pem() -> Result<String, anyhow::Error> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, ACTOR_KEY_BITS)?;
    Ok(private_key.to_pkcs8_pem(LineEnding::LF)?.to_string())
}

async fn write_private_key(path: &Path, pem: &str) -> Result<(), AppError> {
    let path = path.to_path_buf();
    let pem = pem.to_string();
    tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
        use std::io::Write;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))??;
    Ok(())
}
