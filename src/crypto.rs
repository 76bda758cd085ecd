//! Cryptographic logics.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::{Aes256Gcm, Key};
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::Argon2 as ArgonConfig;

const NONCE_SIZE: usize = 12;
const KEY_LENGTH: usize = 32;
const SALT_LENGTH: usize = 16;
/// Default lifetime of a sealed token.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 60);
/// Live tokens a vault remembers before forgetting the oldest.
pub const VAULT_CAPACITY: usize = 4096;
/// Salt of the sealer master key; per-token salts are mixed in afterwards.
const MASTER_SALT: &[u8] = b"lexica.sealed.v1";

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("encryption failure")]
    AesGcm,
    #[error("argon2 error: {0}")]
    Argon2(String),
    #[error("token is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("encrypted data is not utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("data length is {value} while at least {excepted} is excepted")]
    Length { value: usize, excepted: usize },
}

/// Cryptographic manager.
pub struct Crypto {
    pub pwd: PasswordManager,
    pub vault: TokenVault,
}

impl Crypto {
    /// Create a new [`Crypto`].
    ///
    /// `secret` seeds the keys of sealed tokens; `kdf` tunes their key
    /// derivation, while `config` tunes password hashing.
    pub fn new(
        config: Option<ArgonConfig>,
        secret: impl AsRef<[u8]>,
        kdf: Option<ArgonConfig>,
    ) -> Result<Self> {
        let pwd = PasswordManager::new(config)?;
        let sealer = TokenSealer::new(secret, kdf)?;

        Ok(Self {
            pwd,
            vault: TokenVault::new(sealer),
        })
    }
}

/// SymmetricKey holds a fixed-size key protected by Zeroizing.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; KEY_LENGTH]>);

impl SymmetricKey {
    /// Derive key from a password and salt using Argon2id.
    pub fn derive_from_password(
        password: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
        params: &Params,
    ) -> Result<Self> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            params.clone(),
        );

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        argon2
            .hash_password_into(password.as_ref(), salt.as_ref(), &mut key[..])
            .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self(key))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// SymmetricCipher provides encrypt/decrypt operations with AES-256-GCM.
pub struct SymmetricCipher {
    key: SymmetricKey,
}

impl SymmetricCipher {
    /// Create a new [`SymmetricCipher`].
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// Encrypts data returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        // Generate random 96-bit nonce.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        let cipher_text = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| CryptoError::AesGcm)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + cipher_text.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&cipher_text);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext`.
    pub fn decrypt(&self, data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let data = data.as_ref();
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::Length {
                value: data.len(),
                excepted: NONCE_SIZE,
            });
        }

        let (nonce_bytes, cipher_text) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, cipher_text)
            .map_err(|_| CryptoError::AesGcm)
    }
}

/// Seals short messages into opaque URL-safe tokens.
///
/// A token is `base64url(salt || nonce || ciphertext)`. The secret is
/// stretched with Argon2id once; every token then gets a fresh salt, hence a
/// fresh key `sha256(master || salt)`.
pub struct TokenSealer {
    master: SymmetricKey,
}

impl TokenSealer {
    /// Create a new [`TokenSealer`].
    pub fn new(
        secret: impl AsRef<[u8]>,
        kdf: Option<ArgonConfig>,
    ) -> Result<Self> {
        let kdf = kdf.unwrap_or(ArgonConfig {
            memory_cost: 1024 * 19, // 19 MiB.
            iterations: 2,
            parallelism: 1,
            hash_length: KEY_LENGTH,
        });

        let params = Params::new(
            kdf.memory_cost,
            kdf.iterations,
            kdf.parallelism,
            Some(KEY_LENGTH),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self {
            master: SymmetricKey::derive_from_password(secret, MASTER_SALT, &params)?,
        })
    }

    fn token_key(&self, salt: &[u8]) -> SymmetricKey {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(
            &Sha256::new()
                .chain_update(self.master.as_slice())
                .chain_update(salt)
                .finalize(),
        );

        SymmetricKey(key)
    }

    /// Seal a message.
    pub fn seal(&self, message: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);

        let sealed = SymmetricCipher::new(self.token_key(&salt)).encrypt(message)?;

        let mut out = Vec::with_capacity(SALT_LENGTH + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&sealed);

        Ok(URL_SAFE.encode(out))
    }

    /// Open a token. Any failure yields `None`.
    pub fn open(&self, token: &str) -> Option<String> {
        match self.try_open(token) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::debug!(error = %err, "failed to open sealed token");
                None
            },
        }
    }

    fn try_open(&self, token: &str) -> Result<String> {
        let data = URL_SAFE.decode(token.trim())?;
        if data.len() < SALT_LENGTH + NONCE_SIZE {
            return Err(CryptoError::Length {
                value: data.len(),
                excepted: SALT_LENGTH + NONCE_SIZE,
            });
        }

        let (salt, sealed) = data.split_at(SALT_LENGTH);
        let plain = SymmetricCipher::new(self.token_key(salt)).decrypt(sealed)?;

        Ok(String::from_utf8(plain)?)
    }
}

struct IssuedToken {
    value: String,
    issued_at: Instant,
    lifetime: Duration,
}

impl IssuedToken {
    fn is_alive(&self, now: Instant) -> bool {
        now.duration_since(self.issued_at) < self.lifetime
    }
}

/// Sealed tokens with a server-side registry of live values.
pub struct TokenVault {
    sealer: TokenSealer,
    issued: Mutex<VecDeque<IssuedToken>>,
}

impl TokenVault {
    /// Create a new [`TokenVault`].
    pub fn new(sealer: TokenSealer) -> Self {
        Self {
            sealer,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    #[cfg(test)]
    fn remembered(&self) -> usize {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Seal `message` and remember the token for `lifetime`, or ten minutes.
    /// Expired tokens are forgotten first, then the oldest ones while the
    /// vault is full.
    pub fn issue(
        &self,
        message: &str,
        lifetime: Option<Duration>,
    ) -> Result<String> {
        let value = self.sealer.seal(message)?;
        let now = Instant::now();

        let mut issued =
            self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        issued.retain(|token| token.is_alive(now));
        while issued.len() >= VAULT_CAPACITY {
            issued.pop_front();
        }
        issued.push_back(IssuedToken {
            value: value.clone(),
            issued_at: now,
            lifetime: lifetime.unwrap_or(TOKEN_LIFETIME),
        });

        Ok(value)
    }

    /// Whether `value` was issued here and is still alive.
    /// Expired tokens are forgotten along the way.
    pub fn validate(&self, value: &str) -> bool {
        let now = Instant::now();
        let mut issued =
            self.issued.lock().unwrap_or_else(PoisonError::into_inner);

        issued.retain(|token| token.is_alive(now));
        issued.iter().any(|token| token.value == value)
    }

    /// Message carried by a token, without checking the registry.
    pub fn data(&self, value: &str) -> Option<String> {
        self.sealer.open(value)
    }

    /// Validate, forget and open a token in one step.
    pub fn consume(&self, value: &str) -> Option<String> {
        let now = Instant::now();
        {
            let mut issued =
                self.issued.lock().unwrap_or_else(PoisonError::into_inner);
            issued.retain(|token| token.is_alive(now));

            let position =
                issued.iter().position(|token| token.value == value)?;
            issued.remove(position);
        }

        self.data(value)
    }

    /// Forget every issued token.
    pub fn clear(&self) {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: &str,
    ) -> bool {
        PasswordHash::new(phc_hash)
            .map(|parsed| {
                self.argon2()
                    .verify_password(password.as_ref(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

/// Digest data into hex-encoded SHA256.
pub fn digest(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

#[cfg(test)]
pub(crate) fn light_argon2() -> ArgonConfig {
    ArgonConfig {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: KEY_LENGTH,
    }
}
