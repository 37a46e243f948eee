//! Encryption primitives
//!
//! APFS encrypts metadata and file data with AES-XTS over 512-byte sectors.
//! Keys are protected with RFC 3394 AES key wrapping; password-derived keys
//! come from PBKDF2-HMAC-SHA256.

use aes::cipher::KeyInit;
use aes::Aes128;
use aes_kw::{KekAes128, KekAes256};
use fsapfs_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;
use xts_mode::{get_tweak_default, Xts128};

/// XTS data unit size
pub const SECTOR_SIZE: usize = 512;

/// Upper bound on PBKDF2 rounds accepted from a key bag
pub const MAX_KDF_ITERATIONS: u64 = 10_000_000;

/// AES-128-XTS key pair
#[derive(Clone)]
pub struct VolumeKey {
    data_key: [u8; 16],
    tweak_key: [u8; 16],
}

impl fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VolumeKey(..)")
    }
}

impl VolumeKey {
    /// Split a 32-byte unwrapped volume key into its two halves
    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::corrupt(format!("Volume key is {} bytes, expected 32", key.len())));
        }
        let mut data_key = [0u8; 16];
        let mut tweak_key = [0u8; 16];
        data_key.copy_from_slice(&key[..16]);
        tweak_key.copy_from_slice(&key[16..]);
        Ok(Self { data_key, tweak_key })
    }

    /// Key of a 16-byte volume key, tweak half derived by hashing
    ///
    /// The tweak key is the first half of SHA-256 over the key followed by
    /// the key identifier.
    pub fn from_half_key(key: &[u8], identifier: &Uuid) -> Result<Self> {
        if key.len() != 16 {
            return Err(Error::corrupt(format!("Volume key is {} bytes, expected 16", key.len())));
        }
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(identifier.as_bytes());
        let digest = hasher.finalize();

        let mut data_key = [0u8; 16];
        let mut tweak_key = [0u8; 16];
        data_key.copy_from_slice(key);
        tweak_key.copy_from_slice(&digest[..16]);
        Ok(Self { data_key, tweak_key })
    }

    /// Key protecting key bags: both halves are the owner's UUID
    pub fn from_uuid(uuid: &Uuid) -> Self {
        Self {
            data_key: *uuid.as_bytes(),
            tweak_key: *uuid.as_bytes(),
        }
    }

    fn cipher(&self) -> Result<Xts128<Aes128>> {
        let data = Aes128::new_from_slice(&self.data_key)
            .map_err(|_| Error::corrupt("Invalid AES data key length"))?;
        let tweak = Aes128::new_from_slice(&self.tweak_key)
            .map_err(|_| Error::corrupt("Invalid AES tweak key length"))?;
        Ok(Xts128::new(data, tweak))
    }

    /// Decrypt whole sectors in place, the first one numbered `first_sector`
    pub fn decrypt(&self, data: &mut [u8], first_sector: u64) -> Result<()> {
        check_sector_multiple(data.len())?;
        self.cipher()?
            .decrypt_area(data, SECTOR_SIZE, first_sector as u128, get_tweak_default);
        Ok(())
    }

    /// Encrypt whole sectors in place, the first one numbered `first_sector`
    #[cfg(test)]
    pub fn encrypt(&self, data: &mut [u8], first_sector: u64) -> Result<()> {
        check_sector_multiple(data.len())?;
        self.cipher()?
            .encrypt_area(data, SECTOR_SIZE, first_sector as u128, get_tweak_default);
        Ok(())
    }
}

fn check_sector_multiple(len: usize) -> Result<()> {
    if len % SECTOR_SIZE != 0 {
        return Err(Error::corrupt(format!(
            "Encrypted area of {} bytes is not a whole number of sectors",
            len
        )));
    }
    Ok(())
}

/// Derive a key from a password with PBKDF2-HMAC-SHA256
pub fn derive_password_key(password: &str, salt: &[u8], iterations: u64, key_len: usize) -> Result<Vec<u8>> {
    if iterations == 0 || iterations > MAX_KDF_ITERATIONS {
        return Err(Error::corrupt(format!("Implausible PBKDF2 iteration count {}", iterations)));
    }
    let mut key = vec![0u8; key_len];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations as u32, &mut key);
    Ok(key)
}

/// Unwrap an RFC 3394 wrapped key
///
/// Returns `None` when the integrity check fails, which is what a wrong
/// key produces.
pub fn unwrap_key(kek: &[u8], wrapped: &[u8]) -> Result<Option<Vec<u8>>> {
    let unwrapped = match kek.len() {
        32 => {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(kek);
            KekAes256::from(bytes).unwrap_vec(wrapped)
        }
        16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(kek);
            KekAes128::from(bytes).unwrap_vec(wrapped)
        }
        other => {
            return Err(Error::corrupt(format!("Key encryption key of {} bytes", other)));
        }
    };
    Ok(unwrapped.ok())
}

/// Wrap a key with RFC 3394 key wrapping
#[cfg(test)]
pub fn wrap_key(kek: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let wrapped = match kek.len() {
        32 => {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(kek);
            KekAes256::from(bytes).wrap_vec(key)
        }
        16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(kek);
            KekAes128::from(bytes).wrap_vec(key)
        }
        other => {
            return Err(Error::invalid_argument(format!("Key encryption key of {} bytes", other)));
        }
    };
    wrapped.map_err(|_| Error::invalid_argument("Key length unsuitable for wrapping"))
}
