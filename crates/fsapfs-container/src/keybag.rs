//! Key bags and wrapped key blobs
//!
//! The container key bag (the "keylocker") holds each encrypted volume's
//! wrapped volume encryption key and the location of the volume's own key
//! bag. A volume key bag holds key encryption keys, each wrapped with a
//! password-derived key. Both bags are stored AES-XTS encrypted with their
//! owner's UUID as key.

use crate::crypto::{derive_password_key, unwrap_key, VolumeKey};
use crate::object::{le_u16, slice, PhysicalRange, OBJECT_HEADER_SIZE};
use crate::reader::BlockReader;
use fsapfs_core::{Error, Result, MAX_KEY_BAG_SIZE};
use uuid::Uuid;

/// Container key bag entry: wrapped volume encryption key
pub const KB_TAG_VOLUME_KEY: u16 = 2;
/// Container key bag entry: location of a volume key bag
pub const KB_TAG_VOLUME_UNLOCK_RECORDS: u16 = 3;
/// Volume key bag entry: wrapped key encryption key
pub const KB_TAG_WRAPPED_KEK: u16 = 3;
/// Volume key bag entry: password hint
pub const KB_TAG_PASSPHRASE_HINT: u16 = 4;

const KEY_BAG_HEADER_SIZE: usize = 16;
const KEY_BAG_ENTRY_HEADER_SIZE: usize = 24;

/// Key bag format version
pub const KEY_BAG_VERSION: u16 = 2;

/// One key bag record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBagEntry {
    pub uuid: Uuid,
    pub tag: u16,
    pub data: Vec<u8>,
}

/// Decrypted key bag
#[derive(Debug, Clone, Default)]
pub struct KeyBag {
    pub entries: Vec<KeyBagEntry>,
}

impl KeyBag {
    /// Read, decrypt and parse a key bag
    ///
    /// `owner` is the container UUID for the container key bag and the
    /// volume UUID for a volume key bag.
    pub fn read(reader: &BlockReader, extent: PhysicalRange, owner: &Uuid, expected_kind: u32) -> Result<Self> {
        let size = extent.count.saturating_mul(reader.block_size() as u64);
        if extent.is_empty() || size > MAX_KEY_BAG_SIZE {
            return Err(Error::corrupt(format!(
                "Key bag extent of {} blocks at {} is implausible",
                extent.count, extent.start
            )));
        }

        let mut data = reader.read_blocks(extent.start, extent.count)?;
        VolumeKey::from_uuid(owner).decrypt(&mut data, reader.sector_of_block(extent.start)?)?;
        let (_, data) = reader.check_object(extent.start, data, Some(expected_kind))?;

        let bag = Self::parse(&data)?;
        tracing::debug!(
            "Key bag at block {} holds {} entries",
            extent.start,
            bag.entries.len()
        );
        Ok(bag)
    }

    /// Parse a decrypted key bag object
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = slice(data, OBJECT_HEADER_SIZE, KEY_BAG_HEADER_SIZE, "Key bag header")?;
        let version = le_u16(header, 0);
        let count = le_u16(header, 2) as usize;

        if version != KEY_BAG_VERSION {
            return Err(Error::corrupt(format!("Unsupported key bag version {}", version)));
        }

        let mut entries = Vec::with_capacity(count);
        let mut offset = OBJECT_HEADER_SIZE + KEY_BAG_HEADER_SIZE;

        for _ in 0..count {
            let entry = slice(data, offset, KEY_BAG_ENTRY_HEADER_SIZE, "Key bag entry")?;

            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&entry[0..16]);
            let tag = le_u16(entry, 16);
            let length = le_u16(entry, 18) as usize;

            let value = slice(data, offset + KEY_BAG_ENTRY_HEADER_SIZE, length, "Key bag entry data")?;
            entries.push(KeyBagEntry {
                uuid: Uuid::from_bytes(uuid),
                tag,
                data: value.to_vec(),
            });

            // Entries are aligned to 16 bytes
            offset += (KEY_BAG_ENTRY_HEADER_SIZE + length + 15) & !15;
        }

        Ok(Self { entries })
    }

    fn find(&self, uuid: &Uuid, tag: u16) -> Option<&KeyBagEntry> {
        self.entries.iter().find(|e| e.uuid == *uuid && e.tag == tag)
    }

    /// Wrapped volume encryption key blob of a volume
    pub fn volume_key_blob(&self, volume: &Uuid) -> Option<&[u8]> {
        self.find(volume, KB_TAG_VOLUME_KEY).map(|e| e.data.as_slice())
    }

    /// Location of the key bag of a volume
    pub fn volume_key_bag_extent(&self, volume: &Uuid) -> Result<Option<PhysicalRange>> {
        self.find(volume, KB_TAG_VOLUME_UNLOCK_RECORDS)
            .map(|e| PhysicalRange::parse(&e.data))
            .transpose()
    }

    /// Wrapped key encryption keys in a volume key bag
    pub fn wrapped_keks(&self) -> impl Iterator<Item = &KeyBagEntry> {
        self.entries.iter().filter(|e| e.tag == KB_TAG_WRAPPED_KEK)
    }

    /// Password hint stored in a volume key bag
    pub fn passphrase_hint(&self) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.tag == KB_TAG_PASSPHRASE_HINT)
            .map(|e| String::from_utf8_lossy(&e.data).trim_end_matches('\0').to_string())
    }
}

/// Encryption method of a wrapped key: AES-256 key wrapping
pub const KEY_METHOD_AES_256: u32 = 0;
/// Encryption method of a password-wrapped key: AES-256 key wrapping
/// (alternate); never used for volume keys
pub const KEY_METHOD_AES_256_ALT: u32 = 16;
/// Encryption method of a wrapped key: AES-128 key wrapping
pub const KEY_METHOD_AES_128: u32 = 2;

/// Wrapped key blob (a key encryption key or volume encryption key)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub uuid: Uuid,
    pub encryption_method: u32,
    pub wrapped: Vec<u8>,
    /// PBKDF2 rounds, zero for keys not derived from a password
    pub iterations: u64,
    pub salt: Vec<u8>,
}

impl WrappedKey {
    /// Parse a wrapped key blob
    ///
    /// The blob is a DER-like sequence (tag 0x30) holding an HMAC, a
    /// property field and a nested object (tag 0xa3) with the key
    /// identifier (0x81), metadata (0x82), wrapped key (0x83), iteration
    /// count (0x84) and salt (0x85).
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let (tag, body, _) = read_tlv(blob)?;
        if tag != 0x30 {
            return Err(Error::corrupt(format!("Wrapped key blob starts with tag 0x{:02x}", tag)));
        }

        let mut object = None;
        let mut rest = body;
        while !rest.is_empty() {
            let (tag, value, next) = read_tlv(rest)?;
            if tag == 0 && value.is_empty() {
                break;
            }
            if tag == 0xa3 {
                object = Some(value);
            }
            rest = next;
        }
        let object = object.ok_or_else(|| Error::corrupt("Wrapped key blob has no key object"))?;

        let mut key = WrappedKey {
            uuid: Uuid::nil(),
            encryption_method: 0,
            wrapped: Vec::new(),
            iterations: 0,
            salt: Vec::new(),
        };

        let mut rest = object;
        while !rest.is_empty() {
            let (tag, value, next) = read_tlv(rest)?;
            match tag {
                0x00 if value.is_empty() => break,
                0x81 => {
                    if value.len() != 16 {
                        return Err(Error::corrupt("Wrapped key identifier is not 16 bytes"));
                    }
                    let mut uuid = [0u8; 16];
                    uuid.copy_from_slice(value);
                    key.uuid = Uuid::from_bytes(uuid);
                }
                0x82 => {
                    if value.len() != 8 {
                        return Err(Error::corrupt("Wrapped key metadata is not 8 bytes"));
                    }
                    key.encryption_method = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                }
                0x83 => {
                    if value.len() != 24 && value.len() != 40 {
                        return Err(Error::corrupt(format!("Wrapped key of {} bytes", value.len())));
                    }
                    key.wrapped = value.to_vec();
                }
                0x84 => {
                    if value.is_empty() || value.len() > 8 {
                        return Err(Error::corrupt("Iteration count field has invalid size"));
                    }
                    key.iterations = value.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
                }
                0x85 => {
                    if value.len() != 16 {
                        return Err(Error::corrupt("Salt is not 16 bytes"));
                    }
                    key.salt = value.to_vec();
                }
                _ => {}
            }
            rest = next;
        }

        if key.wrapped.is_empty() {
            return Err(Error::corrupt("Wrapped key blob has no wrapped key"));
        }
        Ok(key)
    }

    /// Length of the unwrapped key for the encryption method
    fn key_len(&self) -> Result<usize> {
        match self.encryption_method {
            KEY_METHOD_AES_256 | KEY_METHOD_AES_256_ALT => Ok(32),
            KEY_METHOD_AES_128 => Ok(16),
            other => Err(Error::not_supported(format!("Key encryption method {}", other))),
        }
    }

    fn volume_key_len(&self) -> Result<usize> {
        match self.encryption_method {
            KEY_METHOD_AES_256 => Ok(32),
            KEY_METHOD_AES_128 => Ok(16),
            other => Err(Error::not_supported(format!("Volume key encryption method {}", other))),
        }
    }

    /// Unwrap a password-protected key encryption key
    ///
    /// Returns `None` if the password is wrong.
    pub fn unlock_with_password(&self, password: &str) -> Result<Option<Vec<u8>>> {
        let key_len = self.key_len()?;
        if self.salt.is_empty() {
            return Err(Error::corrupt("Password-protected key has no salt"));
        }
        let password_key = derive_password_key(password, &self.salt, self.iterations, key_len)?;
        self.unwrap_with(&password_key, key_len)
    }

    /// Unwrap a volume encryption key with a key encryption key
    ///
    /// Returns `None` if the key encryption key does not fit.
    pub fn unlock_volume_key(&self, kek: &[u8]) -> Result<Option<VolumeKey>> {
        let key_len = self.volume_key_len()?;
        if kek.len() < key_len {
            return Ok(None);
        }
        match self.unwrap_with(&kek[..key_len], key_len)? {
            Some(vek) if key_len == 32 => Ok(Some(VolumeKey::from_bytes(&vek)?)),
            Some(vek) => Ok(Some(VolumeKey::from_half_key(&vek, &self.uuid)?)),
            None => Ok(None),
        }
    }

    fn unwrap_with(&self, kek: &[u8], key_len: usize) -> Result<Option<Vec<u8>>> {
        if self.wrapped.len() != key_len + 8 {
            return Err(Error::corrupt(format!(
                "Wrapped key of {} bytes for a {} byte key",
                self.wrapped.len(),
                key_len
            )));
        }
        unwrap_key(kek, &self.wrapped)
    }
}

/// Split one tag-length-value item off the front of a buffer
///
/// Returns the tag, the value and the remaining bytes. Lengths of 0x80 and
/// above use the long form with one or two big-endian length bytes.
fn read_tlv(data: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    if data.len() < 2 {
        return Err(Error::corrupt("Truncated wrapped key item"));
    }
    let tag = data[0];
    let (length, header) = match data[1] {
        short if short & 0x80 == 0 => (short as usize, 2),
        0x81 => {
            let byte = *data.get(2).ok_or_else(|| Error::corrupt("Truncated item length"))?;
            (byte as usize, 3)
        }
        0x82 => {
            let bytes = data.get(2..4).ok_or_else(|| Error::corrupt("Truncated item length"))?;
            (u16::from_be_bytes([bytes[0], bytes[1]]) as usize, 4)
        }
        other => {
            return Err(Error::corrupt(format!("Unsupported item length form 0x{:02x}", other)));
        }
    };

    let value = slice(data, header, length, "Wrapped key item")?;
    Ok((tag, value, &data[header + length..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::wrap_key;
    use crate::testutil::{key_bag_object, wrapped_key_blob};

    #[test]
    fn test_key_bag_parse_alignment() {
        let a = Uuid::from_bytes([0xaa; 16]);
        let b = Uuid::from_bytes([0xbb; 16]);
        let entries = vec![
            KeyBagEntry { uuid: a, tag: 2, data: vec![1, 2, 3] },
            KeyBagEntry { uuid: b, tag: 3, data: [7u64.to_le_bytes(), 1u64.to_le_bytes()].concat() },
            KeyBagEntry { uuid: b, tag: 4, data: b"my hint".to_vec() },
        ];
        let data = key_bag_object(4096, 0x6b65_7973, &entries);

        let bag = KeyBag::parse(&data).unwrap();
        assert_eq!(bag.entries, entries);
        assert_eq!(bag.volume_key_blob(&a), Some(&[1u8, 2, 3][..]));
        assert_eq!(
            bag.volume_key_bag_extent(&b).unwrap(),
            Some(PhysicalRange { start: 7, count: 1 })
        );
        assert!(bag.volume_key_bag_extent(&a).unwrap().is_none());
        assert_eq!(bag.passphrase_hint().as_deref(), Some("my hint"));
    }

    #[test]
    fn test_key_bag_truncated_entry() {
        let entries = vec![KeyBagEntry { uuid: Uuid::nil(), tag: 2, data: vec![0u8; 64] }];
        let mut data = key_bag_object(4096, 0x6b65_7973, &entries);
        // Claim far more data than the object holds
        data[48 + 18..48 + 20].copy_from_slice(&0xfff0u16.to_le_bytes());
        assert!(KeyBag::parse(&data).is_err());
    }

    #[test]
    fn test_wrapped_key_parse() {
        let id = Uuid::from_bytes([0x42; 16]);
        let blob = wrapped_key_blob(&id, KEY_METHOD_AES_256, &[0x5a; 40], Some((1000, [9u8; 16])));

        let key = WrappedKey::parse(&blob).unwrap();
        assert_eq!(key.uuid, id);
        assert_eq!(key.encryption_method, 0);
        assert_eq!(key.wrapped, vec![0x5a; 40]);
        assert_eq!(key.iterations, 1000);
        assert_eq!(key.salt, vec![9u8; 16]);

        assert!(WrappedKey::parse(&blob[..20]).is_err());
        assert!(WrappedKey::parse(&[0x31, 0x00]).is_err());
    }

    #[test]
    fn test_password_unlock_chain() {
        let salt = [3u8; 16];
        let kek = [0x11u8; 32];
        let vek = [0x22u8; 32];
        let id = Uuid::from_bytes([0x42; 16]);

        let password_key = derive_password_key("secret", &salt, 1000, 32).unwrap();
        let kek_blob = wrapped_key_blob(&id, 0, &wrap_key(&password_key, &kek).unwrap(), Some((1000, salt)));
        let vek_blob = wrapped_key_blob(&id, 0, &wrap_key(&kek, &vek).unwrap(), None);

        let wrapped_kek = WrappedKey::parse(&kek_blob).unwrap();
        assert!(wrapped_kek.unlock_with_password("wrong").unwrap().is_none());
        let unlocked = wrapped_kek.unlock_with_password("secret").unwrap().unwrap();
        assert_eq!(unlocked, kek);

        let wrapped_vek = WrappedKey::parse(&vek_blob).unwrap();
        assert!(wrapped_vek.unlock_volume_key(&[0u8; 32]).unwrap().is_none());
        assert!(wrapped_vek.unlock_volume_key(&unlocked).unwrap().is_some());
    }

    #[test]
    fn test_unknown_method_not_supported() {
        let blob = wrapped_key_blob(&Uuid::nil(), 7, &[0u8; 40], Some((10, [0u8; 16])));
        let key = WrappedKey::parse(&blob).unwrap();
        assert_eq!(
            key.unlock_with_password("x").unwrap_err().kind(),
            fsapfs_core::ErrorKind::NotSupported
        );
    }

    #[test]
    fn test_volume_key_method_restricted() {
        let kek = [0x11u8; 32];
        let wrapped = wrap_key(&kek, &[0x22u8; 32]).unwrap();

        let alternate = WrappedKey::parse(&wrapped_key_blob(&Uuid::nil(), KEY_METHOD_AES_256_ALT, &wrapped, None)).unwrap();
        assert_eq!(
            alternate.unlock_volume_key(&kek).unwrap_err().kind(),
            fsapfs_core::ErrorKind::NotSupported
        );

        let standard = WrappedKey::parse(&wrapped_key_blob(&Uuid::nil(), KEY_METHOD_AES_256, &wrapped, None)).unwrap();
        assert!(standard.unlock_volume_key(&kek).unwrap().is_some());
    }

    #[test]
    fn test_password_key_accepts_alternate_method() {
        let salt = [4u8; 16];
        let password_key = derive_password_key("secret", &salt, 1000, 32).unwrap();
        let blob = wrapped_key_blob(
            &Uuid::nil(),
            KEY_METHOD_AES_256_ALT,
            &wrap_key(&password_key, &[0x11u8; 32]).unwrap(),
            Some((1000, salt)),
        );
        let key = WrappedKey::parse(&blob).unwrap();
        assert_eq!(key.unlock_with_password("secret").unwrap().unwrap(), vec![0x11u8; 32]);
    }
}
