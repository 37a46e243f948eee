//! Volumes and unlocking

use crate::btree::{check_node_kind, check_tree_subtype, collect_range, BTreeNode, PhysicalNodes};
use crate::container::ContainerState;
use crate::crypto::VolumeKey;
use crate::file_entry::FileEntry;
use crate::filesystem::FileSystem;
use crate::fstree::{split_key_header, SnapshotMetadata, APFS_TYPE_SNAP_METADATA, ROOT_DIR_INO_NUM};
use crate::keybag::{KeyBag, WrappedKey};
use crate::object::{OBJECT_TYPE_FS, OBJECT_TYPE_SNAP_META_TREE, OBJECT_TYPE_VOLUME_KEYBAG};
use crate::omap::ObjectMap;
use crate::superblock::{ApfsSuperblock, VolumeFeatures, VolumeRole};
use chrono::{DateTime, Utc};
use fsapfs_core::{apfs_time_to_datetime, Error, ErrorKind, Result};
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

/// Snapshot of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    /// Transaction identifier the snapshot preserves
    pub xid: u64,
    pub creation_time: Option<DateTime<Utc>>,
    /// Physical block of the snapshot's volume superblock
    pub superblock_oid: u64,
}

struct OpenVolume {
    superblock: ApfsSuperblock,
    fs: Arc<FileSystem>,
    key_bag: Option<KeyBag>,
}

enum VolumeState {
    Unopened,
    /// Encrypted and no supplied secret unwrapped the volume key
    Locked(OpenVolume),
    /// Readable; the file system holds the volume key if there is one
    Unlocked(OpenVolume),
    Closed,
}

/// One volume of a container
///
/// Obtained from [`crate::Container::volume`]. Passwords set before
/// [`Volume::open`] are tried on open; ones set later take effect through
/// [`Volume::unlock`].
pub struct Volume {
    index: usize,
    container: Arc<ContainerState>,
    password: Option<String>,
    recovery_password: Option<String>,
    state: VolumeState,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume").field("index", &self.index).finish()
    }
}

impl Volume {
    pub(crate) fn new(index: usize, container: Arc<ContainerState>) -> Self {
        Self {
            index,
            container,
            password: None,
            recovery_password: None,
            state: VolumeState::Unopened,
        }
    }

    /// Index of the volume in the container
    pub fn index(&self) -> usize {
        self.index
    }

    /// Set the password used to unlock the volume
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(password.into());
    }

    /// Set the recovery key, tried after the password
    pub fn set_recovery_password(&mut self, password: impl Into<String>) {
        self.recovery_password = Some(password.into());
    }


    pub fn is_open(&self) -> bool {
        matches!(self.state, VolumeState::Locked(_) | VolumeState::Unlocked(_))
    }

    /// Decode the volume superblock and unlock the volume if possible
    ///
    /// A wrong password is not an error: the volume opens locked.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyOpen`] if the volume is open, [`Error::NotOpen`] if
    /// the container was closed, `Io`-kind errors for corrupt metadata.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::already_open(format!("Volume {} is already open", self.index)));
        }
        let container = &self.container;
        if !container.reader.is_open() {
            return Err(Error::not_open("Container has been closed"));
        }

        let reader = &container.reader;
        let xid = container.superblock.xid();
        let oid = *container
            .superblock
            .volume_oids
            .get(self.index)
            .ok_or_else(|| Error::index_out_of_bounds(format!("No volume {}", self.index)))?;

        let mapping = container.omap.resolve(reader, oid, xid)?;
        let (_, data) = reader.read_object(mapping.paddr, Some(OBJECT_TYPE_FS))?;
        let superblock = ApfsSuperblock::parse(&data)?;
        tracing::debug!(
            "Volume {} '{}' superblock at block {}",
            self.index,
            superblock.volume_name,
            mapping.paddr
        );

        let omap = ObjectMap::load(reader, superblock.omap_oid)?;

        let key_bag_extent = match &container.key_bag {
            Some(bag) if superblock.is_encrypted() => bag.volume_key_bag_extent(&superblock.uuid)?,
            _ => None,
        };
        let encrypted = key_bag_extent.is_some();
        if superblock.is_encrypted() && !encrypted {
            tracing::debug!("Volume {} has no software encryption keys", self.index);
        }

        let secrets = secrets(&self.password, &self.recovery_password);

        let mut key_bag = None;
        let mut key = None;
        if let Some(extent) = key_bag_extent {
            let read = KeyBag::read(reader, extent, &superblock.uuid, OBJECT_TYPE_VOLUME_KEYBAG);
            key_bag = match read {
                Ok(bag) => Some(bag),
                // Without a secret the bag only supplies the hint
                Err(e) if secrets.is_empty() => {
                    tracing::warn!("Unable to read key bag of volume {}: {}", self.index, e);
                    None
                }
                Err(e) => return Err(e),
            };

            if let Some(bag) = &key_bag {
                key = try_secrets(container, self.index, bag, &superblock.uuid, &secrets)?;
            }
        }

        let fs = Arc::new(FileSystem::new(
            reader.clone(),
            omap,
            xid,
            superblock.root_tree_oid,
            encrypted,
            superblock.features,
            container.config.clone(),
        ));
        let unlocked = !encrypted || key.is_some();
        if let Some(key) = key {
            fs.set_key(key);
        }
        let open = OpenVolume {
            superblock,
            fs,
            key_bag,
        };

        self.state = if unlocked {
            VolumeState::Unlocked(open)
        } else {
            tracing::debug!("Volume {} is locked", self.index);
            VolumeState::Locked(open)
        };
        Ok(())
    }

    /// Unlock an open, locked volume with the passwords set so far
    ///
    /// Returns whether the volume is unlocked afterwards. A wrong password
    /// leaves it locked. File entries obtained while locked become readable.
    ///
    /// # Errors
    ///
    /// [`Error::NotOpen`] if the volume is not open, `Io`-kind errors if
    /// the key bag cannot be read.
    pub fn unlock(&mut self) -> Result<bool> {
        let open = match &mut self.state {
            VolumeState::Unlocked(open) => {
                open.fs.ensure_open()?;
                return Ok(true);
            }
            VolumeState::Locked(open) => open,
            _ => return Err(Error::not_open(format!("Volume {} is not open", self.index))),
        };
        open.fs.ensure_open()?;

        let uuid = open.superblock.uuid;
        if open.key_bag.is_none() {
            let extent = self
                .container
                .key_bag
                .as_ref()
                .map(|bag| bag.volume_key_bag_extent(&uuid))
                .transpose()?
                .flatten()
                .ok_or_else(|| Error::corrupt(format!("No key bag for volume {}", uuid)))?;
            open.key_bag = Some(KeyBag::read(&self.container.reader, extent, &uuid, OBJECT_TYPE_VOLUME_KEYBAG)?);
        }

        let secrets = secrets(&self.password, &self.recovery_password);
        let key = match &open.key_bag {
            Some(bag) => try_secrets(&self.container, self.index, bag, &uuid, &secrets)?,
            None => None,
        };
        let Some(key) = key else {
            tracing::debug!("Volume {} stays locked", self.index);
            return Ok(false);
        };
        open.fs.set_key(key);

        if let VolumeState::Locked(open) = std::mem::replace(&mut self.state, VolumeState::Closed) {
            self.state = VolumeState::Unlocked(open);
        }
        Ok(true)
    }

    /// Close the volume; entries derived from it become unusable
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, VolumeState::Closed) {
            VolumeState::Locked(open) | VolumeState::Unlocked(open) => {
                open.fs.mark_closed();
                Ok(())
            }
            previous => {
                self.state = previous;
                Err(Error::not_open(format!("Volume {} is not open", self.index)))
            }
        }
    }

    fn opened(&self) -> Result<&OpenVolume> {
        match &self.state {
            VolumeState::Locked(open) | VolumeState::Unlocked(open) => {
                open.fs.ensure_open()?;
                Ok(open)
            }
            _ => Err(Error::not_open(format!("Volume {} is not open", self.index))),
        }
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.opened()?.superblock.volume_name.clone())
    }

    /// Volume UUID
    pub fn identifier(&self) -> Result<Uuid> {
        Ok(self.opened()?.superblock.uuid)
    }

    /// Volume size is not derivable from the volume superblock
    pub fn size(&self) -> Result<u64> {
        self.opened()?;
        Err(Error::not_supported("Volume size"))
    }

    /// Name of the software that formatted the volume
    pub fn formatted_by(&self) -> Result<String> {
        Ok(self.opened()?.superblock.formatted_by.clone())
    }

    pub fn last_modification_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(apfs_time_to_datetime(self.opened()?.superblock.last_modified_time))
    }

    pub fn next_file_entry_identifier(&self) -> Result<u64> {
        Ok(self.opened()?.superblock.next_obj_id)
    }

    pub fn number_of_snapshots(&self) -> Result<u64> {
        Ok(self.opened()?.superblock.num_snapshots)
    }

    /// True while the volume key is unavailable
    pub fn is_locked(&self) -> Result<bool> {
        self.opened()?;
        Ok(matches!(self.state, VolumeState::Locked(_)))
    }

    pub fn features(&self) -> Result<VolumeFeatures> {
        Ok(self.opened()?.superblock.features)
    }

    pub fn role(&self) -> Result<VolumeRole> {
        Ok(VolumeRole::from_raw(self.opened()?.superblock.role))
    }

    /// Password hint from the volume key bag
    pub fn passphrase_hint(&self) -> Result<Option<String>> {
        Ok(self.opened()?.key_bag.as_ref().and_then(|b| b.passphrase_hint()))
    }

    /// Root directory handle, available whether or not the volume is locked
    pub fn root_directory(&self) -> Result<FileEntry> {
        let open = self.opened()?;
        Ok(FileEntry::new(open.fs.clone(), ROOT_DIR_INO_NUM, None))
    }

    /// Look up an entry by its file system identifier
    pub fn file_entry_by_identifier(&self, identifier: u64) -> Result<FileEntry> {
        let open = self.opened()?;
        let inode = open.fs.inode(identifier)?;
        Ok(FileEntry::with_inode(open.fs.clone(), inode))
    }

    /// Look up an entry by `/`-separated path from the root directory
    pub fn file_entry_by_path(&self, path: &str) -> Result<FileEntry> {
        if path.is_empty() {
            return Err(Error::invalid_argument("Empty path"));
        }

        let mut entry = self.root_directory()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            entry = entry
                .child_by_name(component)?
                .ok_or_else(|| Error::not_found(format!("No entry '{}' in path {}", component, path)))?;
        }
        Ok(entry)
    }

    /// Snapshots listed in the snapshot metadata tree
    pub fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let open = self.opened()?;
        let tree = open.superblock.snap_meta_tree_oid;
        if tree == 0 {
            return Ok(Vec::new());
        }

        let reader = &self.container.reader;
        let (header, data) = reader.read_object(tree, None)?;
        check_node_kind(&header, tree)?;
        check_tree_subtype(&header, OBJECT_TYPE_SNAP_META_TREE)?;
        let root = BTreeNode::parse(&data, None)?;
        let nodes = PhysicalNodes::new(reader, None);
        let records = collect_range(&nodes, root, |_| Ordering::Equal, usize::MAX)?;

        let mut snapshots = Vec::new();
        for record in records {
            let (_, kind) = split_key_header(&record.key)?;
            if kind != APFS_TYPE_SNAP_METADATA {
                continue;
            }
            let meta = SnapshotMetadata::parse(&record.key, &record.value)?;
            snapshots.push(Snapshot {
                name: meta.name,
                xid: meta.xid,
                creation_time: apfs_time_to_datetime(meta.creation_time),
                superblock_oid: meta.superblock_oid,
            });
        }
        Ok(snapshots)
    }
}

/// Passwords in the order they are tried
fn secrets<'a>(password: &'a Option<String>, recovery_password: &'a Option<String>) -> Vec<&'a str> {
    [password.as_deref(), recovery_password.as_deref()]
        .into_iter()
        .flatten()
        .collect()
}

/// Try each secret against each key encryption key
fn try_secrets(
    container: &ContainerState,
    index: usize,
    bag: &KeyBag,
    volume_uuid: &Uuid,
    secrets: &[&str],
) -> Result<Option<VolumeKey>> {
    if secrets.is_empty() {
        return Ok(None);
    }

    let blob = container
        .key_bag
        .as_ref()
        .and_then(|b| b.volume_key_blob(volume_uuid))
        .ok_or_else(|| Error::corrupt(format!("No wrapped volume key for volume {}", volume_uuid)))?;
    let volume_key = WrappedKey::parse(blob)?;

    for secret in secrets {
        for entry in bag.wrapped_keks() {
            let kek = WrappedKey::parse(&entry.data)?;
            let unwrapped = match kek.unlock_with_password(secret) {
                Ok(Some(unwrapped)) => unwrapped,
                Ok(None) => continue,
                Err(e) if e.kind() == ErrorKind::NotSupported => {
                    tracing::warn!("Skipping key encryption key {}: {}", kek.uuid, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(key) = volume_key.unlock_volume_key(&unwrapped)? {
                tracing::debug!("Volume {} unlocked with key {}", index, kek.uuid);
                return Ok(Some(key));
            }
            tracing::warn!("Key encryption key {} does not unwrap the volume key", kek.uuid);
        }
    }

    Ok(None)
}
