//! APFS container

use crate::checkpoint::latest_superblock;
use crate::config::ContainerConfig;
use crate::keybag::KeyBag;
use crate::object::{OBJECT_TYPE_CONTAINER_KEYBAG, OBJECT_TYPE_NX_SUPERBLOCK};
use crate::omap::ObjectMap;
use crate::reader::BlockReader;
use crate::superblock::{NxSuperblock, MAGIC_OFFSET};
use crate::volume::Volume;
use fsapfs_core::{validate_index, ByteSource, Error, Result, MIN_BLOCK_SIZE};
use fsapfs_pipeline::{open_range, open_source, DataRange};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Decoded container metadata shared with volumes
pub(crate) struct ContainerState {
    pub reader: BlockReader,
    pub superblock: NxSuperblock,
    pub omap: ObjectMap,
    pub key_bag: Option<KeyBag>,
    /// Key bag present but unreadable
    pub key_bag_invalid: bool,
    pub config: ContainerConfig,
}

impl ContainerState {
    fn load(mut source: Box<dyn ByteSource>, config: &ContainerConfig) -> Result<Self> {
        let size = source.size();
        if size < (MAGIC_OFFSET + 4) as u64 {
            return Err(Error::signature(format!("Source of {} bytes is too small for a container", size)));
        }

        // Block zero up to the smallest block size holds the whole superblock
        let mut head = vec![0u8; size.min(MIN_BLOCK_SIZE as u64) as usize];
        source.read_at(0, &mut head)?;
        let block_size = NxSuperblock::parse(&head)?.block_size;

        let shared = Arc::new(Mutex::new(Some(source)));
        let reader = BlockReader::new(shared, block_size, config.verify_checksums);

        let (_, block_zero) = reader.read_object(0, Some(OBJECT_TYPE_NX_SUPERBLOCK))?;
        let superblock = latest_superblock(&reader, NxSuperblock::parse(&block_zero)?)?;
        tracing::debug!(
            "Container {} block size {} xid {} with {} volume(s)",
            superblock.uuid,
            superblock.block_size,
            superblock.xid(),
            superblock.volume_oids.len()
        );

        let omap = ObjectMap::load(&reader, superblock.omap_oid)?;

        let mut key_bag = None;
        let mut key_bag_invalid = false;
        if !superblock.keylocker.is_empty() {
            match KeyBag::read(&reader, superblock.keylocker, &superblock.uuid, OBJECT_TYPE_CONTAINER_KEYBAG) {
                Ok(bag) => key_bag = Some(bag),
                Err(e) => {
                    tracing::warn!("Unable to read container key bag: {}", e);
                    key_bag_invalid = true;
                }
            }
        }

        Ok(Self {
            reader,
            superblock,
            omap,
            key_bag,
            key_bag_invalid,
            config: config.clone(),
        })
    }
}

/// Read-only APFS container
///
/// # Example
///
/// ```rust,no_run
/// use fsapfs_container::Container;
///
/// let mut container = Container::new();
/// container.open("disk.apfs", "r")?;
/// for index in 0..container.number_of_volumes()? {
///     let volume = container.get_volume(index)?;
///     println!("{}", volume.name()?);
/// }
/// container.close()?;
/// # Ok::<(), fsapfs_core::Error>(())
/// ```
#[derive(Default)]
pub struct Container {
    config: ContainerConfig,
    state: Option<Arc<ContainerState>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ContainerConfig) -> Self {
        Self { config, state: None }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn check_mode(mode: &str) -> Result<()> {
        if mode != "r" {
            return Err(Error::invalid_argument(format!(
                "Unsupported access mode '{}', only 'r' is supported",
                mode
            )));
        }
        Ok(())
    }

    fn check_not_open(&self) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::already_open("Container is already open"));
        }
        Ok(())
    }

    /// Open a container image file
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a mode other than `"r"` or a path that
    /// is not a regular file, [`Error::AlreadyOpen`], [`Error::Signature`]
    /// if the file is not an APFS container, `Io`-kind errors for corrupt
    /// metadata.
    pub fn open(&mut self, path: impl AsRef<Path>, mode: &str) -> Result<()> {
        Self::check_mode(mode)?;
        self.check_not_open()?;
        let source = open_source(path.as_ref(), &self.config.open_options())?;
        self.open_source(source)
    }

    /// Open a container stored inside a byte range of a file
    pub fn open_range(&mut self, path: impl AsRef<Path>, range: DataRange, mode: &str) -> Result<()> {
        Self::check_mode(mode)?;
        self.check_not_open()?;
        let source = open_range(path.as_ref(), range, &self.config.open_options())?;
        self.open_source(source)
    }

    /// Open a container from a caller supplied source
    ///
    /// The container owns the source until [`Container::close`]. Nothing is
    /// kept when opening fails.
    pub fn open_source(&mut self, source: Box<dyn ByteSource>) -> Result<()> {
        self.check_not_open()?;
        let state = ContainerState::load(source, &self.config)?;
        self.state = Some(Arc::new(state));
        Ok(())
    }

    /// Release the source
    ///
    /// Volumes and file entries obtained from this container fail with
    /// [`Error::NotOpen`] afterwards.
    pub fn close(&mut self) -> Result<()> {
        let state = self
            .state
            .take()
            .ok_or_else(|| Error::not_open("Container is not open"))?;
        state.reader.release()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self) -> Result<&Arc<ContainerState>> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::not_open("Container is not open"))
    }

    /// Container size in bytes
    pub fn size(&self) -> Result<u64> {
        Ok(self.state()?.superblock.container_size())
    }

    pub fn block_size(&self) -> Result<u32> {
        Ok(self.state()?.superblock.block_size)
    }

    /// Container UUID
    pub fn identifier(&self) -> Result<Uuid> {
        Ok(self.state()?.superblock.uuid)
    }

    /// Transaction identifier of the checkpoint in use
    pub fn xid(&self) -> Result<u64> {
        Ok(self.state()?.superblock.xid())
    }

    pub fn number_of_volumes(&self) -> Result<usize> {
        Ok(self.state()?.superblock.volume_oids.len())
    }

    /// Unopened handle to a volume
    ///
    /// Set a password on it before calling [`Volume::open`].
    pub fn volume(&self, index: usize) -> Result<Volume> {
        let state = self.state()?;
        validate_index(index, state.superblock.volume_oids.len(), "Volume")?;
        Ok(Volume::new(index, state.clone()))
    }

    /// Opened handle to a volume, without a password
    pub fn get_volume(&self, index: usize) -> Result<Volume> {
        let mut volume = self.volume(index)?;
        volume.open()?;
        Ok(volume)
    }

    /// Unopened handles to every volume in slot order
    pub fn volumes(&self) -> Result<Vec<Volume>> {
        (0..self.number_of_volumes()?).map(|i| self.volume(i)).collect()
    }

    /// True if the container key bag exists but could not be decoded
    pub fn is_locked(&self) -> Result<bool> {
        Ok(self.state()?.key_bag_invalid)
    }
}
