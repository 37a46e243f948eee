//! fsapfsinfo - shows information about APFS containers
//!
//! Prints the container and its volumes, or with `-F`, `-E` or `-H` the
//! file entries of one volume. `-B` writes a bodyfile of every entry.

mod bodyfile;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fsapfs_container::{Container, ContainerConfig, FileEntry, Volume, VolumeFeatures, VolumeRole};
use fsapfs_core::{format_size, ErrorKind, FileEntryInfo};
use fsapfs_pipeline::DataRange;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "fsapfsinfo")]
#[command(about = "Show information about an APFS container", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Container image or device
    image: PathBuf,

    /// Byte offset of the container within the image
    #[arg(short = 'o', long, default_value_t = 0)]
    offset: i64,

    /// Password used to unlock encrypted volumes
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Recovery password used to unlock encrypted volumes
    #[arg(short = 'r', long)]
    recovery_password: Option<String>,

    /// Volume to inspect, starting at 1 (defaults to all volumes, or the
    /// first one for -F, -E with an identifier and -H)
    #[arg(short = 'f', long, value_name = "INDEX")]
    volume: Option<usize>,

    /// Show the file entry at a path, such as /Users/name
    #[arg(short = 'F', long, value_name = "PATH")]
    file_entry: Option<String>,

    /// Show the file entry with an identifier, or "all" for every entry
    #[arg(short = 'E', long, value_name = "IDENTIFIER")]
    identifier: Option<EntrySelection>,

    /// Show the file system hierarchy
    #[arg(short = 'H', long)]
    hierarchy: bool,

    /// Write file system information as a bodyfile
    #[arg(short = 'B', long, value_name = "FILE")]
    bodyfile: Option<PathBuf>,

    /// Print volume and file entry information as JSON
    #[arg(long)]
    json: bool,

    /// Skip object checksum verification
    #[arg(long)]
    no_checksums: bool,

    /// Read with buffered I/O instead of memory mapping
    #[arg(long)]
    no_mmap: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Verbose output, same as --log-level debug
    #[arg(short = 'v', long)]
    verbose: bool,
}

/// Argument of `-E`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntrySelection {
    All,
    Identifier(u64),
}

impl FromStr for EntrySelection {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        if value == "all" {
            return Ok(EntrySelection::All);
        }
        value
            .parse()
            .map(EntrySelection::Identifier)
            .map_err(|_| format!("expected a file entry identifier or \"all\", got '{}'", value))
    }
}

impl Cli {
    fn entry_mode(&self) -> bool {
        self.file_entry.is_some() || self.identifier.is_some() || self.hierarchy
    }

    fn all_entries(&self) -> bool {
        self.identifier == Some(EntrySelection::All)
    }
}

#[derive(Serialize)]
struct VolumeReport {
    index: usize,
    identifier: String,
    name: String,
    role: VolumeRole,
    features: VolumeFeatures,
    formatted_by: String,
    next_file_entry_identifier: u64,
    locked: bool,
    snapshots: Vec<SnapshotReport>,
}

#[derive(Serialize)]
struct SnapshotReport {
    name: String,
    xid: u64,
    creation_time: Option<String>,
}

#[derive(Serialize)]
struct EntryReport {
    path: Option<String>,
    #[serde(flatten)]
    info: FileEntryInfo,
    symlink_target: Option<String>,
    extended_attributes: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ContainerConfig {
        use_mmap: !cli.no_mmap,
        verify_checksums: !cli.no_checksums,
        ..ContainerConfig::default()
    };
    let mut container = Container::with_config(config);
    let range = DataRange::new(cli.offset, None).context("Invalid container offset")?;
    container
        .open_range(&cli.image, range, "r")
        .with_context(|| format!("Unable to open {}", cli.image.display()))?;

    let count = container.number_of_volumes()?;
    tracing::debug!("Opened {} with {} volumes", cli.image.display(), count);
    let indexes = match cli.volume {
        Some(0) => bail!("Volume indexes start at 1"),
        Some(number) if number > count => {
            bail!("Volume {} requested but the container has {}", number, count)
        }
        Some(number) => vec![number - 1],
        None if cli.entry_mode() && !cli.all_entries() => vec![0],
        None => (0..count).collect(),
    };

    if !cli.entry_mode() && !cli.json {
        print_container(&container)?;
    }

    let mut body_out = match &cli.bodyfile {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("Unable to create bodyfile {}", path.display()))?,
        )),
        None => None,
    };

    let indexes_len = indexes.len();
    for index in indexes {
        let mut volume = container.volume(index)?;
        if let Some(password) = &cli.password {
            volume.set_password(password.clone());
        }
        if let Some(password) = &cli.recovery_password {
            volume.set_recovery_password(password.clone());
        }
        volume
            .open()
            .with_context(|| format!("Unable to open volume {}", index + 1))?;

        if cli.entry_mode() {
            if volume.is_locked()? {
                bail!("Volume {} is locked, provide a password with -p or -r", index + 1);
            }
            print_entries(&cli, &volume)?;
        } else if cli.json {
            println!("{}", serde_json::to_string_pretty(&volume_report(&volume)?)?);
        } else {
            print_volume(&volume)?;
        }

        if let Some(out) = body_out.as_mut() {
            if volume.is_locked()? {
                tracing::warn!("Volume {} is locked, left out of the bodyfile", index + 1);
            } else {
                let prefix = if indexes_len > 1 { format!("/volume{}", index + 1) } else { String::new() };
                let written = bodyfile::write_volume(out, &volume, &prefix)?;
                tracing::debug!("Wrote {} bodyfile lines for volume {}", written, index + 1);
            }
        }
        volume.close()?;
    }

    if let Some(mut out) = body_out {
        out.flush().context("Unable to write bodyfile")?;
    }
    container.close()?;
    Ok(())
}

fn volume_report(volume: &Volume) -> Result<VolumeReport> {
    let snapshots = volume
        .snapshots()?
        .into_iter()
        .map(|s| SnapshotReport {
            name: s.name,
            xid: s.xid,
            creation_time: s.creation_time.map(|t| t.to_rfc3339()),
        })
        .collect();
    Ok(VolumeReport {
        index: volume.index() + 1,
        identifier: volume.identifier()?.to_string(),
        name: volume.name()?,
        role: volume.role()?,
        features: volume.features()?,
        formatted_by: volume.formatted_by()?,
        next_file_entry_identifier: volume.next_file_entry_identifier()?,
        locked: volume.is_locked()?,
        snapshots,
    })
}

fn print_container(container: &Container) -> Result<()> {
    println!("Apple File System (APFS) information:");
    println!();
    println!("Container information:");
    println!("\tIdentifier\t\t\t: {}", container.identifier()?);
    let size = container.size()?;
    println!("\tSize\t\t\t\t: {} ({} bytes)", format_size(size), size);
    println!("\tBlock size\t\t\t: {} bytes", container.block_size()?);
    println!("\tTransaction identifier\t\t: {}", container.xid()?);
    println!("\tNumber of volumes\t\t: {}", container.number_of_volumes()?);
    if container.is_locked()? {
        println!("\tIs locked");
    }
    println!();
    Ok(())
}

fn print_volume(volume: &Volume) -> Result<()> {
    println!("Volume: {} information:", volume.index() + 1);
    println!("\tIdentifier\t\t\t: {}", volume.identifier()?);
    println!("\tName\t\t\t\t: {}", volume.name()?);
    println!("\tRole\t\t\t\t: {:?}", volume.role()?);

    let formatted_by = volume.formatted_by()?;
    if !formatted_by.is_empty() {
        println!("\tFormatted by\t\t\t: {}", formatted_by);
    }
    if let Some(time) = volume.last_modification_time()? {
        println!("\tLast modification time\t\t: {}", time);
    }

    let features = volume.features()?;
    println!("\tCompatible features\t\t: 0x{:08x}", features.compatible);
    println!("\tIncompatible features\t\t: 0x{:08x}", features.incompatible);
    println!("\tRead-only compatible features\t: 0x{:08x}", features.readonly_compatible);
    println!(
        "\tCase sensitive\t\t\t: {}",
        if features.is_case_insensitive() { "no" } else { "yes" }
    );
    println!("\tNext file entry identifier\t: {}", volume.next_file_entry_identifier()?);

    if volume.is_locked()? {
        println!("\tIs locked");
        if let Some(hint) = volume.passphrase_hint()? {
            println!("\tPassword hint\t\t\t: {}", hint);
        }
    }

    let snapshots = volume.snapshots()?;
    println!("\tNumber of snapshots\t\t: {}", snapshots.len());
    for (index, snapshot) in snapshots.iter().enumerate() {
        print!("\tSnapshot: {}\t\t\t: {} (xid {})", index + 1, snapshot.name, snapshot.xid);
        match snapshot.creation_time {
            Some(time) => println!(" created {}", time),
            None => println!(),
        }
    }
    println!();
    Ok(())
}

fn print_entries(cli: &Cli, volume: &Volume) -> Result<()> {
    if let Some(path) = &cli.file_entry {
        let entry = volume
            .file_entry_by_path(path)
            .with_context(|| format!("Unable to find file entry {}", path))?;
        show_entry(cli, &entry, Some(path))?;
    }

    match cli.identifier {
        Some(EntrySelection::Identifier(identifier)) => {
            let entry = volume
                .file_entry_by_identifier(identifier)
                .with_context(|| format!("Unable to find file entry {}", identifier))?;
            show_entry(cli, &entry, None)?;
        }
        Some(EntrySelection::All) => {
            if !cli.json {
                println!("Volume: {} file entries:", volume.index() + 1);
            }
            // Identifiers are sparse; gaps have no inode
            for identifier in 0..volume.next_file_entry_identifier()? {
                match volume.file_entry_by_identifier(identifier) {
                    Ok(entry) => show_entry(cli, &entry, None)?,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e).with_context(|| format!("Unable to read file entry {}", identifier)),
                }
            }
        }
        None => {}
    }

    if cli.hierarchy {
        if !cli.json {
            println!("File system hierarchy:");
        }
        for item in volume.root_directory()?.walk() {
            let item = item?;
            if cli.json {
                println!("{}", serde_json::to_string(&entry_report(&item.entry, Some(&item.path))?)?);
            } else {
                println!("{}", item.path);
            }
        }
        if !cli.json {
            println!();
        }
    }
    Ok(())
}

fn show_entry(cli: &Cli, entry: &FileEntry, path: Option<&str>) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&entry_report(entry, path)?)?);
        Ok(())
    } else {
        print_file_entry(entry)
    }
}

fn entry_report(entry: &FileEntry, path: Option<&str>) -> Result<EntryReport> {
    Ok(EntryReport {
        path: path.map(str::to_string),
        info: entry.info()?,
        symlink_target: entry.symlink_target().unwrap_or_else(|e| {
            tracing::warn!("Symbolic link target of {}: {}", entry.identifier(), e);
            None
        }),
        extended_attributes: entry.extended_attribute_names()?,
    })
}

fn print_file_entry(entry: &FileEntry) -> Result<()> {
    println!("File entry:");
    println!("\tIdentifier\t\t\t: {}", entry.identifier());
    println!("\tName\t\t\t\t: {}", entry.name()?);
    println!("\tParent identifier\t\t: {}", entry.parent_identifier()?);
    println!("\tKind\t\t\t\t: {:?}", entry.kind()?);
    println!("\tSize\t\t\t\t: {}", entry.size()?);
    println!("\tMode\t\t\t\t: {:06o}", entry.mode()?);
    println!("\tOwner identifier\t\t: {}", entry.owner()?);
    println!("\tGroup identifier\t\t: {}", entry.group()?);

    let times = [
        ("Creation time\t\t\t", entry.creation_time()?),
        ("Modification time\t\t", entry.modification_time()?),
        ("Inode change time\t\t", entry.change_time()?),
        ("Access time\t\t\t", entry.access_time()?),
        ("Added time\t\t\t", entry.added_time()?),
    ];
    for (label, time) in times {
        if let Some(time) = time {
            println!("\t{}: {}", label, time);
        }
    }

    match entry.symlink_target() {
        Ok(Some(target)) => println!("\tSymbolic link target\t\t: {}", target),
        Ok(None) => {}
        Err(e) => tracing::warn!("Symbolic link target of {}: {}", entry.identifier(), e),
    }

    if entry.is_directory()? {
        println!("\tNumber of sub file entries\t: {}", entry.number_of_children()?);
    }

    let names = entry.extended_attribute_names()?;
    if !names.is_empty() {
        println!("\tExtended attributes:");
        for name in names {
            println!("\t\t{}", name);
        }
    }
    println!();
    Ok(())
}
