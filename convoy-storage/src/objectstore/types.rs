//! Object-store records and backup URL encoding.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StorageError};
use crate::util::check_uuid;

/// Query parameter carrying the backup (snapshot) UUID.
pub const BACKUP_QUERY_KEY: &str = "backup";
/// Query parameter carrying the source volume UUID.
pub const VOLUME_QUERY_KEY: &str = "volume";

/// Source volume as recorded at the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVolume {
    pub uuid: String,
    pub name: String,
    /// Driver that produced the backups of this volume.
    pub driver: String,
    #[serde(default)]
    pub file_system: String,
    #[serde(default)]
    pub size: u64,
    pub created_time: String,
    /// Most recent backup written for this volume.
    #[serde(default)]
    pub last_backup: Option<String>,
}

/// Source snapshot description passed in by drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub uuid: String,
    pub name: String,
    pub created_time: String,
}

/// Blob reference inside a [`Backup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Object path relative to the destination base.
    pub path: String,
    /// Hex SHA-256 of the uncompressed content.
    pub checksum: String,
    /// Size of the uncompressed content in bytes.
    pub size: u64,
}

/// One backup of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub uuid: String,
    pub volume_uuid: String,
    pub snapshot_uuid: String,
    #[serde(default)]
    pub snapshot_name: String,
    pub snapshot_created_time: String,
    pub created_time: String,
    pub file: BackupFile,
}

/// Parsed form of a backup URL.
///
/// `vfs:///var/backups/?backup=<snapshot-uuid>&volume=<volume-uuid>`
/// decodes to the destination `vfs:///var/backups/` plus both UUIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    /// Destination without query or fragment.
    pub dest: Url,
    pub backup_uuid: String,
    pub volume_uuid: String,
}

impl BackupTarget {
    /// Decode a backup URL.
    pub fn parse(backup_url: &str) -> Result<Self> {
        let mut url = parse_url(backup_url)?;

        let mut backup_uuid = None;
        let mut volume_uuid = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                BACKUP_QUERY_KEY => backup_uuid = Some(value.into_owned()),
                VOLUME_QUERY_KEY => volume_uuid = Some(value.into_owned()),
                _ => {}
            }
        }

        let backup_uuid = backup_uuid.ok_or_else(|| {
            StorageError::InvalidArgument(format!("missing {} in backup URL {}", BACKUP_QUERY_KEY, backup_url))
        })?;
        let volume_uuid = volume_uuid.ok_or_else(|| {
            StorageError::InvalidArgument(format!("missing {} in backup URL {}", VOLUME_QUERY_KEY, backup_url))
        })?;
        check_uuid(&backup_uuid)?;
        check_uuid(&volume_uuid)?;

        url.set_query(None);
        url.set_fragment(None);
        Ok(Self {
            dest: url,
            backup_uuid,
            volume_uuid,
        })
    }

    /// Encode back into a backup URL.
    pub fn to_url_string(&self) -> String {
        encode_backup_url(&self.dest, &self.backup_uuid, &self.volume_uuid)
    }
}

/// Build the backup URL for `backup_uuid` of `volume_uuid` under `dest`.
pub fn encode_backup_url(dest: &Url, backup_uuid: &str, volume_uuid: &str) -> String {
    let mut url = dest.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair(BACKUP_QUERY_KEY, backup_uuid)
        .append_pair(VOLUME_QUERY_KEY, volume_uuid);
    url.to_string()
}

/// Parse a destination or backup URL, undoing JSON-style `\u0026` escaping.
pub fn parse_url(raw: &str) -> Result<Url> {
    let raw = unescape_url(raw);
    Url::parse(&raw).map_err(|e| StorageError::InvalidArgument(format!("invalid URL {:?}: {}", raw, e)))
}

/// Escape `&` so a URL survives as a bare string response.
pub fn escape_url(url: &str) -> String {
    url.replace('&', "\\u0026")
}

/// Reverse of [`escape_url`].
pub fn unescape_url(url: &str) -> String {
    url.replace("\\u0026", "&")
}
