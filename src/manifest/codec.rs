//! Parse/emit the structured manifest document and its gzip envelope.
//! Anchor/alias-style deduplication is realized functionally rather than
//! through literal YAML `&`/`*`/`<<` syntax: the `hashes` map already
//! stores each digest exactly once, keyed by hex, and entries reference it
//! by that key; the `defaults` block factors common attributes and entries
//! simply omit fields equal to the default. See `DESIGN.md` for why this
//! crate does not rely on `serde_yaml`'s (unreliable) merge-key support to
//! express that same deduplication.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_yaml::{Mapping, Value};
use std::time::SystemTime;

use crate::digest::{Algorithm, Digest};
use crate::error::{Result, SnugError};
use crate::manifest::{ArchiveEntry, ArchiveManifest, CommonAttrs, Defaults, HashTableEntry, CURRENT_VERSION, FORMAT_TAG};

/// gzip magic bytes identifying the archive file envelope.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Stateless parse/emit pair for the manifest wire format.
pub struct ManifestCodec;

impl ManifestCodec {
    /// Unwraps the gzip envelope, parses the inner YAML document, and
    /// returns a fully-resolved `ArchiveManifest` (every default expanded).
    pub fn parse(bytes: &[u8]) -> Result<ArchiveManifest> {
        if bytes.len() < 2 || bytes[0..2] != GZIP_MAGIC {
            return Err(SnugError::InvalidFormat {
                reason: "missing gzip magic bytes".into(),
            });
        }

        let mut decoder = GzDecoder::new(bytes);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| SnugError::InvalidFormat { reason: format!("gzip envelope: {e}") })?;

        let document: Value =
            serde_yaml::from_str(&text).map_err(|e| SnugError::InvalidFormat { reason: e.to_string() })?;

        Self::from_document(document)
    }

    /// Produces the compressed wire form, factoring common attributes into
    /// `defaults` and emitting each digest exactly once in `hashes`.
    pub fn emit(manifest: &ArchiveManifest) -> Result<Vec<u8>> {
        let document = Self::to_document(manifest);
        let text = serde_yaml::to_string(&document).map_err(|e| SnugError::InvalidFormat { reason: e.to_string() })?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(text.as_bytes())
            .map_err(|e| SnugError::Io { operation: "manifest.emit", path: None, source: e })?;
        encoder
            .finish()
            .map_err(|e| SnugError::Io { operation: "manifest.emit", path: None, source: e })
    }

    fn from_document(document: Value) -> Result<ArchiveManifest> {
        let top = document.as_mapping().ok_or_else(|| SnugError::InvalidFormat {
            reason: "top-level document is not a mapping".into(),
        })?;

        let format = get_str(top, "format").unwrap_or_default();
        if format != FORMAT_TAG {
            return Err(SnugError::InvalidFormat {
                reason: format!("unexpected format tag: {format:?}"),
            });
        }

        let version = get_i64(top, "version").unwrap_or(1);
        if version > CURRENT_VERSION {
            return Err(SnugError::VersionUnsupported {
                found: version,
                supported: CURRENT_VERSION,
            });
        }

        let hash_algorithm = get_str(top, "hashAlgorithm")
            .and_then(|s| Algorithm::parse(&s))
            .ok_or_else(|| SnugError::InvalidFormat { reason: "missing or invalid hashAlgorithm".into() })?;

        let mut hashes = BTreeMap::new();
        if let Some(Value::Mapping(map)) = top.get("hashes") {
            for (key, value) in map {
                let hex = key.as_str().ok_or_else(|| SnugError::InvalidFormat { reason: "hashes key is not a string".into() })?;
                let entry_map = value.as_mapping().ok_or_else(|| SnugError::InvalidFormat { reason: format!("hashes[{hex}] is not a mapping") })?;
                let size = get_u64(entry_map, "size").ok_or_else(|| SnugError::InvalidFormat { reason: format!("hashes[{hex}] missing size") })?;
                let algorithm = get_str(entry_map, "algorithm")
                    .and_then(|s| Algorithm::parse(&s))
                    .unwrap_or(hash_algorithm);
                hashes.insert(hex.to_string(), HashTableEntry { size, algorithm });
            }
        }

        let defaults = top.get("defaults").and_then(|v| v.as_mapping()).map(|map| Defaults {
            owner: get_str(map, "owner"),
            group: get_str(map, "group"),
            file_perms: get_str(map, "filePerms").and_then(|s| parse_octal(&s)),
            dir_perms: get_str(map, "dirPerms").and_then(|s| parse_octal(&s)),
        });

        let mut entries = Vec::new();
        if let Some(Value::Sequence(seq)) = top.get("entries") {
            for item in seq {
                entries.push(Self::entry_from_value(item, &defaults, &hashes)?);
            }
        }

        let manifest = ArchiveManifest {
            version,
            hash_algorithm,
            hashes,
            defaults,
            entries,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    fn entry_from_value(
        value: &Value,
        defaults: &Option<Defaults>,
        hashes: &BTreeMap<String, HashTableEntry>,
    ) -> Result<ArchiveEntry> {
        let map = value.as_mapping().ok_or_else(|| SnugError::InvalidFormat { reason: "entry is not a mapping".into() })?;

        let entry_type = get_str(map, "type").ok_or_else(|| SnugError::InvalidFormat { reason: "entry missing `type`".into() })?;
        let path = get_str(map, "path").ok_or_else(|| SnugError::InvalidFormat { reason: "entry missing `path`".into() })?;

        let is_dir = entry_type == "directory";
        let default_perms = defaults.as_ref().and_then(|d| if is_dir { d.dir_perms } else { d.file_perms });

        let attrs = CommonAttrs {
            permissions: get_str(map, "permissions").and_then(|s| parse_octal(&s)).or(default_perms),
            owner: get_str(map, "owner").or_else(|| defaults.as_ref().and_then(|d| d.owner.clone())),
            group: get_str(map, "group").or_else(|| defaults.as_ref().and_then(|d| d.group.clone())),
            modified: get_str(map, "modified").and_then(|s| parse_rfc3339(&s)),
            created: get_str(map, "created").and_then(|s| parse_rfc3339(&s)),
            extra: collect_extra(map, KNOWN_ENTRY_KEYS),
        };

        match entry_type.as_str() {
            "file" => {
                let hex = get_str(map, "hash").ok_or_else(|| SnugError::InvalidFormat { reason: format!("file entry {path} missing `hash`") })?;
                let hash_entry = hashes.get(&hex).ok_or_else(|| SnugError::MissingHashReference { path: path.clone(), digest: hex.clone() })?;
                let digest = Digest::from_hex(hash_entry.algorithm, &hex)?;
                Ok(ArchiveEntry::File {
                    path,
                    size: hash_entry.size,
                    digest,
                    attrs,
                })
            }
            "directory" => Ok(ArchiveEntry::Directory { path, attrs }),
            "symlink" => {
                let target = get_str(map, "target").ok_or_else(|| SnugError::InvalidFormat { reason: format!("symlink entry {path} missing `target`") })?;
                Ok(ArchiveEntry::Symlink { path, symlink_target: target, attrs })
            }
            other => Err(SnugError::InvalidFormat { reason: format!("unknown entry type: {other}") }),
        }
    }

    fn to_document(manifest: &ArchiveManifest) -> Value {
        let mut top = Mapping::new();
        top.insert(Value::from("format"), Value::from(FORMAT_TAG));
        top.insert(Value::from("version"), Value::from(manifest.version));
        top.insert(Value::from("hashAlgorithm"), Value::from(manifest.hash_algorithm.as_str()));

        let mut hashes_map = Mapping::new();
        for (hex, entry) in &manifest.hashes {
            let mut entry_map = Mapping::new();
            entry_map.insert(Value::from("hash"), Value::from(hex.as_str()));
            entry_map.insert(Value::from("size"), Value::from(entry.size));
            entry_map.insert(Value::from("algorithm"), Value::from(entry.algorithm.as_str()));
            hashes_map.insert(Value::from(hex.as_str()), Value::Mapping(entry_map));
        }
        top.insert(Value::from("hashes"), Value::Mapping(hashes_map));

        let defaults = manifest.defaults.clone().unwrap_or_else(|| infer_defaults(&manifest.entries));
        if defaults != Defaults::default() {
            let mut defaults_map = Mapping::new();
            if let Some(owner) = &defaults.owner {
                defaults_map.insert(Value::from("owner"), Value::from(owner.as_str()));
            }
            if let Some(group) = &defaults.group {
                defaults_map.insert(Value::from("group"), Value::from(group.as_str()));
            }
            if let Some(perms) = defaults.file_perms {
                defaults_map.insert(Value::from("filePerms"), Value::from(format_octal(perms)));
            }
            if let Some(perms) = defaults.dir_perms {
                defaults_map.insert(Value::from("dirPerms"), Value::from(format_octal(perms)));
            }
            top.insert(Value::from("defaults"), Value::Mapping(defaults_map));
        }

        let entries = manifest
            .entries
            .iter()
            .map(|entry| entry_to_value(entry, &defaults))
            .collect();
        top.insert(Value::from("entries"), Value::Sequence(entries));

        Value::Mapping(top)
    }
}

/// Fields this codec understands at the entry level; anything else in a
/// parsed document's entry mapping is carried through verbatim via
/// `CommonAttrs::extra`.
const KNOWN_ENTRY_KEYS: &[&str] = &["type", "path", "hash", "target", "permissions", "owner", "group", "modified", "created"];

fn collect_extra(map: &Mapping, known: &[&str]) -> BTreeMap<String, Value> {
    map.iter()
        .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .collect()
}

fn entry_to_value(entry: &ArchiveEntry, defaults: &Defaults) -> Value {
    let mut map = Mapping::new();
    let is_dir = matches!(entry, ArchiveEntry::Directory { .. });
    let default_perms = if is_dir { defaults.dir_perms } else { defaults.file_perms };

    match entry {
        ArchiveEntry::File { path, digest, attrs, .. } => {
            map.insert(Value::from("type"), Value::from("file"));
            map.insert(Value::from("path"), Value::from(path.as_str()));
            map.insert(Value::from("hash"), Value::from(digest.to_hex()));
            insert_common(&mut map, attrs, &defaults.owner, &defaults.group, default_perms);
        }
        ArchiveEntry::Directory { path, attrs } => {
            map.insert(Value::from("type"), Value::from("directory"));
            map.insert(Value::from("path"), Value::from(path.as_str()));
            insert_common(&mut map, attrs, &defaults.owner, &defaults.group, default_perms);
        }
        ArchiveEntry::Symlink { path, symlink_target, attrs } => {
            map.insert(Value::from("type"), Value::from("symlink"));
            map.insert(Value::from("path"), Value::from(path.as_str()));
            map.insert(Value::from("target"), Value::from(symlink_target.as_str()));
            insert_common(&mut map, attrs, &defaults.owner, &defaults.group, default_perms);
        }
    }

    for (key, value) in &entry.attrs().extra {
        map.insert(Value::from(key.as_str()), value.clone());
    }

    Value::Mapping(map)
}

fn insert_common(
    map: &mut Mapping,
    attrs: &CommonAttrs,
    default_owner: &Option<String>,
    default_group: &Option<String>,
    default_perms: Option<u32>,
) {
    if attrs.permissions.is_some() && attrs.permissions != default_perms {
        map.insert(Value::from("permissions"), Value::from(format_octal(attrs.permissions.unwrap())));
    }
    if attrs.owner.is_some() && attrs.owner != *default_owner {
        map.insert(Value::from("owner"), Value::from(attrs.owner.clone().unwrap()));
    }
    if attrs.group.is_some() && attrs.group != *default_group {
        map.insert(Value::from("group"), Value::from(attrs.group.clone().unwrap()));
    }
    if let Some(modified) = attrs.modified {
        map.insert(Value::from("modified"), Value::from(format_rfc3339(modified)));
    }
    if let Some(created) = attrs.created {
        map.insert(Value::from("created"), Value::from(format_rfc3339(created)));
    }
}

/// Picks the most common owner/group/permission values across all entries
/// so they can be factored into `defaults` instead of repeated on every
/// entry.
fn infer_defaults(entries: &[ArchiveEntry]) -> Defaults {
    fn most_common<T: Clone + Eq + std::hash::Hash>(values: impl Iterator<Item = T>) -> Option<T> {
        let mut counts: BTreeMap<u64, (T, usize)> = BTreeMap::new();
        for value in values {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::hash::Hash::hash(&value, &mut hasher);
            let key = std::hash::Hasher::finish(&hasher);
            let slot = counts.entry(key).or_insert_with(|| (value.clone(), 0));
            slot.1 += 1;
        }
        counts.into_values().max_by_key(|(_, count)| *count).map(|(v, _)| v)
    }

    let owner = most_common(entries.iter().filter_map(|e| e.attrs().owner.clone()));
    let group = most_common(entries.iter().filter_map(|e| e.attrs().group.clone()));
    let file_perms = most_common(entries.iter().filter_map(|e| match e {
        ArchiveEntry::File { attrs, .. } | ArchiveEntry::Symlink { attrs, .. } => attrs.permissions,
        ArchiveEntry::Directory { .. } => None,
    }));
    let dir_perms = most_common(entries.iter().filter_map(|e| match e {
        ArchiveEntry::Directory { attrs, .. } => attrs.permissions,
        _ => None,
    }));

    Defaults { owner, group, file_perms, dir_perms }
}

fn get_str(map: &Mapping, key: &str) -> Option<String> {
    map.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn get_i64(map: &Mapping, key: &str) -> Option<i64> {
    map.get(key).and_then(|v| v.as_i64())
}

fn get_u64(map: &Mapping, key: &str) -> Option<u64> {
    map.get(key).and_then(|v| v.as_u64())
}

fn parse_octal(s: &str) -> Option<u32> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).ok()
}

fn format_octal(mode: u32) -> String {
    format!("{mode:04o}")
}

fn format_rfc3339(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_rfc3339(s: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Hasher;
    use std::time::Duration;

    fn sample_manifest() -> ArchiveManifest {
        let mut manifest = ArchiveManifest::new(Algorithm::Sha256);
        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"hello");
        manifest.register_hash(&digest, 5);

        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        manifest.entries.push(ArchiveEntry::Directory {
            path: "dir".into(),
            attrs: CommonAttrs {
                permissions: Some(0o755),
                owner: Some("root".into()),
                group: Some("root".into()),
                modified: Some(now),
                created: Some(now),
                extra: BTreeMap::new(),
            },
        });
        manifest.entries.push(ArchiveEntry::File {
            path: "dir/a.txt".into(),
            digest: digest.clone(),
            size: 5,
            attrs: CommonAttrs {
                permissions: Some(0o644),
                owner: Some("root".into()),
                group: Some("root".into()),
                modified: Some(now),
                created: Some(now),
                extra: BTreeMap::new(),
            },
        });
        manifest.entries.push(ArchiveEntry::Symlink {
            path: "dir/link".into(),
            symlink_target: "a.txt".into(),
            attrs: CommonAttrs {
                permissions: Some(0o644),
                owner: Some("root".into()),
                group: Some("root".into()),
                modified: Some(now),
                created: Some(now),
                extra: BTreeMap::new(),
            },
        });

        manifest
    }

    #[test]
    fn emitted_bytes_start_with_gzip_magic() {
        let manifest = sample_manifest();
        let bytes = ManifestCodec::emit(&manifest).unwrap();
        assert_eq!(&bytes[0..2], &GZIP_MAGIC);
    }

    #[test]
    fn round_trip_preserves_entries_and_hashes() {
        let manifest = sample_manifest();
        let bytes = ManifestCodec::emit(&manifest).unwrap();
        let parsed = ManifestCodec::parse(&bytes).unwrap();

        assert_eq!(parsed.entries.len(), manifest.entries.len());
        assert_eq!(parsed.hashes, manifest.hashes);
        assert_eq!(parsed.entries, manifest.entries);
    }

    #[test]
    fn parse_rejects_missing_gzip_magic() {
        let err = ManifestCodec::parse(b"not gzip").unwrap_err();
        assert!(matches!(err, SnugError::InvalidFormat { .. }));
    }

    #[test]
    fn parse_rejects_dangling_hash_reference() {
        let mut manifest = ArchiveManifest::new(Algorithm::Sha256);
        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"hello");
        // Deliberately do not register the hash.
        manifest.entries.push(ArchiveEntry::File {
            path: "a.txt".into(),
            digest,
            size: 5,
            attrs: CommonAttrs::default(),
        });

        let document = ManifestCodec::to_document(&manifest);
        let text = serde_yaml::to_string(&document).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        let bytes = encoder.finish().unwrap();

        let err = ManifestCodec::parse(&bytes).unwrap_err();
        assert!(matches!(err, SnugError::MissingHashReference { .. }));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let mut manifest = sample_manifest();
        if let ArchiveEntry::File { attrs, .. } = &mut manifest.entries[1] {
            attrs.extra.insert("contentType".to_string(), Value::from("text/plain"));
        }

        let bytes = ManifestCodec::emit(&manifest).unwrap();
        let parsed = ManifestCodec::parse(&bytes).unwrap();

        let ArchiveEntry::File { attrs, .. } = &parsed.entries[1] else {
            panic!("expected file entry");
        };
        assert_eq!(attrs.extra.get("contentType"), Some(&Value::from("text/plain")));
    }
}
