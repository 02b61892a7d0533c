/// Archive codec
///
/// A snapshot is one gzip tar: `<stem>/manifest.json` plus one
/// `<stem>/<volume>.tar` per volume. Restores also accept plain tars, nested
/// `.tar.gz` members and a flat single-volume archive.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::utils::{
    archive_file_name, archive_timestamp, is_safety_copy, strip_archive_extension, volume_name,
    volume_short_name, MANIFEST_FILE,
};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive not found: {0}")]
    NotFound(PathBuf),

    #[error("archive {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("archive content invalid: {0}")]
    ContentInvalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub volume: String,
    pub short_name: String,
    pub file: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub tool_version: String,
    pub volumes: Vec<ManifestEntry>,
}

/// A finished, verified archive on disk
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub manifest: SnapshotManifest,
    pub verified: bool,
}

/// One per-volume archive found inside an extracted bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMember {
    pub path: PathBuf,
    pub volume: String,
}

/// A tar entry as listed during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberListing {
    pub path: String,
    pub size: u64,
}

/// Bundle the staged per-volume tars into `<archive_dir>/<stem>.tar.gz`.
///
/// The bundle is written beside its final name, verified, then renamed so a
/// partial archive never carries a final name.
pub fn build_bundle(
    staging: &Path,
    archive_dir: &Path,
    stem: &str,
    manifest: &SnapshotManifest,
) -> Result<ArchiveInfo, ArchiveError> {
    fs::create_dir_all(archive_dir)?;
    let final_path = archive_dir.join(archive_file_name(stem));
    let partial_path = archive_dir.join(format!("{}.partial", archive_file_name(stem)));

    let result = write_bundle(staging, &partial_path, stem, manifest)
        .and_then(|_| verify_bundle(&partial_path, stem, manifest));
    if let Err(e) = result {
        let _ = fs::remove_file(&partial_path);
        return Err(e);
    }

    fs::rename(&partial_path, &final_path)?;
    let size_bytes = fs::metadata(&final_path)?.len();

    Ok(ArchiveInfo {
        path: final_path,
        size_bytes,
        manifest: manifest.clone(),
        verified: true,
    })
}

fn write_bundle(
    staging: &Path,
    target: &Path,
    stem: &str,
    manifest: &SnapshotManifest,
) -> Result<(), ArchiveError> {
    let file = File::create(target)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(manifest.created_at.timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, format!("{}/{}", stem, MANIFEST_FILE), manifest_bytes.as_slice())?;

    for entry in &manifest.volumes {
        builder.append_path_with_name(staging.join(&entry.file), format!("{}/{}", stem, entry.file))?;
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

/// Integrity check: the bundle lists cleanly and holds every expected member
fn verify_bundle(path: &Path, stem: &str, manifest: &SnapshotManifest) -> Result<(), ArchiveError> {
    let listing = list_members(path)?;
    let corrupt = |reason: String| ArchiveError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let manifest_name = format!("{}/{}", stem, MANIFEST_FILE);
    if !listing.iter().any(|m| m.path == manifest_name) {
        return Err(corrupt(format!("{} missing", manifest_name)));
    }

    for entry in &manifest.volumes {
        let name = format!("{}/{}", stem, entry.file);
        match listing.iter().find(|m| m.path == name) {
            Some(member) if member.size == entry.size_bytes => {}
            Some(member) => {
                return Err(corrupt(format!(
                    "{} is {} bytes, expected {}",
                    name, member.size, entry.size_bytes
                )))
            }
            None => return Err(corrupt(format!("{} missing", name))),
        }
    }
    Ok(())
}

fn open_tar(path: &Path) -> Result<tar::Archive<Box<dyn Read>>, ArchiveError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    drop(file);

    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = if read == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

/// List every entry of a (gzip) tar, reading it to the end
pub fn list_members(path: &Path) -> Result<Vec<MemberListing>, ArchiveError> {
    let corrupt = |reason: String| ArchiveError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut archive = open_tar(path)?;
    let mut members = Vec::new();
    {
        let entries = archive.entries().map_err(|e| corrupt(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| corrupt(e.to_string()))?;
            let member_path = entry.path().map_err(|e| corrupt(e.to_string()))?;
            members.push(MemberListing {
                path: member_path.to_string_lossy().trim_start_matches("./").to_string(),
                size: entry.size(),
            });
        }
    }

    // Drain the trailer so the gzip checksum gets verified too
    io::copy(&mut archive.into_inner(), &mut io::sink()).map_err(|e| corrupt(e.to_string()))?;

    if members.is_empty() {
        return Err(corrupt("no entries".to_string()));
    }
    Ok(members)
}

/// Check that `path` exists and is a well-formed tar container
pub fn validate_archive(path: &Path) -> Result<Vec<MemberListing>, ArchiveError> {
    if !path.exists() {
        return Err(ArchiveError::NotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(ArchiveError::Corrupt {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }
    list_members(path)
}

/// Unpack an archive into `dest`; entries escaping `dest` are skipped by tar
pub fn unpack(path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(dest)?;
    let mut archive = open_tar(path)?;
    archive.unpack(dest).map_err(|e| ArchiveError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Find the per-volume archives inside an extracted bundle and name their target volumes.
///
/// With a manifest the short names it records are re-prefixed with the current
/// project. Without one, a member stem already carrying the project prefix is
/// used as-is and anything else gets the prefix added. An archive holding no
/// per-volume members but named after a project volume is a flat
/// single-volume archive of that volume.
pub fn locate_members(
    scratch: &Path,
    project: &str,
    archive_path: &Path,
) -> Result<(Option<SnapshotManifest>, Vec<VolumeMember>), ArchiveError> {
    let mut manifest = None;
    let mut files = Vec::new();

    for entry in WalkDir::new(scratch).min_depth(1).max_depth(2).sort_by_file_name() {
        let entry = entry.map_err(|e| ArchiveError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == MANIFEST_FILE {
            let contents = fs::read(entry.path())?;
            manifest = Some(serde_json::from_slice::<SnapshotManifest>(&contents)?);
        } else if is_volume_archive_name(&name) {
            files.push((name, entry.path().to_path_buf()));
        }
    }

    let mut members: Vec<VolumeMember> = files
        .into_iter()
        .map(|(name, path)| {
            let recorded = manifest
                .as_ref()
                .and_then(|m| m.volumes.iter().find(|v| v.file == name));
            let volume = match recorded {
                Some(entry) => volume_name(project, &entry.short_name),
                None => target_volume(project, strip_archive_extension(&name)),
            };
            VolumeMember { path, volume }
        })
        .filter(|m| !is_safety_copy(&m.volume))
        .collect();

    if members.is_empty() {
        let file_name = archive_path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = strip_archive_extension(&file_name);
        if manifest.is_none() && volume_short_name(project, stem).is_some() {
            members.push(VolumeMember {
                path: archive_path.to_path_buf(),
                volume: stem.to_string(),
            });
        }
    }

    if members.is_empty() {
        return Err(ArchiveError::ContentInvalid(format!(
            "{} contains no per-volume archives",
            archive_path.display()
        )));
    }

    members.sort_by(|a, b| a.volume.cmp(&b.volume));
    members.dedup_by(|a, b| a.volume == b.volume);
    Ok((manifest, members))
}

fn is_volume_archive_name(name: &str) -> bool {
    (name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz"))
        && !strip_archive_extension(name).is_empty()
}

fn target_volume(project: &str, stem: &str) -> String {
    if volume_short_name(project, stem).is_some() {
        stem.to_string()
    } else {
        volume_name(project, stem)
    }
}

/// Archives in the archive directory, oldest first
pub fn list_archives(archive_dir: &Path) -> Result<Vec<(PathBuf, u64)>, ArchiveError> {
    if !archive_dir.exists() {
        return Ok(Vec::new());
    }

    let mut archives = Vec::new();
    for entry in fs::read_dir(archive_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_file() && name.ends_with(".tar.gz") {
            archives.push((entry.path(), entry.metadata()?.len()));
        }
    }
    // Undated archives first, then by embedded date-time
    archives.sort_by_cached_key(|(path, _)| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        (archive_timestamp(&name), name)
    });
    Ok(archives)
}
