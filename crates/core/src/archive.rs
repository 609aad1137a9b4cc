//! Archive engine
//!
//! Groups archive files into multi-part sets by naming convention, decides
//! the canonical first-part member the extractor must be pointed at,
//! validates listed entry paths before any extraction, and detects nested
//! archives that appear after an extraction round.

use crate::invariants::lexical_normalize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use unpackr_config::{normalized_extension, Config};

/// Naming family of an archive set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFamily {
    /// Multi-volume RAR: `base.part01.rar`/`base.part02.rar` or the old
    /// style `base.rar`/`base.r00`/`base.r01`.
    RarVolumes,
    /// Split 7z: `base.7z.001`, `base.7z.002`, ...
    SevenZipSplit,
    /// A standalone archive file.
    Single,
}

/// A group of archive files meant to be extracted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSet {
    pub family: ArchiveFamily,
    /// The member the extractor is pointed at; it pulls in the rest.
    pub first_part: PathBuf,
    /// All member paths, ordered by part number.
    pub members: Vec<PathBuf>,
    pub total_bytes: u64,
    /// False when part numbers have a gap. Incomplete sets are never
    /// passed to the extractor.
    pub complete: bool,
}

/// How one file name participates in a set.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MemberShape {
    /// `base.partNN.rar`
    RarPart { base: String, part: u32 },
    /// `base.rar` — first volume of the old style, or a standalone RAR.
    RarFirst { base: String },
    /// `base.rNN`
    RarVolume { base: String, index: u32 },
    /// `base.<archive-ext>.NNN`
    SplitPart { base: String, part: u32 },
    /// `.zip`, `.7z`, ... without a volume suffix.
    Single,
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn shape_of(name: &str, config: &Config) -> Option<MemberShape> {
    let lower = name.to_lowercase();

    if let Some(stem) = lower.strip_suffix(".rar") {
        if let Some(idx) = stem.rfind(".part") {
            if let Some(part) = parse_digits(&stem[idx + 5..]) {
                return Some(MemberShape::RarPart {
                    base: stem[..idx].to_string(),
                    part,
                });
            }
        }
        return Some(MemberShape::RarFirst {
            base: stem.to_string(),
        });
    }

    // Old-style numbered volumes: base.r00, base.r01, ...
    if let Some(idx) = lower.rfind('.') {
        let ext = &lower[idx + 1..];
        if ext.len() >= 3 && ext.starts_with('r') {
            if let Some(index) = parse_digits(&ext[1..]) {
                return Some(MemberShape::RarVolume {
                    base: lower[..idx].to_string(),
                    index,
                });
            }
        }

        // Split archives: base.7z.001 — numeric suffix after an archive
        // extension.
        if let Some(part) = parse_digits(ext) {
            let stem = &lower[..idx];
            if let Some(stem_ext) = normalized_extension(Path::new(stem)) {
                if config.archive_extensions.contains(&stem_ext) {
                    return Some(MemberShape::SplitPart {
                        base: stem.to_string(),
                        part,
                    });
                }
            }
            return None;
        }

        if config.archive_extensions.contains(&format!(".{}", ext)) {
            return Some(MemberShape::Single);
        }
    }

    None
}

/// Whether a path is an archive file, including multi-part volume names
/// that the plain extension sets do not cover.
pub fn is_archive_file(path: &Path, config: &Config) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| shape_of(n, config))
        .is_some()
}

/// Whether a path is a parity recovery file.
pub fn is_parity_file(path: &Path) -> bool {
    normalized_extension(path).as_deref() == Some(".par2")
}

#[derive(Debug)]
struct SetBuilder {
    /// (part number, path, bytes)
    members: Vec<(u32, PathBuf, u64)>,
    new_style: bool,
}

/// Group archive files in one folder into sets.
///
/// Input files are (path, size) pairs; paths in different directories never
/// join the same set. The returned sets are ordered by first-part path.
pub fn group_archive_sets(files: &[(PathBuf, u64)], config: &Config) -> Vec<ArchiveSet> {
    let mut rar_groups: BTreeMap<(PathBuf, String), SetBuilder> = BTreeMap::new();
    let mut split_groups: BTreeMap<(PathBuf, String), SetBuilder> = BTreeMap::new();
    let mut singles: Vec<ArchiveSet> = Vec::new();

    for (path, bytes) in files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

        match shape_of(name, config) {
            Some(MemberShape::RarPart { base, part }) => {
                let entry = rar_groups.entry((dir, base)).or_insert(SetBuilder {
                    members: Vec::new(),
                    new_style: false,
                });
                entry.new_style = true;
                entry.members.push((part, path.clone(), *bytes));
            }
            Some(MemberShape::RarFirst { base }) => {
                rar_groups
                    .entry((dir, base))
                    .or_insert(SetBuilder {
                        members: Vec::new(),
                        new_style: false,
                    })
                    .members
                    .push((0, path.clone(), *bytes));
            }
            Some(MemberShape::RarVolume { base, index }) => {
                // .r00 follows the plain .rar, so it becomes part 1.
                rar_groups
                    .entry((dir, base))
                    .or_insert(SetBuilder {
                        members: Vec::new(),
                        new_style: false,
                    })
                    .members
                    .push((index + 1, path.clone(), *bytes));
            }
            Some(MemberShape::SplitPart { base, part }) => {
                split_groups
                    .entry((dir, base))
                    .or_insert(SetBuilder {
                        members: Vec::new(),
                        new_style: true,
                    })
                    .members
                    .push((part, path.clone(), *bytes));
            }
            Some(MemberShape::Single) => {
                singles.push(ArchiveSet {
                    family: ArchiveFamily::Single,
                    first_part: path.clone(),
                    members: vec![path.clone()],
                    total_bytes: *bytes,
                    complete: true,
                });
            }
            None => {}
        }
    }

    let mut sets = singles;

    for (_, builder) in rar_groups {
        sets.push(finish_set(builder, ArchiveFamily::RarVolumes));
    }
    for (_, builder) in split_groups {
        sets.push(finish_set(builder, ArchiveFamily::SevenZipSplit));
    }

    sets.sort_by(|a, b| a.first_part.cmp(&b.first_part));
    sets
}

fn finish_set(mut builder: SetBuilder, family: ArchiveFamily) -> ArchiveSet {
    builder.members.sort();

    let parts: Vec<u32> = builder.members.iter().map(|(p, _, _)| *p).collect();
    let expected_start = match family {
        // New-style rar and split 7z count from 1; old-style rar needs the
        // plain .rar (part 0) present.
        ArchiveFamily::RarVolumes if builder.new_style => 1,
        ArchiveFamily::RarVolumes => 0,
        _ => 1,
    };
    let complete = !parts.is_empty()
        && parts[0] == expected_start
        && parts.windows(2).all(|w| w[1] == w[0] + 1);

    let total_bytes = builder.members.iter().map(|(_, _, b)| *b).sum();
    let members: Vec<PathBuf> = builder.members.iter().map(|(_, p, _)| p.clone()).collect();
    let first_part = members[0].clone();

    let family = if members.len() == 1 {
        ArchiveFamily::Single
    } else {
        family
    };

    ArchiveSet {
        family,
        first_part,
        members,
        total_bytes,
        complete,
    }
}

/// One entry parsed from an archive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub raw: String,
    pub is_symlink: bool,
}

/// Parse a list-mode output: one entry path per line. A line of the form
/// `path -> target` denotes a symbolic link entry.
pub fn parse_listing(output: &str) -> Vec<ArchiveEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(" -> ") {
            Some((path, _target)) => ArchiveEntry {
                raw: path.trim().to_string(),
                is_symlink: true,
            },
            None => ArchiveEntry {
                raw: line.to_string(),
                is_symlink: false,
            },
        })
        .collect()
}

/// Why an archive entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryViolation {
    AbsolutePath,
    ParentTraversal,
    Symlink,
    NulByte,
    EscapesRoot,
}

impl std::fmt::Display for EntryViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryViolation::AbsolutePath => "absolute path",
            EntryViolation::ParentTraversal => "parent traversal",
            EntryViolation::Symlink => "symlink entry",
            EntryViolation::NulByte => "embedded NUL byte",
            EntryViolation::EscapesRoot => "escapes extraction root",
        };
        f.write_str(s)
    }
}

/// Validate one listed entry against the intended extraction root.
///
/// Returns the normalized on-disk path the entry would extract to.
pub fn validate_entry(entry: &ArchiveEntry, root: &Path) -> Result<PathBuf, EntryViolation> {
    if entry.raw.contains('\0') {
        return Err(EntryViolation::NulByte);
    }
    if entry.is_symlink {
        return Err(EntryViolation::Symlink);
    }

    let raw_path = Path::new(&entry.raw);
    let windows_drive = entry.raw.len() >= 2
        && entry.raw.as_bytes()[1] == b':'
        && entry.raw.as_bytes()[0].is_ascii_alphabetic();
    if raw_path.is_absolute()
        || entry.raw.starts_with('/')
        || entry.raw.starts_with('\\')
        || windows_drive
    {
        return Err(EntryViolation::AbsolutePath);
    }

    let has_parent_segment = entry
        .raw
        .split(['/', '\\'])
        .any(|segment| segment == "..");
    if has_parent_segment {
        return Err(EntryViolation::ParentTraversal);
    }

    let resolved = lexical_normalize(&root.join(raw_path));
    if !resolved.starts_with(root) {
        return Err(EntryViolation::EscapesRoot);
    }

    Ok(resolved)
}

/// Refusal of a whole listing, naming the offending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRefusal {
    pub entry: String,
    pub violation: EntryViolation,
}

/// Validate every entry of a listing; the first violation refuses the set.
pub fn validate_listing(entries: &[ArchiveEntry], root: &Path) -> Result<(), ListingRefusal> {
    for entry in entries {
        if let Err(violation) = validate_entry(entry, root) {
            return Err(ListingRefusal {
                entry: entry.raw.clone(),
                violation,
            });
        }
    }
    Ok(())
}

/// Free space that must be available before extracting a set.
pub fn required_extraction_space(set_total_bytes: u64) -> u64 {
    set_total_bytes.saturating_mul(3)
}

/// Available bytes on the volume holding `path`, from the mounted-disk
/// list. `None` when the volume cannot be determined.
pub fn available_space(path: &Path) -> Option<u64> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
