//! # Defragmentation File Layout
//!
//! Every file name the engine produces, the skip checks that make a rerun
//! idempotent, and the crash-safe rename protocol.
//!
//! ## Files per cache-group work directory
//!
//! ```text
//! part-N.bin               live partition N
//! part-dfrg-N.bin.tmp      defragmented partition being built
//! part-dfrg-N.bin          defragmented partition after rename
//! part-map-N.bin           link map of partition N
//! index.bin                live index
//! index-dfrg.bin.tmp       defragmented index being built
//! index-dfrg.bin           defragmented index after rename
//! defrg-completion.marker  group commit point (zero-byte)
//! ```
//!
//! ## Crash Protocol
//!
//! Renames go through `fs::rename` (atomic on the same filesystem)
//! followed by a directory fsync. The completion marker appears last and
//! exactly once per group; a crash before it leaves `.tmp` files that the
//! next run deletes or finishes, a crash after it is completed by the
//! group skip check running the batch rename again. Every step of the
//! batch rename is idempotent.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::Result;

use crate::error::DefragmentationError;
use crate::storage::{GroupId, PartitionId};

pub const PART_FILE_PREFIX: &str = "part-";
pub const DFRG_PART_FILE_PREFIX: &str = "part-dfrg-";
pub const DFRG_PART_MAPPING_FILE_PREFIX: &str = "part-map-";
pub const FILE_SUFFIX: &str = ".bin";
pub const TMP_SUFFIX: &str = ".tmp";
pub const INDEX_FILE_NAME: &str = "index.bin";
pub const DFRG_INDEX_FILE_NAME: &str = "index-dfrg.bin";
pub const DFRG_INDEX_TMP_FILE_NAME: &str = "index-dfrg.bin.tmp";
pub const DFRG_COMPLETION_MARKER_FILE_NAME: &str = "defrg-completion.marker";

pub fn part_file(work_dir: &Path, part: PartitionId) -> PathBuf {
    work_dir.join(format!("{PART_FILE_PREFIX}{part}{FILE_SUFFIX}"))
}

pub fn defragmented_part_file(work_dir: &Path, part: PartitionId) -> PathBuf {
    work_dir.join(format!("{DFRG_PART_FILE_PREFIX}{part}{FILE_SUFFIX}"))
}

pub fn defragmented_part_tmp_file(work_dir: &Path, part: PartitionId) -> PathBuf {
    work_dir.join(format!("{DFRG_PART_FILE_PREFIX}{part}{FILE_SUFFIX}{TMP_SUFFIX}"))
}

pub fn defragmented_part_mapping_file(work_dir: &Path, part: PartitionId) -> PathBuf {
    work_dir.join(format!("{DFRG_PART_MAPPING_FILE_PREFIX}{part}{FILE_SUFFIX}"))
}

pub fn index_file(work_dir: &Path) -> PathBuf {
    work_dir.join(INDEX_FILE_NAME)
}

pub fn defragmented_index_file(work_dir: &Path) -> PathBuf {
    work_dir.join(DFRG_INDEX_FILE_NAME)
}

pub fn defragmented_index_tmp_file(work_dir: &Path) -> PathBuf {
    work_dir.join(DFRG_INDEX_TMP_FILE_NAME)
}

pub fn defragmentation_completion_marker_file(work_dir: &Path) -> PathBuf {
    work_dir.join(DFRG_COMPLETION_MARKER_FILE_NAME)
}

fn page_io<T>(result: std::io::Result<T>, what: impl Fn() -> String) -> Result<T> {
    result.map_err(|e| DefragmentationError::PageIo(format!("{}: {e}", what())).into())
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = page_io(fs::File::open(dir), || {
        format!("failed to open directory '{}'", dir.display())
    })?;
    page_io(handle.sync_all(), || {
        format!("failed to fsync directory '{}'", dir.display())
    })
}

fn delete_if_exists(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    page_io(fs::remove_file(path), || {
        format!("failed to delete '{}'", path.display())
    })?;
    Ok(true)
}

/// Atomic replace of `to` by `from`, durable after the directory fsync.
fn rename_over(from: &Path, to: &Path) -> Result<()> {
    page_io(fs::rename(from, to), || {
        format!(
            "failed to rename '{}' to '{}'",
            from.display(),
            to.display()
        )
    })?;
    fsync_dir(to.parent().expect("store files always have a parent dir"))
}

/// Group-level skip check. A work dir carrying the completion marker was
/// fully rewritten; a crash may have interrupted the final swap, so the
/// batch rename is (re)run here before the group is skipped.
pub fn skip_already_defragmented_cache_group(work_dir: &Path, grp: GroupId) -> Result<bool> {
    if !defragmentation_completion_marker_file(work_dir).exists() {
        return Ok(false);
    }

    log::info!(
        "cache group {} already defragmented, completing file swap (workDir={})",
        grp,
        work_dir.display()
    );
    batch_rename_defragmented_cache_group_partitions(work_dir)?;
    Ok(true)
}

/// Partition-level skip check. The renamed `part-dfrg-N.bin` is the
/// partition's commit point; a stale `.tmp` next to it is from a later
/// crash and is deleted.
pub fn skip_already_defragmented_partition(
    work_dir: &Path,
    grp: GroupId,
    part: PartitionId,
) -> Result<bool> {
    if !defragmented_part_file(work_dir, part).exists() {
        return Ok(false);
    }

    delete_if_exists(&defragmented_part_tmp_file(work_dir, part))?;
    log::info!(
        "partition {} of cache group {} is already defragmented, skipping",
        part,
        grp
    );
    Ok(true)
}

/// Commits one partition: `part-dfrg-N.bin.tmp -> part-dfrg-N.bin`.
pub fn rename_temp_partition_file(work_dir: &Path, part: PartitionId) -> Result<()> {
    rename_over(
        &defragmented_part_tmp_file(work_dir, part),
        &defragmented_part_file(work_dir, part),
    )
}

pub fn rename_temp_index_file(work_dir: &Path) -> Result<()> {
    rename_over(
        &defragmented_index_tmp_file(work_dir),
        &defragmented_index_file(work_dir),
    )
}

/// Atomically creates the zero-byte completion marker; its presence is
/// the sole durable signal that the whole group is rewritten.
pub fn write_defragmentation_completion_marker(work_dir: &Path) -> Result<()> {
    let marker = defragmentation_completion_marker_file(work_dir);
    let file = page_io(fs::File::create(&marker), || {
        format!("failed to create completion marker '{}'", marker.display())
    })?;
    page_io(file.sync_all(), || {
        format!("failed to sync completion marker '{}'", marker.display())
    })?;
    fsync_dir(work_dir)?;

    log::info!("defragmentation completion marker written: {}", marker.display());
    Ok(())
}

/// The final, group-level swap: every `part-dfrg-N.bin` replaces its
/// `part-N.bin`, the index follows, link maps and the marker are removed.
/// Idempotent; rerunnable after a crash at any point.
pub fn batch_rename_defragmented_cache_group_partitions(work_dir: &Path) -> Result<()> {
    let entries = page_io(fs::read_dir(work_dir), || {
        format!("failed to list work dir '{}'", work_dir.display())
    })?;

    let mut defragmented: Vec<PartitionId> = Vec::new();
    let mut mappings: Vec<PathBuf> = Vec::new();

    for entry in entries {
        let entry = page_io(entry, || {
            format!("failed to list work dir '{}'", work_dir.display())
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if let Some(part) = parse_part_no(name, DFRG_PART_FILE_PREFIX) {
            defragmented.push(part);
        } else if name.starts_with(DFRG_PART_MAPPING_FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
            mappings.push(entry.path());
        }
    }

    defragmented.sort_unstable();
    for part in defragmented {
        delete_if_exists(&part_file(work_dir, part))?;
        rename_over(
            &defragmented_part_file(work_dir, part),
            &part_file(work_dir, part),
        )?;
    }

    for mapping in mappings {
        delete_if_exists(&mapping)?;
    }

    if defragmented_index_file(work_dir).exists() {
        delete_if_exists(&index_file(work_dir))?;
        rename_over(&defragmented_index_file(work_dir), &index_file(work_dir))?;
    }

    delete_if_exists(&defragmentation_completion_marker_file(work_dir))?;
    fsync_dir(work_dir)?;

    log::info!(
        "defragmented partition files swapped in (workDir={})",
        work_dir.display()
    );
    Ok(())
}

/// Parses `N` out of `<prefix>N.bin`; rejects `.tmp` leftovers.
fn parse_part_no(name: &str, prefix: &str) -> Option<PartitionId> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.strip_suffix(FILE_SUFFIX)?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn file_names_match_the_layout() {
        let dir = Path::new("/work");

        assert_eq!(part_file(dir, 3), dir.join("part-3.bin"));
        assert_eq!(defragmented_part_file(dir, 3), dir.join("part-dfrg-3.bin"));
        assert_eq!(
            defragmented_part_tmp_file(dir, 3),
            dir.join("part-dfrg-3.bin.tmp")
        );
        assert_eq!(
            defragmented_part_mapping_file(dir, 3),
            dir.join("part-map-3.bin")
        );
        assert_eq!(defragmented_index_tmp_file(dir), dir.join("index-dfrg.bin.tmp"));
        assert_eq!(
            defragmentation_completion_marker_file(dir),
            dir.join("defrg-completion.marker")
        );
    }

    #[test]
    fn partition_skip_check_cleans_stale_tmp() {
        let dir = tempdir().unwrap();

        assert!(!skip_already_defragmented_partition(dir.path(), 1, 0).unwrap());

        touch(&defragmented_part_file(dir.path(), 0));
        touch(&defragmented_part_tmp_file(dir.path(), 0));

        assert!(skip_already_defragmented_partition(dir.path(), 1, 0).unwrap());
        assert!(!defragmented_part_tmp_file(dir.path(), 0).exists());
    }

    #[test]
    fn group_skip_check_finishes_interrupted_swap() {
        let dir = tempdir().unwrap();

        touch(&part_file(dir.path(), 0));
        touch(&defragmented_part_file(dir.path(), 0));
        touch(&defragmented_part_mapping_file(dir.path(), 0));
        write_defragmentation_completion_marker(dir.path()).unwrap();

        assert!(skip_already_defragmented_cache_group(dir.path(), 1).unwrap());

        assert!(part_file(dir.path(), 0).exists());
        assert!(!defragmented_part_file(dir.path(), 0).exists());
        assert!(!defragmented_part_mapping_file(dir.path(), 0).exists());
        assert!(!defragmentation_completion_marker_file(dir.path()).exists());

        // Marker gone, nothing left to skip.
        assert!(!skip_already_defragmented_cache_group(dir.path(), 1).unwrap());
    }

    #[test]
    fn batch_rename_swaps_index_and_ignores_tmp() {
        let dir = tempdir().unwrap();

        touch(&part_file(dir.path(), 1));
        touch(&defragmented_part_file(dir.path(), 1));
        touch(&defragmented_part_tmp_file(dir.path(), 2));
        touch(&index_file(dir.path()));
        touch(&defragmented_index_file(dir.path()));

        batch_rename_defragmented_cache_group_partitions(dir.path()).unwrap();

        assert!(part_file(dir.path(), 1).exists());
        assert!(!defragmented_part_file(dir.path(), 1).exists());
        assert!(index_file(dir.path()).exists());
        assert!(!defragmented_index_file(dir.path()).exists());
        // A dangling tmp from a crashed build stays for the next run.
        assert!(defragmented_part_tmp_file(dir.path(), 2).exists());
    }

    #[test]
    fn rename_fails_without_source() {
        let dir = tempdir().unwrap();

        let err = rename_temp_partition_file(dir.path(), 7).unwrap_err();
        assert!(err
            .downcast_ref::<DefragmentationError>()
            .is_some_and(|e| matches!(e, DefragmentationError::PageIo(_))));
    }
}
