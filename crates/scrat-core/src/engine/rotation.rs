use std::collections::{BTreeMap, HashMap};

use tracing::{info, warn};

use crate::catalog::{BackupKind, BackupRow, Catalog};
use crate::config::RetryConfig;
use crate::destination::retry::with_retry;
use crate::destination::Destination;
use crate::error::Result;
use crate::layout;

/// Enforce `max_versions` by deleting whole backup chains, oldest first.
///
/// A chain is a full backup plus every completed incremental whose base
/// lineage leads to it, so no surviving backup can lose an ancestor.
/// Catalog rows go first; remote objects left behind by a failed delete are
/// orphans, not dangling references.
pub(super) fn apply(
    catalog: &Catalog,
    dest: &mut dyn Destination,
    destination_ref: &str,
    max_versions: usize,
    retry: &RetryConfig,
) -> Result<usize> {
    let completed = catalog.completed_backups(destination_ref)?;
    let by_id: HashMap<&str, &BackupRow> =
        completed.iter().map(|b| (b.backup_id.as_str(), b)).collect();

    // Chains keyed by their root id; BTreeMap keeps them oldest-first.
    let mut chains: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in &completed {
        chains
            .entry(chain_root(row, &by_id))
            .or_default()
            .push(row.backup_id.clone());
    }

    let overflow = chains.len().saturating_sub(max_versions);
    if overflow == 0 {
        return Ok(0);
    }

    let doomed: Vec<Vec<String>> = chains.into_values().take(overflow).collect();

    let mut removed = 0;
    for members in doomed {
        info!(
            chain = %members.first().map(String::as_str).unwrap_or(""),
            backups = members.len(),
            "rotating out expired backup chain"
        );
        // Newest member first, so a base always outlives its dependents.
        for backup_id in members.iter().rev() {
            catalog.delete_backup(backup_id)?;
            if let Err(e) = with_retry(retry, "rotation delete", || {
                dest.delete_tree(&layout::backup_dir(backup_id))
            }) {
                warn!(
                    backup_id = %backup_id,
                    error = %e,
                    "could not delete rotated backup from destination; orphan objects remain"
                );
            }
            catalog.log("INFO", &format!("rotated out backup {backup_id}"), None)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Walk base links to the owning full backup. A backup whose lineage is
/// broken acts as its own chain root, so it still rotates out.
fn chain_root(row: &BackupRow, by_id: &HashMap<&str, &BackupRow>) -> String {
    let mut current = row;
    loop {
        if current.kind == BackupKind::Full {
            return current.backup_id.clone();
        }
        match current
            .base_backup_id
            .as_deref()
            .and_then(|id| by_id.get(id))
        {
            Some(parent) => current = parent,
            None => return current.backup_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackupStats, BackupStatus};
    use crate::testutil::MemoryDestination;
    use chrono::{TimeZone, Utc};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 1,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    fn completed_backup(catalog: &Catalog, id: &str, kind: BackupKind, base: Option<&str>, hour: u32) {
        catalog
            .create_backup(&BackupRow {
                backup_id: id.into(),
                kind,
                base_backup_id: base.map(String::from),
                destination_ref: "dest1".into(),
                status: BackupStatus::Running,
                started_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
                finished_at: None,
                files_total: 0,
                size_original: 0,
                size_stored: 0,
                salt: vec![0u8; 32],
                verifier: "aa".into(),
                error_message: None,
            })
            .unwrap();
        catalog
            .mark_backup_completed(id, &BackupStats::default(), Utc::now())
            .unwrap();
    }

    fn seed_objects(dest: &mut MemoryDestination, backup_id: &str) {
        dest.put_stream(
            &format!("{}/data.001.scrat", layout::backup_dir(backup_id)),
            &mut &b"segment"[..],
            None,
        )
        .unwrap();
        dest.put_stream(
            &format!("{}/manifest.json.enc", layout::backup_dir(backup_id)),
            &mut &b"manifest"[..],
            None,
        )
        .unwrap();
    }

    #[test]
    fn no_overflow_is_a_no_op() {
        let catalog = Catalog::open_in_memory().unwrap();
        completed_backup(&catalog, "20240501_080000_full", BackupKind::Full, None, 8);

        let mut dest = MemoryDestination::new();
        seed_objects(&mut dest, "20240501_080000_full");

        let removed = apply(&catalog, &mut dest, "dest1", 3, &fast_retry()).unwrap();
        assert_eq!(removed, 0);
        assert!(dest.contains("scrat-backup/backups/20240501_080000_full/data.001.scrat"));
    }

    #[test]
    fn oldest_chain_goes_with_its_incrementals() {
        let catalog = Catalog::open_in_memory().unwrap();
        completed_backup(&catalog, "20240501_080000_full", BackupKind::Full, None, 8);
        completed_backup(
            &catalog,
            "20240501_090000_incr",
            BackupKind::Incremental,
            Some("20240501_080000_full"),
            9,
        );
        completed_backup(&catalog, "20240501_100000_full", BackupKind::Full, None, 10);

        let mut dest = MemoryDestination::new();
        for id in [
            "20240501_080000_full",
            "20240501_090000_incr",
            "20240501_100000_full",
        ] {
            seed_objects(&mut dest, id);
        }

        let removed = apply(&catalog, &mut dest, "dest1", 1, &fast_retry()).unwrap();
        assert_eq!(removed, 2);

        // Rows of the expired chain are gone, the survivor is intact.
        assert!(catalog.backup("20240501_080000_full").unwrap().is_none());
        assert!(catalog.backup("20240501_090000_incr").unwrap().is_none());
        assert!(catalog.backup("20240501_100000_full").unwrap().is_some());

        let remaining = dest.object_names();
        assert!(remaining.iter().all(|k| k.contains("20240501_100000_full")));
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn survivors_keep_their_ancestors() {
        let catalog = Catalog::open_in_memory().unwrap();
        completed_backup(&catalog, "20240501_080000_full", BackupKind::Full, None, 8);
        completed_backup(&catalog, "20240501_100000_full", BackupKind::Full, None, 10);
        completed_backup(
            &catalog,
            "20240501_110000_incr",
            BackupKind::Incremental,
            Some("20240501_100000_full"),
            11,
        );

        let mut dest = MemoryDestination::new();
        for id in [
            "20240501_080000_full",
            "20240501_100000_full",
            "20240501_110000_incr",
        ] {
            seed_objects(&mut dest, id);
        }

        apply(&catalog, &mut dest, "dest1", 1, &fast_retry()).unwrap();

        // The surviving incremental's base survived with it.
        let incr = catalog.backup("20240501_110000_incr").unwrap().unwrap();
        assert_eq!(
            incr.base_backup_id.as_deref(),
            Some("20240501_100000_full")
        );
        assert!(catalog.backup("20240501_100000_full").unwrap().is_some());
        assert!(catalog.backup("20240501_080000_full").unwrap().is_none());
    }
}
