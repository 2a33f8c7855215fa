//! Paging of finished-split metadata into fixed-size groups.
//!
//! Grouping is a pure function of the (immutable) finished-split list and the
//! group size, so the same group id always yields the same response.

use sync_core::{FinishedSplitInfo, MetaRequestEvent, MetaResponseGroup, Result, SyncError};

/// Number of groups needed for `entries`. Always at least one, so group 0
/// exists even when there is nothing to send.
pub fn total_groups(entries: usize, group_size: usize) -> usize {
    entries.div_ceil(group_size.max(1)).max(1)
}

/// Build the response for `request` over `infos`.
pub fn meta_group(
    split_id: &str,
    infos: &[FinishedSplitInfo],
    group_size: usize,
    request: &MetaRequestEvent,
) -> Result<MetaResponseGroup> {
    if request.split_id != split_id {
        return Err(SyncError::protocol(
            &request.split_id,
            format!("metadata requested for unknown split, expected '{split_id}'"),
        ));
    }
    let group_size = group_size.max(1);
    let total = total_groups(infos.len(), group_size);
    let group_id = request.request_meta_group_id;
    if group_id >= total {
        return Err(SyncError::protocol(
            split_id,
            format!("metadata group {group_id} out of range, there are {total} groups"),
        ));
    }
    let start = (group_id * group_size).min(infos.len());
    let end = (start + group_size).min(infos.len());
    Ok(MetaResponseGroup {
        split_id: split_id.to_string(),
        group_id,
        total_groups: total,
        entries: infos[start..end].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{Offset, TableId};

    fn infos(n: usize) -> Vec<FinishedSplitInfo> {
        (0..n)
            .map(|i| FinishedSplitInfo {
                table_id: TableId::from("t"),
                split_id: format!("t:{i}"),
                split_key_start: None,
                split_key_end: None,
                low_watermark: Offset::sequence(i as i64),
                high_watermark: Offset::sequence(i as i64 + 1),
            })
            .collect()
    }

    fn request(group: usize) -> MetaRequestEvent {
        MetaRequestEvent {
            split_id: "stream-split".to_string(),
            request_meta_group_id: group,
        }
    }

    #[test]
    fn test_total_groups() {
        assert_eq!(total_groups(0, 10), 1);
        assert_eq!(total_groups(10, 10), 1);
        assert_eq!(total_groups(11, 10), 2);
        assert_eq!(total_groups(2500, 1000), 3);
    }

    #[test]
    fn test_groups_partition_entries_in_order() {
        let all = infos(25);
        let mut collected = Vec::new();
        for group in 0..3 {
            let response = meta_group("stream-split", &all, 10, &request(group)).unwrap();
            assert_eq!(response.total_groups, 3);
            assert_eq!(response.group_id, group);
            collected.extend(response.entries);
        }
        assert_eq!(collected, all);
    }

    #[test]
    fn test_same_group_is_byte_identical() {
        let all = infos(7);
        let first = meta_group("stream-split", &all, 3, &request(1)).unwrap();
        let second = meta_group("stream-split", &all, 3, &request(1)).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_out_of_range_and_wrong_split_rejected() {
        let all = infos(5);
        assert!(matches!(
            meta_group("stream-split", &all, 5, &request(1)),
            Err(SyncError::ProtocolViolation { .. })
        ));
        let wrong = MetaRequestEvent {
            split_id: "orders:0".to_string(),
            request_meta_group_id: 0,
        };
        let err = meta_group("stream-split", &all, 5, &wrong).unwrap_err();
        assert!(err.to_string().contains("orders:0"));
    }
}
