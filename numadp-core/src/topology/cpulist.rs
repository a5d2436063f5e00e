//! Parser for the kernel's list format (`0-3,8,10-11`), used by sysfs for
//! both `node<N>/cpulist` and `node/online`.

use crate::error::AllocError;

/// Parses a list such as `0-3,8,10-11` into sorted, de-duplicated IDs.
///
/// An empty (or whitespace-only) list is valid and yields no IDs; memory-only
/// nodes report an empty `cpulist`.
pub fn parse_list(list: &str) -> Result<Vec<usize>, AllocError> {
    let mut ids = Vec::new();

    for part in list.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_id(start, list)?;
                let end = parse_id(end, list)?;
                if start > end {
                    return Err(AllocError::Topology(format!(
                        "descending range '{part}' in list '{}'",
                        list.trim()
                    )));
                }
                ids.extend(start..=end);
            }
            None => ids.push(parse_id(part, list)?),
        }
    }

    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

fn parse_id(raw: &str, list: &str) -> Result<usize, AllocError> {
    raw.trim().parse::<usize>().map_err(|e| {
        AllocError::Topology(format!("bad id '{raw}' in list '{}': {e}", list.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges_and_singles() {
        assert_eq!(parse_list("0-3,8,10-11\n").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn test_parse_sparse_online_nodes() {
        assert_eq!(parse_list("0,2,5").unwrap(), vec![0, 2, 5]);
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(parse_list("").unwrap().is_empty());
        assert!(parse_list("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_dedups_overlaps() {
        assert_eq!(parse_list("2-4,3,4-5").unwrap(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_list("0-x"), Err(AllocError::Topology(_))));
        assert!(matches!(parse_list("5-2"), Err(AllocError::Topology(_))));
    }
}
