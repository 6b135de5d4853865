//! Node annotation wire format.
//!
//! Node topology and occupancy live as plain key/value annotations on the
//! node object, so a restarted scheduler can rebuild everything from them.
//! Device lists are comma separated indices (`"0,1,5"`), assignments are
//! `task=indices` entries joined by `;`, virtual leases are
//! `slot@task=permille` entries joined by `;`. A lease whose share ends in
//! `!` holds its slot exclusively.
//!
//! Task keys are `job/task`. Job ids may contain `/`, task names may not,
//! and neither may contain a [`RESERVED`] character.

use thiserror::Error;

pub const FAMILY: &str = "npu.scheduling/family";
pub const CAPACITY: &str = "npu.scheduling/capacity";
pub const SUPER_POD_ID: &str = "npu.scheduling/super-pod-id";
pub const FREE: &str = "npu.scheduling/free";
pub const UNHEALTHY: &str = "npu.scheduling/unhealthy";
pub const ASSIGNED: &str = "npu.scheduling/assigned";
pub const VNPU: &str = "npu.scheduling/vnpu";

/// Separators of the assignment and lease formats.
pub const RESERVED: [char; 4] = [';', '=', '@', ','];

/// Whether `name` can be embedded in an annotation entry and read back
/// unchanged.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(RESERVED)
        && !name.chars().any(char::is_whitespace)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("invalid device index `{0}`")]
    InvalidIndex(String),

    #[error("malformed entry `{0}`")]
    MalformedEntry(String),

    #[error("invalid share `{0}`")]
    InvalidShare(String),
}

/// A virtual lease entry as persisted in [`VNPU`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    pub slot: usize,
    pub task: String,
    /// Share of the device in per-mille
    pub permille: u32,
    /// No other lease may share the slot
    pub exclusive: bool,
}

/// Parse `"0,1,5"`. Empty input yields an empty list.
pub fn parse_index_list(value: &str) -> Result<Vec<usize>, AnnotationError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| AnnotationError::InvalidIndex(s.to_string()))
        })
        .collect()
}

pub fn format_index_list(indices: &[usize]) -> String {
    indices
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `"job-a/worker-0=0,1;job-b/worker-0=4"`.
pub fn parse_assigned(value: &str) -> Result<Vec<(String, Vec<usize>)>, AnnotationError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (task, devices) = entry
                .split_once('=')
                .ok_or_else(|| AnnotationError::MalformedEntry(entry.to_string()))?;
            let task = task.trim();
            if task.is_empty() {
                return Err(AnnotationError::MalformedEntry(entry.to_string()));
            }
            Ok((task.to_string(), parse_index_list(devices)?))
        })
        .collect()
}

pub fn format_assigned<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [usize])>,
{
    entries
        .into_iter()
        .map(|(task, devices)| format!("{task}={}", format_index_list(devices)))
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse `"3@job-c/infer-0=500;3@job-d/infer-0=250"`.
pub fn parse_leases(value: &str) -> Result<Vec<LeaseEntry>, AnnotationError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let malformed = || AnnotationError::MalformedEntry(entry.to_string());
            let (slot, rest) = entry.split_once('@').ok_or_else(malformed)?;
            let (task, share) = rest.rsplit_once('=').ok_or_else(malformed)?;
            let slot = slot
                .trim()
                .parse::<usize>()
                .map_err(|_| AnnotationError::InvalidIndex(slot.to_string()))?;
            let share = share.trim();
            let (share, exclusive) = match share.strip_suffix('!') {
                Some(share) => (share, true),
                None => (share, false),
            };
            let permille = share
                .parse::<u32>()
                .map_err(|_| AnnotationError::InvalidShare(share.to_string()))?;
            if task.trim().is_empty() {
                return Err(malformed());
            }
            Ok(LeaseEntry {
                slot,
                task: task.trim().to_string(),
                permille,
                exclusive,
            })
        })
        .collect()
}

pub fn format_leases(entries: &[LeaseEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let marker = if e.exclusive { "!" } else { "" };
            format!("{}@{}={}{marker}", e.slot, e.task, e.permille)
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_index_list_handles_whitespace_and_empty() {
        assert_eq!(parse_index_list("").unwrap(), Vec::<usize>::new());
        assert_eq!(parse_index_list(" 0, 1 ,5").unwrap(), vec![0, 1, 5]);
        assert_eq!(
            parse_index_list("0,x").unwrap_err(),
            AnnotationError::InvalidIndex("x".to_string())
        );
    }

    #[test]
    fn assigned_entries_keep_job_paths() {
        let parsed = parse_assigned("default/job-a/worker-0=0,1;job-b/w=4").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("default/job-a/worker-0".to_string(), vec![0, 1]),
                ("job-b/w".to_string(), vec![4]),
            ]
        );

        let rendered = format_assigned(parsed.iter().map(|(t, d)| (t.as_str(), d.as_slice())));
        assert_eq!(rendered, "default/job-a/worker-0=0,1;job-b/w=4");
    }

    #[test]
    fn assigned_entry_without_separator_is_rejected() {
        assert_eq!(
            parse_assigned("job-a/w0").unwrap_err(),
            AnnotationError::MalformedEntry("job-a/w0".to_string())
        );
    }

    #[test]
    fn lease_entries_parse() {
        let parsed = parse_leases("3@job-c/infer-0=500; 3@job-d/infer-0=250").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].slot, 3);
        assert_eq!(parsed[1].task, "job-d/infer-0");
        assert_eq!(parsed[1].permille, 250);
        assert!(!parsed[1].exclusive);
        assert_eq!(
            format_leases(&parsed),
            "3@job-c/infer-0=500;3@job-d/infer-0=250"
        );
    }

    #[test]
    fn exclusive_lease_keeps_its_marker() {
        let parsed = parse_leases("2@default/serve/i0=250!").unwrap();
        assert_eq!(
            parsed,
            vec![LeaseEntry {
                slot: 2,
                task: "default/serve/i0".to_string(),
                permille: 250,
                exclusive: true,
            }]
        );
        assert_eq!(format_leases(&parsed), "2@default/serve/i0=250!");
    }

    #[test]
    fn safe_names_avoid_separators() {
        assert!(is_safe_name("default/train"));
        assert!(is_safe_name("worker-0"));
        for name in ["", "a;b", "a=b", "a@b", "a,b", "a b"] {
            assert!(!is_safe_name(name), "{name:?} accepted");
        }
    }

    #[test]
    fn lease_entry_with_bad_share_is_rejected() {
        assert_eq!(
            parse_leases("3@job/t=half").unwrap_err(),
            AnnotationError::InvalidShare("half".to_string())
        );
    }
}
