use std::collections::BTreeMap;

use api_types::annotations;
use error_stack::Report;
use error_stack::ResultExt;

use crate::error::{Result, ScheduleError};
use crate::requirement::TaskId;
use crate::vdevice::Share;

/// Node annotations parsed into typed lists, not yet checked against the
/// family layout.
#[derive(Debug, Clone, Default)]
pub(super) struct RawAnnotations {
    pub family: String,
    pub capacity: Option<usize>,
    pub super_pod: Option<String>,
    pub free: Vec<usize>,
    pub unhealthy: Vec<usize>,
    pub assigned: Vec<(TaskId, Vec<usize>)>,
    /// `(slot, task, share, exclusive)`
    pub leases: Vec<(usize, TaskId, Share, bool)>,
}

impl RawAnnotations {
    /// # Errors
    ///
    /// - [`ScheduleError::MalformedTopology`] if a value does not parse
    pub fn parse(node: &str, values: &BTreeMap<String, String>) -> Result<Self> {
        let malformed = |message: &str| ScheduleError::malformed(node, message);
        let get = |key: &str| values.get(key).map(String::as_str).unwrap_or("");

        let family = get(annotations::FAMILY).trim().to_string();
        if family.is_empty() {
            return Err(Report::new(malformed("missing family annotation")));
        }

        let capacity = match values.get(annotations::CAPACITY) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<usize>()
                    .change_context_lazy(|| malformed("invalid capacity"))
                    .attach_printable_lazy(|| format!("value: {raw}"))?,
            ),
            None => None,
        };

        let super_pod = values
            .get(annotations::SUPER_POD_ID)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let free = annotations::parse_index_list(get(annotations::FREE))
            .change_context_lazy(|| malformed("invalid free list"))?;
        let unhealthy = annotations::parse_index_list(get(annotations::UNHEALTHY))
            .change_context_lazy(|| malformed("invalid unhealthy list"))?;

        let assigned = annotations::parse_assigned(get(annotations::ASSIGNED))
            .change_context_lazy(|| malformed("invalid assigned list"))?
            .into_iter()
            .map(|(task, devices)| {
                TaskId::parse(&task)
                    .map(|id| (id, devices))
                    .ok_or_else(|| {
                        Report::new(malformed("invalid task id in assigned list"))
                            .attach_printable(task)
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let leases = annotations::parse_leases(get(annotations::VNPU))
            .change_context_lazy(|| malformed("invalid vnpu list"))?
            .into_iter()
            .map(|entry| {
                let task = TaskId::parse(&entry.task).ok_or_else(|| {
                    Report::new(malformed("invalid task id in vnpu list"))
                        .attach_printable(entry.task.clone())
                })?;
                let share = Share::from_permille(entry.permille).ok_or_else(|| {
                    Report::new(malformed("vnpu share out of range"))
                        .attach_printable(format!("{}@{}", entry.slot, entry.task))
                })?;
                Ok((entry.slot, task, share, entry.exclusive))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            family,
            capacity,
            super_pod,
            free,
            unhealthy,
            assigned,
            leases,
        })
    }
}
