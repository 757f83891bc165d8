//! Administrative surface.
//!
//! The operations the interactive front end drives: listings, the pin
//! duration cap, and bulk pin/unpin runs executed as background jobs.
//! Job records are kept until explicitly cleared.

use super::{PinArgs, PinCoordinator, RequestError, UnpinArgs};
use dashmap::DashMap;
use gridpin_core::{FileId, Pin, PinRequest};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active,
    Completed,
}

#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: u64,
    pub description: String,
    pub state: JobState,
    /// Human-readable summary, set once the job completes.
    pub outcome: Option<String>,
}

pub(crate) struct JobRegistry {
    jobs: DashMap<u64, JobSnapshot>,
    next_id: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self, description: String) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.jobs.insert(
            id,
            JobSnapshot {
                id,
                description,
                state: JobState::Active,
                outcome: None,
            },
        );
        id
    }

    fn complete(&self, id: u64, outcome: String) {
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            entry.state = JobState::Completed;
            entry.outcome = Some(outcome);
        }
    }
}

impl PinCoordinator {
    /// Every pin with its requests.
    pub fn list_pins(&self) -> Result<Vec<(Pin, Vec<PinRequest>)>, RequestError> {
        Ok(self.store.all_pins()?)
    }

    pub fn list_pins_for_file(&self, file: &str) -> Result<Vec<Pin>, RequestError> {
        let file = FileId::new(file).map_err(|e| RequestError::Invalid(e.to_string()))?;
        Ok(self.store.pins_for_file(&file)?)
    }

    pub fn pin_with_requests(
        &self,
        pin_id: u64,
    ) -> Result<Option<(Pin, Vec<PinRequest>)>, RequestError> {
        let Some(pin) = self.store.pin_by_id(pin_id)? else {
            return Ok(None);
        };
        let requests = self.store.requests_for_pin(pin_id)?;
        Ok(Some((pin, requests)))
    }

    pub fn max_pin_duration(&self) -> Option<Duration> {
        self.max_duration()
    }

    /// Returns the previous cap.
    pub fn set_max_pin_duration(&self, max: Option<Duration>) -> Option<Duration> {
        self.replace_max_duration(max)
    }

    /// Pins one file in the background; progress is visible via
    /// [`PinCoordinator::jobs`].
    pub fn start_pin_job(self: &Arc<Self>, file: String, lease_seconds: i64) -> u64 {
        let id = self
            .jobs
            .register(format!("pin {file} for {lease_seconds}s"));
        let coordinator = self.clone();
        tokio::spawn(async move {
            let outcome = match coordinator
                .pin(PinArgs {
                    file,
                    lease_seconds,
                    correlation_id: None,
                    owner: None,
                })
                .await
            {
                Ok(grant) => format!("pinned, request {} expires {}", grant.request_id, grant.expiry),
                Err(e) => format!("failed: {e}"),
            };
            coordinator.jobs.complete(id, outcome);
        });
        id
    }

    pub fn start_unpin_job(self: &Arc<Self>, file: String, force: bool) -> u64 {
        let id = self.jobs.register(format!("unpin {file}"));
        let coordinator = self.clone();
        tokio::spawn(async move {
            let outcome = match coordinator
                .unpin(UnpinArgs {
                    file,
                    request_id: None,
                    correlation_id: None,
                    requester: None,
                    force,
                })
                .await
            {
                Ok(()) => "unpinned".to_owned(),
                Err(e) => format!("failed: {e}"),
            };
            coordinator.jobs.complete(id, outcome);
        });
        id
    }

    /// Pins every listed file, sequentially, as one background job.
    pub fn start_bulk_pin(self: &Arc<Self>, files: Vec<String>, lease_seconds: i64) -> u64 {
        let id = self
            .jobs
            .register(format!("bulk pin of {} files for {lease_seconds}s", files.len()));
        let coordinator = self.clone();
        tokio::spawn(async move {
            let total = files.len();
            let mut pinned = 0usize;
            for file in files {
                match coordinator
                    .pin(PinArgs {
                        file: file.clone(),
                        lease_seconds,
                        correlation_id: None,
                        owner: None,
                    })
                    .await
                {
                    Ok(_) => pinned += 1,
                    Err(e) => tracing::warn!(%file, "bulk pin entry failed: {e}"),
                }
            }
            coordinator.jobs.complete(id, format!("pinned {pinned}/{total}"));
        });
        id
    }

    pub fn start_bulk_unpin(self: &Arc<Self>, files: Vec<String>, force: bool) -> u64 {
        let id = self
            .jobs
            .register(format!("bulk unpin of {} files", files.len()));
        let coordinator = self.clone();
        tokio::spawn(async move {
            let total = files.len();
            let mut unpinned = 0usize;
            for file in files {
                match coordinator
                    .unpin(UnpinArgs {
                        file: file.clone(),
                        request_id: None,
                        correlation_id: None,
                        requester: None,
                        force,
                    })
                    .await
                {
                    Ok(()) => unpinned += 1,
                    Err(e) => tracing::warn!(%file, "bulk unpin entry failed: {e}"),
                }
            }
            coordinator
                .jobs
                .complete(id, format!("unpinned {unpinned}/{total}"));
        });
        id
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<_> = self.jobs.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Drops completed job records, returning how many were removed.
    pub fn clear_completed_jobs(&self) -> usize {
        let before = self.jobs.jobs.len();
        self.jobs.jobs.retain(|_, job| job.state == JobState::Active);
        before - self.jobs.jobs.len()
    }
}
