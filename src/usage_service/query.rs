//! Lifecycle of one asynchronous aggregation job.
//!
//! ```text
//! Created -> Submitted -> Polling* -> Done
//!                     \-----------\-> Failed
//! ```
//!
//! Each poll step blocks the calling thread for the poll interval. The wait
//! goes through a [`CancelToken`] so a pass can be aborted between polls.

use super::types::{QueryOutcome, QueryRequest};
use super::UsageService;
use crate::error::{SyncError, SyncResult};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until the service reports done.
    pub max_polls: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    Created,
    Submitted { job_id: String },
    Polling { job_id: String, polls: u32 },
    Done { job_id: String },
    Failed { reason: String },
}

impl QueryState {
    fn job_id(&self) -> Option<&str> {
        match self {
            QueryState::Submitted { job_id }
            | QueryState::Polling { job_id, .. }
            | QueryState::Done { job_id } => Some(job_id),
            QueryState::Created | QueryState::Failed { .. } => None,
        }
    }
}

/// Cancellable timed wait shared between a pass and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut cancelled) = lock.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleeps for `duration` unless cancelled first.
    pub fn wait(&self, duration: Duration) -> SyncResult<()> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = lock.lock().map_err(|_| SyncError::Cancelled)?;
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (guard, _) = cvar
                .wait_timeout(cancelled, deadline - now)
                .map_err(|_| SyncError::Cancelled)?;
            cancelled = guard;
        }
        Err(SyncError::Cancelled)
    }
}

/// One aggregation job against a connected service.
pub struct AsyncQuery<'a> {
    service: &'a dyn UsageService,
    request: QueryRequest,
    state: QueryState,
}

impl<'a> AsyncQuery<'a> {
    pub fn new(service: &'a dyn UsageService, request: QueryRequest) -> Self {
        Self {
            service,
            request,
            state: QueryState::Created,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &QueryState {
        &self.state
    }

    /// Posts the request and records the job id.
    pub fn submit(&mut self) -> SyncResult<String> {
        if self.state != QueryState::Created {
            return Err(SyncError::Protocol(format!(
                "submit called in state {:?}",
                self.state
            )));
        }

        match self.service.submit_query(&self.request) {
            Ok(job_id) => {
                tracing::debug!(
                    server = self.service.server_name(),
                    job_id = %job_id,
                    volume_path = %self.request.volume_and_path,
                    "query submitted"
                );
                self.state = QueryState::Submitted {
                    job_id: job_id.clone(),
                };
                Ok(job_id)
            }
            Err(e) => {
                self.state = QueryState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Polls until the service reports the job done, then fetches the result.
    ///
    /// Never returns a result for a job that has not reported done: hitting
    /// the poll ceiling or a cancellation fails the job instead.
    pub fn await_completion(
        &mut self,
        policy: &PollPolicy,
        cancel: &CancelToken,
    ) -> SyncResult<QueryOutcome> {
        let job_id = match &self.state {
            QueryState::Submitted { job_id } | QueryState::Polling { job_id, .. } => job_id.clone(),
            other => {
                return Err(SyncError::Protocol(format!(
                    "await_completion called in state {:?}",
                    other
                )))
            }
        };

        let mut polls = match self.state {
            QueryState::Polling { polls, .. } => polls,
            _ => 0,
        };

        loop {
            if cancel.is_cancelled() {
                return self.fail(SyncError::Cancelled);
            }

            polls += 1;
            self.state = QueryState::Polling {
                job_id: job_id.clone(),
                polls,
            };

            let done = match self.service.query_is_done(&job_id) {
                Ok(done) => done,
                Err(e) => return self.fail(e),
            };
            if done {
                tracing::debug!(job_id = %job_id, polls, "query done");
                self.state = QueryState::Done {
                    job_id: job_id.clone(),
                };
                return self.fetch_result();
            }

            if policy.max_polls.is_some_and(|max| polls >= max) {
                return self.fail(SyncError::PollLimit { job_id, polls });
            }
            if let Err(e) = cancel.wait(policy.interval) {
                return self.fail(e);
            }
        }
    }

    /// One-shot fetch of a completed job's result.
    pub fn fetch_result(&self) -> SyncResult<QueryOutcome> {
        match &self.state {
            QueryState::Done { job_id } => {
                let payload = self.service.query_result(job_id)?;
                Ok(QueryOutcome::classify(payload))
            }
            other => Err(SyncError::Protocol(format!(
                "result requested for job {} in state {:?}",
                other.job_id().unwrap_or("<none>"),
                other
            ))),
        }
    }

    fn fail<T>(&mut self, error: SyncError) -> SyncResult<T> {
        tracing::warn!(
            volume_path = %self.request.volume_and_path,
            error = %error,
            "query failed"
        );
        self.state = QueryState::Failed {
            reason: error.to_string(),
        };
        Err(error)
    }
}

/// Submit, wait and fetch in one call.
pub fn run_query(
    service: &dyn UsageService,
    request: QueryRequest,
    policy: &PollPolicy,
    cancel: &CancelToken,
) -> SyncResult<QueryOutcome> {
    let mut query = AsyncQuery::new(service, request);
    query.submit()?;
    query.await_completion(policy, cancel)
}

#[cfg(test)]
#[path = "tests/query_tests.rs"]
mod tests;
