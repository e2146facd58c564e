#![forbid(unsafe_code)]

// The fixed workload a worker performs each time its timer fires:
// connect, make sure the user exists, then create `file_count` files.
//
// A failed mutation or a file that cannot be read back ends the cycle; the
// remaining iterations are skipped and the failure is reported once.

use super::WorkerActor;
use crate::auth::token::test_access_token;
use crate::error::{WorkloadError, WorkloadResult};
use crate::event::{now_ms, Event};
use crate::guard::OperationGuard;
use crate::sync::{
    session_uri, FileRecord, Mutation, SessionNotice, SessionRequest, SyncSession, UserRecord,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl WorkerActor {
    /// Runs one workload cycle, converting any failure into an error event.
    /// Failures after `stop` are not reported.
    pub(super) async fn run_cycle(&self) {
        if let Err(e) = self.run_workload().await {
            let worker_id = self.inner.address.worker_id();
            if self.stopping() {
                debug!("Worker {} stopped mid-cycle: {}", worker_id, e);
                return;
            }
            warn!("Worker {} workload failed: {}", worker_id, e);
            self.inner.deps.reporter.report_event(
                &self.inner.address.test_id,
                Event::error(&worker_id, e.to_string()),
            );
        }
    }

    async fn run_workload(&self) -> WorkloadResult<()> {
        let record = self.record().await?;
        let worker_id = record.worker_id.clone();
        let guard = self.guard(&worker_id);
        debug!("Worker {} starting workload ({} files)", worker_id, record.file_count);

        let Some(session) = self.ensure_session(&guard, &worker_id, &record.origin_uri).await? else {
            return Ok(());
        };

        let s = session.clone();
        let user_id = worker_id.clone();
        let user = guard
            .run("preload", async move { Ok(s.preload_user(&user_id).await?) })
            .await?;

        if user.is_none() {
            if self.stopping() {
                return Ok(());
            }
            let s = session.clone();
            let user = UserRecord::for_worker(&worker_id, now_ms());
            guard
                .run("create user", async move {
                    Ok(s.run_transaction(vec![Mutation::InsertUser(user)]).await?)
                })
                .await?;
        }

        let mut created = 0;
        for _ in 0..record.file_count {
            if self.stopping() {
                debug!("Worker {} stopping after {} files", worker_id, created);
                break;
            }

            let file_id = Uuid::new_v4().to_string();
            let file = FileRecord::new_for_owner(&file_id, &worker_id, Uuid::new_v4().to_string(), now_ms());
            let s = session.clone();
            guard
                .run("create file", async move {
                    Ok(s.run_transaction(vec![Mutation::InsertFile(file)]).await?)
                })
                .await?;

            if session.committed_file(&file_id).is_none() {
                return Err(WorkloadError::AssertionFailure(format!(
                    "No file after mutate {worker_id} {file_id}"
                )));
            }
            created += 1;
        }

        info!("Worker {} finished workload: {}/{} files", worker_id, created, record.file_count);
        Ok(())
    }

    /// Returns the open session, connecting first if needed. `None` means the
    /// worker was stopped while connecting.
    async fn ensure_session(
        &self,
        guard: &OperationGuard,
        worker_id: &str,
        origin_uri: &str,
    ) -> WorkloadResult<Option<Arc<dyn SyncSession>>> {
        if let Some(session) = self.inner.session.lock().await.as_ref() {
            return Ok(Some(session.clone()));
        }

        let secret = self.inner.deps.settings.access_secret.as_deref().unwrap_or_default();
        let uri = session_uri(origin_uri, worker_id, &test_access_token(secret, worker_id))
            .map_err(|e| WorkloadError::Config(format!("invalid origin {origin_uri}: {e}")))?;

        let reporter = self.inner.deps.reporter.clone();
        let test_id = self.inner.address.test_id.clone();
        let notice_worker = worker_id.to_string();
        let request = SessionRequest {
            user_id: worker_id.to_string(),
            uri,
            on_notice: Arc::new(move |notice: SessionNotice| {
                reporter.report_event(&test_id, Event::error(&notice_worker, notice.describe()));
            }),
        };

        let backend = self.inner.deps.backend.clone();
        let session = guard
            .run("connect", async move { Ok(backend.open_session(request).await?) })
            .await?;

        let mut slot = self.inner.session.lock().await;
        if self.stopping() {
            drop(slot);
            session.close().await;
            return Ok(None);
        }
        *slot = Some(session.clone());
        Ok(Some(session))
    }
}
