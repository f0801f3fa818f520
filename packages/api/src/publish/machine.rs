use std::sync::Arc;

use chrono::Utc;

use super::session::{
    CasOutcome, PublishError, PublishErrorInfo, PublishResult, PublishSession, PublishStatus,
    RunnerInfo, SessionStore, SessionStoreError,
};

const CAS_RETRIES: usize = 4;

/// The publish state machine. Every mutation re-reads the record, applies the
/// transition guard and writes through a revision-guarded compare-and-swap,
/// so concurrent callbacks from the runner, the webhook and the client
/// serialise without a lock.
pub struct PublishSessions {
    store: Arc<dyn SessionStore>,
}

impl PublishSessions {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        user_id: &str,
        content_id: &str,
        format: &str,
    ) -> Result<PublishSession, PublishError> {
        let session = PublishSession::new(
            uuid::Uuid::new_v4().to_string(),
            user_id.to_string(),
            content_id.to_string(),
            format.to_string(),
        );
        self.store.insert(&session).await?;
        tracing::info!(session_id = %session.id, content_id, "Created publish session");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<PublishSession, PublishError> {
        self.store
            .get(id)
            .await?
            .ok_or(PublishError::SessionNotFound)
    }

    /// Owner-scoped read. A mismatched owner is indistinguishable from a
    /// missing session.
    pub async fn get_owned(&self, id: &str, user_id: &str) -> Result<PublishSession, PublishError> {
        let session = self.get(id).await?;
        if session.user_id != user_id {
            return Err(PublishError::SessionNotFound);
        }
        Ok(session)
    }

    pub async fn attach_runner(
        &self,
        id: &str,
        runner: RunnerInfo,
    ) -> Result<PublishSession, PublishError> {
        let run_id = runner.run_id.clone();
        let session = self
            .transition(id, "attest", move |current| {
                match current.status {
                    PublishStatus::Pending => {}
                    // A runner re-sending its attestation is harmless.
                    PublishStatus::RunnerAttested
                        if current.gh.as_ref().and_then(|gh| gh.run_id.as_ref())
                            == runner.run_id.as_ref() =>
                    {
                        return Ok(None);
                    }
                    status => {
                        return Err(PublishError::InvalidTransition {
                            from: status.as_str(),
                            operation: "attest",
                        });
                    }
                }
                let mut next = current.clone();
                next.status = PublishStatus::RunnerAttested;
                let mut info = runner.clone();
                if info.url.is_none() {
                    info.url = current.gh.as_ref().and_then(|gh| gh.url.clone());
                }
                next.gh = Some(info);
                Ok(Some(next))
            })
            .await?;
        if let Some(run_id) = run_id {
            self.store.index_run(&run_id, id).await?;
        }
        Ok(session)
    }

    /// Applies a progress callback. Progress only moves forward; a late or
    /// duplicate report with a lower value leaves the stored value in place
    /// while phase and message still update.
    pub async fn update_progress(
        &self,
        id: &str,
        progress: Option<u8>,
        phase: Option<String>,
        message: Option<String>,
    ) -> Result<PublishSession, PublishError> {
        self.transition(id, "update", move |current| {
            match current.status {
                PublishStatus::RunnerAttested | PublishStatus::InProgress => {}
                status => {
                    return Err(PublishError::InvalidTransition {
                        from: status.as_str(),
                        operation: "update",
                    });
                }
            }
            let mut next = current.clone();
            next.status = PublishStatus::InProgress;
            if let Some(p) = progress {
                next.progress = next.progress.max(p.min(100));
            }
            if let Some(phase) = phase.clone() {
                next.phase = Some(phase);
            }
            if let Some(message) = message.clone() {
                next.message = Some(message);
            }
            Ok(Some(next))
        })
        .await
    }

    pub async fn complete(
        &self,
        id: &str,
        result: PublishResult,
    ) -> Result<PublishSession, PublishError> {
        self.transition(id, "complete", move |current| {
            match current.status {
                PublishStatus::Completed => {
                    // Idempotent only for the identical payload.
                    if current.result.as_ref() == Some(&result) {
                        return Ok(None);
                    }
                    return Err(PublishError::InvalidTransition {
                        from: current.status.as_str(),
                        operation: "complete",
                    });
                }
                // Fast jobs may complete straight from runner-attested, but a
                // run that never attested cannot finish.
                PublishStatus::Failed | PublishStatus::Pending => {
                    return Err(PublishError::InvalidTransition {
                        from: current.status.as_str(),
                        operation: "complete",
                    });
                }
                PublishStatus::RunnerAttested | PublishStatus::InProgress => {}
            }
            let mut next = current.clone();
            next.status = PublishStatus::Completed;
            next.progress = 100;
            next.result = Some(result.clone());
            next.error = None;
            if next.completed_at.is_none() {
                next.completed_at = Some(Utc::now().timestamp_millis());
            }
            Ok(Some(next))
        })
        .await
    }

    pub async fn fail(
        &self,
        id: &str,
        error: PublishErrorInfo,
    ) -> Result<PublishSession, PublishError> {
        self.transition(id, "fail", move |current| {
            match current.status {
                PublishStatus::Failed => {
                    if current.error.as_ref() == Some(&error) {
                        return Ok(None);
                    }
                    return Err(PublishError::InvalidTransition {
                        from: current.status.as_str(),
                        operation: "fail",
                    });
                }
                PublishStatus::Completed => {
                    return Err(PublishError::InvalidTransition {
                        from: current.status.as_str(),
                        operation: "fail",
                    });
                }
                _ => {}
            }
            let mut next = current.clone();
            next.status = PublishStatus::Failed;
            next.error = Some(error.clone());
            if next.completed_at.is_none() {
                next.completed_at = Some(Utc::now().timestamp_millis());
            }
            Ok(Some(next))
        })
        .await
    }

    /// Merges webhook job telemetry (phase + observed step names) into the
    /// runner record without advancing the status.
    pub async fn record_job(
        &self,
        id: &str,
        phase: Option<String>,
        steps: Vec<String>,
    ) -> Result<PublishSession, PublishError> {
        self.transition(id, "record-job", move |current| {
            if current.status.is_terminal() {
                return Err(PublishError::InvalidTransition {
                    from: current.status.as_str(),
                    operation: "record-job",
                });
            }
            let mut next = current.clone();
            if let Some(phase) = phase.clone() {
                next.phase = Some(phase);
            }
            let gh = next.gh.get_or_insert_with(RunnerInfo::default);
            for step in &steps {
                if !gh.steps.contains(step) {
                    gh.steps.push(step.clone());
                }
            }
            Ok(Some(next))
        })
        .await
    }

    /// Best-effort note of what dispatch learned about the run. Display-only
    /// `gh` enrichment: the run identity is a guess until the runner attests,
    /// so this never writes the run index. Only `attach_runner` binds a run
    /// id to a session, from verified claims.
    pub async fn record_dispatch(
        &self,
        id: &str,
        run_id: Option<String>,
        url: Option<String>,
    ) -> Result<PublishSession, PublishError> {
        self.transition(id, "record-dispatch", move |current| {
            if current.status.is_terminal() {
                return Err(PublishError::InvalidTransition {
                    from: current.status.as_str(),
                    operation: "record-dispatch",
                });
            }
            let mut next = current.clone();
            let gh = next.gh.get_or_insert_with(RunnerInfo::default);
            if gh.run_id.is_none() {
                gh.run_id = run_id.clone();
            }
            if gh.url.is_none() {
                gh.url = url.clone();
            }
            Ok(Some(next))
        })
        .await
    }

    pub async fn stash_combined_token(
        &self,
        id: &str,
        token: &str,
    ) -> Result<(), SessionStoreError> {
        self.store.put_token(id, token).await
    }

    /// Hands out the combined token at most once.
    pub async fn consume_combined_token(
        &self,
        id: &str,
    ) -> Result<Option<String>, SessionStoreError> {
        self.store.take_token(id).await
    }

    pub async fn session_for_run(&self, run_id: &str) -> Result<Option<String>, SessionStoreError> {
        self.store.session_for_run(run_id).await
    }

    pub async fn ping_store(&self) -> Result<(), SessionStoreError> {
        self.store.ping().await
    }

    /// CAS loop shared by all mutations. `apply` returns `Ok(None)` when the
    /// current record already satisfies the operation (idempotent no-op).
    async fn transition<F>(
        &self,
        id: &str,
        operation: &'static str,
        mut apply: F,
    ) -> Result<PublishSession, PublishError>
    where
        F: FnMut(&PublishSession) -> Result<Option<PublishSession>, PublishError>,
    {
        for _ in 0..CAS_RETRIES {
            let current = self.get(id).await?;
            let mut next = match apply(&current)? {
                Some(next) => next,
                None => return Ok(current),
            };
            next.revision = current.revision.wrapping_add(1);
            next.touch();
            match self.store.compare_and_swap(&next).await? {
                CasOutcome::Written => {
                    tracing::debug!(
                        session_id = %id,
                        operation,
                        status = next.status.as_str(),
                        "Applied session transition"
                    );
                    return Ok(next);
                }
                CasOutcome::Conflict => continue,
                CasOutcome::Missing => return Err(PublishError::SessionNotFound),
            }
        }
        Err(PublishError::Store(SessionStoreError::Backend(format!(
            "gave up on '{}' for session {} after {} contended writes",
            operation, id, CAS_RETRIES
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::store::memory::MemorySessionStore;
    use std::time::Duration;

    fn machine() -> (PublishSessions, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
        (PublishSessions::new(store.clone()), store)
    }

    fn runner(run_id: &str) -> RunnerInfo {
        RunnerInfo {
            run_id: Some(run_id.to_string()),
            repository: Some("acme/books".to_string()),
            ..Default::default()
        }
    }

    fn ok_result() -> PublishResult {
        PublishResult {
            artifact_url: "https://cdn.example/book.epub".to_string(),
            format: Some("epub".to_string()),
            size_bytes: Some(1024),
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_completed() {
        let (machine, _) = machine();
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        assert_eq!(session.status, PublishStatus::Pending);

        let session = machine
            .attach_runner(&session.id, runner("42"))
            .await
            .unwrap();
        assert_eq!(session.status, PublishStatus::RunnerAttested);
        assert_eq!(machine.session_for_run("42").await.unwrap().unwrap(), session.id);

        let session = machine
            .update_progress(&session.id, Some(40), Some("render".into()), None)
            .await
            .unwrap();
        assert_eq!(session.status, PublishStatus::InProgress);
        assert_eq!(session.progress, 40);

        let session = machine.complete(&session.id, ok_result()).await.unwrap();
        assert_eq!(session.status, PublishStatus::Completed);
        assert_eq!(session.progress, 100);
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_clamped() {
        let (machine, _) = machine();
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        machine
            .attach_runner(&session.id, runner("42"))
            .await
            .unwrap();

        let s = machine
            .update_progress(&session.id, Some(70), None, None)
            .await
            .unwrap();
        assert_eq!(s.progress, 70);

        // A late lower report keeps the stored value.
        let s = machine
            .update_progress(&session.id, Some(30), Some("late".into()), None)
            .await
            .unwrap();
        assert_eq!(s.progress, 70);
        assert_eq!(s.phase.as_deref(), Some("late"));

        let s = machine
            .update_progress(&session.id, Some(200), None, None)
            .await
            .unwrap();
        assert_eq!(s.progress, 100);
    }

    #[tokio::test]
    async fn update_from_pending_is_rejected() {
        let (machine, _) = machine();
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        let err = machine
            .update_progress(&session.id, Some(10), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidTransition { .. }));

        // Completion without attestation is rejected too.
        assert!(matches!(
            machine.complete(&session.id, ok_result()).await.unwrap_err(),
            PublishError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn terminal_states_are_idempotent_but_exclusive() {
        let (machine, _) = machine();
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        machine
            .attach_runner(&session.id, runner("42"))
            .await
            .unwrap();

        let first = machine.complete(&session.id, ok_result()).await.unwrap();
        // Identical repeat is a no-op, completed_at does not move.
        let second = machine.complete(&session.id, ok_result()).await.unwrap();
        assert_eq!(first.completed_at, second.completed_at);
        assert_eq!(first.revision, second.revision);

        // A different payload is not idempotent.
        let mut other = ok_result();
        other.artifact_url = "https://cdn.example/other.epub".to_string();
        assert!(matches!(
            machine.complete(&session.id, other).await.unwrap_err(),
            PublishError::InvalidTransition { .. }
        ));

        // Cross-terminal transition is rejected.
        let err = machine
            .fail(
                &session.id,
                PublishErrorInfo {
                    code: "x".into(),
                    message: "y".into(),
                    details: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn owner_mismatch_reads_as_missing() {
        let (machine, _) = machine();
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        assert!(machine.get_owned(&session.id, "user-1").await.is_ok());
        assert!(matches!(
            machine.get_owned(&session.id, "user-2").await.unwrap_err(),
            PublishError::SessionNotFound
        ));
    }

    #[tokio::test]
    async fn combined_token_is_consumed_exactly_once() {
        let (machine, _) = machine();
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        machine
            .stash_combined_token(&session.id, "tok-abc")
            .await
            .unwrap();

        assert_eq!(
            machine
                .consume_combined_token(&session.id)
                .await
                .unwrap()
                .as_deref(),
            Some("tok-abc")
        );
        assert!(
            machine
                .consume_combined_token(&session.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn concurrent_consumers_see_one_token() {
        let (machine, _) = machine();
        let machine = Arc::new(machine);
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        machine
            .stash_combined_token(&session.id, "tok-abc")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let machine = machine.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move {
                machine.consume_combined_token(&id).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn repeated_attestation_with_same_run_is_a_noop() {
        let (machine, _) = machine();
        let session = machine.create("user-1", "book-9", "epub").await.unwrap();
        let first = machine
            .attach_runner(&session.id, runner("42"))
            .await
            .unwrap();
        let second = machine
            .attach_runner(&session.id, runner("42"))
            .await
            .unwrap();
        assert_eq!(first.revision, second.revision);

        // A different run attesting the same session is rejected.
        assert!(matches!(
            machine
                .attach_runner(&session.id, runner("43"))
                .await
                .unwrap_err(),
            PublishError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn dispatch_receipt_never_binds_the_run_index() {
        let (machine, _) = machine();
        let a = machine.create("user-1", "book-9", "epub").await.unwrap();
        let b = machine.create("user-2", "book-10", "epub").await.unwrap();

        // The receipt's run id is a concurrent-create guess: it may belong to
        // session B's run. It must stay display-only.
        let a_after = machine
            .record_dispatch(&a.id, Some("run-77".into()), Some("https://ci.example/runs/77".into()))
            .await
            .unwrap();
        assert_eq!(a_after.gh.as_ref().unwrap().run_id.as_deref(), Some("run-77"));
        assert!(machine.session_for_run("run-77").await.unwrap().is_none());

        // Only verified attestation binds the index, and it binds the
        // attesting session.
        machine.attach_runner(&b.id, runner("run-77")).await.unwrap();
        assert_eq!(
            machine.session_for_run("run-77").await.unwrap().unwrap(),
            b.id
        );
        let a_now = machine.get(&a.id).await.unwrap();
        assert_eq!(a_now.status, PublishStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (machine, _) = machine();
        assert!(matches!(
            machine.get("nope").await.unwrap_err(),
            PublishError::SessionNotFound
        ));
    }
}
