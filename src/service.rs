use crate::analytics::summarize;
use crate::backend::UsageBackend;
use crate::error::AppError;
use crate::models::{LogUsageRequest, UsageSnapshot};
use crate::session::{Session, SessionProvider};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct RequestSequencer {
    latest: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTicket(u64);

impl RequestSequencer {
    pub fn issue(&self) -> RequestTicket {
        RequestTicket(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_latest(&self, ticket: RequestTicket) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket.0
    }
}

#[derive(Debug)]
pub enum LoadResult {
    Fresh(UsageSnapshot),
    Superseded,
}

pub struct UsageService {
    backend: Arc<dyn UsageBackend>,
    sessions: Arc<dyn SessionProvider>,
    sequencer: RequestSequencer,
}

impl UsageService {
    pub fn new(backend: Arc<dyn UsageBackend>, sessions: Arc<dyn SessionProvider>) -> Self {
        Self {
            backend,
            sessions,
            sequencer: RequestSequencer::default(),
        }
    }

    fn require_session(&self) -> Result<Session, AppError> {
        self.sessions
            .current_session()
            .ok_or_else(|| AppError::Unauthorized("not signed in".into()))
    }

    // Overtaken loads are dropped whether they succeeded or failed.
    pub async fn load(&self) -> Result<LoadResult, AppError> {
        // A signed-out attempt still supersedes loads made with the old token.
        let ticket = self.sequencer.issue();
        let session = self.require_session()?;
        let started = Instant::now();

        let result = self.backend.fetch_usage(&session).await;

        if !self.sequencer.is_latest(ticket) {
            tracing::debug!(ticket = ticket.0, "discarding superseded usage response");
            return Ok(LoadResult::Superseded);
        }

        let body = match result {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    error = %err,
                    retryable = err.is_retryable(),
                    "usage fetch failed"
                );
                return Err(err);
            }
        };

        tracing::info!(
            backend = self.backend.name(),
            rows = body.logs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "usage fetched"
        );

        if let Some(server) = body.total_metrics {
            let local = summarize(body.logs.iter());
            if server != local {
                tracing::warn!(?server, ?local, "backend totals disagree with log rows");
            }
        }

        Ok(LoadResult::Fresh(UsageSnapshot {
            logs: body.logs,
            server_totals: body.total_metrics,
            fetched_at: Utc::now(),
        }))
    }

    pub async fn log_usage(&self, request: LogUsageRequest) -> Result<(), AppError> {
        let session = self.require_session()?;
        self.backend.log_usage(&session, &request).await?;
        tracing::info!(
            input_tokens = request.input_tokens,
            output_tokens = request.output_tokens,
            "usage logged"
        );
        Ok(())
    }
}
