//! Transfer worker
//!
//! A worker owns one claimed pumping and drives it through
//! `CONNECTING -> { WAITING -> CONNECTING }* -> DOWNLOADING -> FINISHED`
//! (or FAILED). It is the only writer of that pumping until it releases
//! it, and it publishes every transition and progress step from its own
//! task, so per-pumping events are totally ordered.

use crate::engine::DispatchedQueue;
use crate::error::{PumpError, Result};
use crate::http::{self, ProbeOutcome, SectionCursors, ServerCapabilities};
use crate::protocol::{Pumping, PumpingId, PumpingState, QueueEvent, Section};
use crate::queue::Claim;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Why `drive` stopped without reaching a terminal state
enum Interrupted {
    /// Cancellation token fired (cancel, delete or terminate)
    Signal,
    /// The registry refused an update; should not happen
    Internal(PumpError),
}

impl From<PumpError> for Interrupted {
    fn from(err: PumpError) -> Self {
        match err {
            PumpError::Cancelled => Interrupted::Signal,
            other => Interrupted::Internal(other),
        }
    }
}

pub(crate) struct Worker {
    queue: Arc<DispatchedQueue>,
    id: PumpingId,
    token: CancellationToken,
    cancelled: Arc<AtomicBool>,
    /// Dropped when the worker exits; waiters watch for that
    _done: watch::Sender<()>,
}

impl Worker {
    pub(crate) fn new(queue: Arc<DispatchedQueue>, claim: Claim) -> Self {
        Self {
            queue,
            id: claim.id,
            token: claim.token,
            cancelled: claim.cancelled,
            _done: claim.done,
        }
    }

    pub(crate) async fn run(self) {
        tracing::debug!(id = %self.id, "Worker started");

        match self.drive().await {
            Ok(state) => {
                tracing::info!(id = %self.id, state = %state, "Pumping settled");
            }
            Err(Interrupted::Signal) => self.interrupt().await,
            Err(Interrupted::Internal(e)) => {
                tracing::error!(id = %self.id, "Worker stopped: {}", e);
                self.interrupt().await;
            }
        }
    }

    /// Run attempts until FINISHED or FAILED
    async fn drive(&self) -> std::result::Result<PumpingState, Interrupted> {
        let policy = &self.queue.policy;

        loop {
            if self.token.is_cancelled() {
                return Err(Interrupted::Signal);
            }
            self.transition(PumpingState::Connecting).await?;

            let err = match self.attempt().await {
                Ok(()) => return Ok(PumpingState::Finished),
                Err(_) if self.token.is_cancelled() => return Err(Interrupted::Signal),
                Err(PumpError::Cancelled) => return Err(Interrupted::Signal),
                Err(e) => e,
            };

            let attempts = self.queue.pumpings.update(self.id, |p| {
                p.record_failure(&err);
                Ok(p.count_attempt())
            })?;

            if !err.is_retryable() {
                tracing::warn!(id = %self.id, "Pumping failed: {}", err);
                self.settle(PumpingState::Failed).await?;
                return Ok(PumpingState::Failed);
            }

            tracing::warn!(
                id = %self.id,
                attempt = attempts,
                of = policy.max_attempts,
                "Attempt failed: {}",
                err
            );
            self.transition(PumpingState::Waiting).await?;

            if policy.exhausted(attempts) {
                self.settle(PumpingState::Failed).await?;
                return Ok(PumpingState::Failed);
            }

            let delay = policy.delay_for_attempt(attempts);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.token.cancelled() => return Err(Interrupted::Signal),
            }
        }
    }

    /// One connect-through-transfer cycle
    async fn attempt(&self) -> Result<()> {
        let caps = self.connect().await?;

        if let Some(length) = caps.content_length {
            let learned = self.queue.pumpings.update(self.id, |p| {
                let known = p.length().is_some();
                p.set_length(length)?;
                Ok(!known)
            })?;
            if learned {
                self.queue.pumpings.emit(QueueEvent::Updated { id: self.id });
            }
        }

        self.transition(PumpingState::Downloading).await?;
        self.download(&caps).await?;
        self.finalize().await?;
        self.settle(PumpingState::Finished).await
    }

    /// Resolve redirects hop by hop and probe the final address
    async fn connect(&self) -> Result<ServerCapabilities> {
        let declared = self.snapshot()?.declared_url().clone();
        let limit = self.queue.config.http.max_redirects;
        let mut url = declared.clone();
        let mut hops = 0usize;

        loop {
            let outcome = tokio::select! {
                outcome = http::probe(&self.queue.client, &url) => outcome?,
                _ = self.token.cancelled() => return Err(PumpError::Cancelled),
            };

            match outcome {
                ProbeOutcome::Ready(caps) => {
                    self.set_real_url(url).await?;
                    return Ok(caps);
                }
                ProbeOutcome::Redirect(next) => {
                    hops += 1;
                    if hops > limit {
                        return Err(PumpError::RedirectLoop {
                            url: declared.to_string(),
                            limit,
                        });
                    }
                    tracing::debug!(id = %self.id, hop = hops, to = %next, "Redirect");
                    self.set_real_url(next.clone()).await?;
                    url = next;
                }
            }
        }
    }

    async fn set_real_url(&self, url: Url) -> Result<()> {
        let changed = self.queue.pumpings.update(self.id, |p| {
            if p.real_url() == &url {
                return Ok(false);
            }
            p.set_real_url(url);
            Ok(true)
        })?;
        if changed {
            self.queue.pumpings.emit(QueueEvent::Updated { id: self.id });
            self.queue.persist_quietly().await;
        }
        Ok(())
    }

    /// Plan sections and stream them into the part file
    async fn download(&self, caps: &ServerCapabilities) -> Result<()> {
        let snapshot = self.snapshot()?;
        let part = snapshot.part_path();
        let length = snapshot.length();

        let sections = if resumable(&snapshot, caps, &part).await {
            tracing::debug!(id = %self.id, done = snapshot.downloaded(), "Resuming sections");
            snapshot.sections().to_vec()
        } else {
            remove_part_file(&part).await?;
            let sections = self.plan(length, caps.supports_range);
            self.queue.pumpings.update(self.id, |p| {
                p.set_sections(sections.clone());
                Ok(())
            })?;
            self.queue.pumpings.emit(QueueEvent::Updated { id: self.id });
            sections
        };

        http::prepare_part_file(&part, length).await?;

        let url = snapshot.real_url().clone();
        let cursors = SectionCursors::new(&sections);
        let transfer = http::fetch_sections(
            &self.queue.client,
            &url,
            &part,
            &sections,
            &cursors,
            &self.token,
        );
        tokio::pin!(transfer);

        let mut progress = tokio::time::interval(self.queue.config.progress_interval());
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);
        progress.reset();
        let mut checkpoint = tokio::time::interval(self.queue.config.checkpoint_interval());
        checkpoint.set_missed_tick_behavior(MissedTickBehavior::Skip);
        checkpoint.reset();

        let result = loop {
            tokio::select! {
                result = &mut transfer => break result,
                _ = progress.tick() => self.publish_progress(&cursors)?,
                _ = checkpoint.tick() => {
                    self.publish_progress(&cursors)?;
                    self.queue.persist_quietly().await;
                }
            }
        };

        // Keep whatever was written, even on failure, so the next attempt resumes
        self.publish_progress(&cursors)?;
        result?;

        if let [section] = sections.as_slice() {
            if section.is_open() {
                self.close_open_section(section, &cursors)?;
            }
        }
        Ok(())
    }

    fn plan(&self, length: Option<u64>, supports_range: bool) -> Vec<Section> {
        let config = &self.queue.config;
        match length {
            None => vec![Section::open(0)],
            Some(0) => Vec::new(),
            Some(len) if supports_range => {
                let count = Section::section_count(len, config.max_sections, config.min_section_size);
                Section::partition(len, count)
            }
            Some(len) => Section::partition(len, 1),
        }
    }

    /// The stream of an unknown-length transfer ended; its end is now the length
    fn close_open_section(&self, section: &Section, cursors: &SectionCursors) -> Result<()> {
        let mut closed = *section;
        closed.set_offset(cursors.get(0));
        let length = closed.downloaded();
        let sections = if closed.close() { vec![closed] } else { Vec::new() };

        self.queue.pumpings.update(self.id, |p| {
            p.set_length(length)?;
            p.set_sections(sections);
            Ok(())
        })?;
        self.queue.pumpings.emit(QueueEvent::Updated { id: self.id });
        Ok(())
    }

    /// Copy live cursors into the registry; one update event if anything moved
    fn publish_progress(&self, cursors: &SectionCursors) -> Result<()> {
        let advanced = self.queue.pumpings.update(self.id, |p| {
            let mut sections = p.sections().to_vec();
            cursors.apply(&mut sections);
            Ok(p.sync_offsets(&sections))
        })?;
        if advanced {
            self.queue.pumpings.emit(QueueEvent::Updated { id: self.id });
        }
        Ok(())
    }

    /// Check what was received and move the part file into place
    async fn finalize(&self) -> Result<()> {
        let snapshot = self.snapshot()?;
        let part = snapshot.part_path();
        let output = snapshot.output();

        // The part file is pre-sized, so only the cursors tell what arrived
        let received = snapshot.downloaded();
        let on_disk = tokio::fs::metadata(&part)
            .await
            .map_err(|e| PumpError::io(&part, "Stat failed", e))?
            .len();
        if let Some(expected) = snapshot.length() {
            for actual in [received, on_disk] {
                if actual != expected {
                    return Err(PumpError::LengthMismatch { expected, actual });
                }
            }
        }

        tokio::fs::rename(&part, output)
            .await
            .map_err(|e| PumpError::io(output, "Rename failed", e))?;
        Ok(())
    }

    /// Non-terminal transition; listeners hear about it before we go on
    async fn transition(&self, next: PumpingState) -> Result<()> {
        let old = self.queue.pumpings.update(self.id, |p| p.set_state(next))?;
        self.publish_state(old, next).await;
        Ok(())
    }

    /// Terminal transition that also releases the pumping
    async fn settle(&self, next: PumpingState) -> Result<()> {
        let old = self
            .queue
            .pumpings
            .update_and_release(self.id, |p| p.set_state(next))?;
        self.publish_state(old, next).await;
        Ok(())
    }

    /// Leave the pumping CANCELLED (cancel, delete) or QUEUED (terminate)
    async fn interrupt(&self) {
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        let released = self.queue.pumpings.update_and_release(self.id, |p| {
            let next = if cancelled {
                PumpingState::Cancelled
            } else {
                PumpingState::Queued
            };
            if p.state() == next || p.state().is_terminal() {
                return Ok(None);
            }
            Ok(Some((p.set_state(next)?, next)))
        });

        match released {
            Ok(Some((old, next))) => self.publish_state(old, next).await,
            Ok(None) => {}
            Err(e) => tracing::debug!(id = %self.id, "Release after interrupt: {}", e),
        }
    }

    async fn publish_state(&self, old_state: PumpingState, new_state: PumpingState) {
        tracing::debug!(id = %self.id, from = %old_state, to = %new_state, "State change");
        self.queue.pumpings.emit(QueueEvent::StateChanged {
            id: self.id,
            old_state,
            new_state,
        });
        self.queue.persist_quietly().await;
    }

    fn snapshot(&self) -> Result<Pumping> {
        self.queue
            .pumpings
            .get(self.id)
            .ok_or(PumpError::NotFound(self.id))
    }
}

/// Whether recorded offsets can be reused for this attempt
async fn resumable(snapshot: &Pumping, caps: &ServerCapabilities, part: &Path) -> bool {
    let Some(length) = snapshot.length() else {
        return false;
    };
    let sections = snapshot.sections();
    let covers = sections.first().map(Section::first) == Some(0)
        && sections.last().and_then(Section::last) == Some(length.saturating_sub(1))
        && sections.windows(2).all(|w| w[0].last().map(|l| l + 1) == Some(w[1].first()));

    if !(caps.supports_range && covers && snapshot.downloaded() > 0) {
        return false;
    }
    tokio::fs::metadata(part)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn remove_part_file(part: &Path) -> Result<()> {
    match tokio::fs::remove_file(part).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PumpError::io(part, "Remove failed", e)),
    }
}
