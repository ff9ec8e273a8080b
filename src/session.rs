use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::db::Database;
use crate::error::PipelineError;
use crate::models::{ConversationTurn, Role};
use crate::pipeline::{Pipeline, PipelineRun};

/// One reader's conversation: an append-only turn log plus a single-flight
/// guard so questions on the same session are answered strictly in order.
pub struct ConversationSession {
    id: String,
    turns: RwLock<Vec<ConversationTurn>>,
    in_flight: Mutex<()>,
    last_active: Mutex<Instant>,
    closed: AtomicBool,
    transcript: Option<Database>,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("session {0} is closed")]
    Closed(String),

    #[error("failed to record turn: {0:#}")]
    Transcript(anyhow::Error),
}

impl From<anyhow::Error> for TurnError {
    fn from(value: anyhow::Error) -> Self {
        TurnError::Transcript(value)
    }
}

impl ConversationSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self::restore(id, Vec::new(), None)
    }

    fn restore(id: impl Into<String>, turns: Vec<ConversationTurn>, transcript: Option<Database>) -> Self {
        Self {
            id: id.into(),
            turns: RwLock::new(turns),
            in_flight: Mutex::new(()),
            last_active: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            transcript,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.turns.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.turns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.turns.read().await.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records the question, runs the pipeline and records the answer.
    ///
    /// A failed pipeline leaves the user turn in place and appends nothing else.
    /// A session closed by its registry refuses new turns.
    pub async fn ask(&self, pipeline: &Pipeline, question: &str) -> Result<PipelineRun, TurnError> {
        let _flight = self.in_flight.lock().await;
        if self.is_closed() {
            return Err(TurnError::Closed(self.id.clone()));
        }
        self.touch().await;

        self.append(ConversationTurn::user(question)).await?;

        let run = match pipeline.run(question).await {
            Ok(run) => run,
            Err(err) => {
                tracing::warn!(session_id = %self.id, kind = err.kind(), "turn failed");
                return Err(err.into());
            }
        };

        self.append(ConversationTurn::assistant(run.answer.clone())).await?;
        self.touch().await;
        tracing::info!(
            session_id = %self.id,
            pages = run.context.page_results.len(),
            chapters = run.context.chapter_results.len(),
            latency_ms = run.latency_ms as u64,
            "turn answered"
        );
        Ok(run)
    }

    async fn append(&self, turn: ConversationTurn) -> Result<()> {
        if let Some(db) = &self.transcript {
            db.save_message(&self.id, turn.role.as_str(), &turn.text).await?;
        }
        self.turns.write().await.push(turn);
        Ok(())
    }

    async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }

    async fn last_active(&self) -> Instant {
        *self.last_active.lock().await
    }

    /// Closes the session if no turn is running. Returns false when busy.
    fn try_close(&self) -> bool {
        match self.in_flight.try_lock() {
            Ok(_flight) => {
                self.closed.store(true, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    /// Waits for the running turn, closes the session and clears its turns.
    /// The returned guard keeps queued turns out until the caller drops it.
    async fn shut(&self) -> MutexGuard<'_, ()> {
        let flight = self.in_flight.lock().await;
        self.closed.store(true, Ordering::Release);
        self.turns.write().await.clear();
        flight
    }
}

/// Live sessions keyed by id, optionally mirrored into the transcript database.
///
/// Idle sessions are evicted after `idle_ttl`, and the least recently used idle
/// session is evicted once more than `max_live` are held. Evicted sessions come
/// back from the transcript on their next request.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<ConversationSession>>>>,
    // Serialises ending a session against restoring one from the transcript.
    lifecycle: Arc<Mutex<()>>,
    limits: SessionConfig,
    transcript: Option<Database>,
}

impl SessionRegistry {
    pub fn new(transcript: Option<Database>, limits: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: Arc::new(Mutex::new(())),
            limits,
            transcript,
        }
    }

    pub async fn create(&self) -> Result<Arc<ConversationSession>> {
        let id = Uuid::new_v4().to_string();
        if let Some(db) = &self.transcript {
            db.ensure_session(&id).await?;
        }
        let session = Arc::new(ConversationSession::restore(
            id,
            Vec::new(),
            self.transcript.clone(),
        ));
        self.insert(session.clone()).await;
        Ok(session)
    }

    /// Returns the live session, restoring it from the transcript database or
    /// opening it fresh when the id is unknown.
    pub async fn get_or_open(&self, session_id: &str) -> Result<Arc<ConversationSession>> {
        if let Some(session) = self.live(session_id).await {
            return Ok(session);
        }

        let _lifecycle = self.lifecycle.lock().await;
        if let Some(session) = self.live(session_id).await {
            return Ok(session);
        }

        let turns = match &self.transcript {
            Some(db) => {
                db.ensure_session(session_id).await?;
                db.session_messages(session_id)
                    .await?
                    .into_iter()
                    .map(|(role, text)| ConversationTurn {
                        role: Role::from_db(&role),
                        text,
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        let session = Arc::new(ConversationSession::restore(
            session_id,
            turns,
            self.transcript.clone(),
        ));
        self.insert(session.clone()).await;
        Ok(session)
    }

    pub async fn find(&self, session_id: &str) -> Result<Option<Arc<ConversationSession>>> {
        if let Some(session) = self.live(session_id).await {
            return Ok(Some(session));
        }
        let Some(db) = &self.transcript else {
            return Ok(None);
        };
        if !db.session_exists(session_id).await? {
            return Ok(None);
        }
        self.get_or_open(session_id).await.map(Some)
    }

    /// Asks on the named session, reopening it once if it was evicted or ended
    /// between lookup and the turn starting.
    pub async fn ask(
        &self,
        session_id: &str,
        pipeline: &Pipeline,
        question: &str,
    ) -> Result<PipelineRun, TurnError> {
        let mut reopened = false;
        loop {
            let session = self.get_or_open(session_id).await?;
            match session.ask(pipeline, question).await {
                Err(TurnError::Closed(_)) if !reopened => reopened = true,
                other => return other,
            }
        }
    }

    /// Ends a session: waits for its running turn, then drops it from memory and
    /// clears its transcript. Turns queued behind it fail with `TurnError::Closed`.
    pub async fn end(&self, session_id: &str) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        let removed = self.sessions.write().await.remove(session_id);
        let _flight = match &removed {
            Some(session) => Some(session.shut().await),
            None => None,
        };

        let deleted = match &self.transcript {
            Some(db) => db.delete_session(session_id).await?,
            None => false,
        };
        Ok(removed.is_some() || deleted)
    }

    /// Drops sessions idle for at least the configured TTL. Busy sessions stay.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = self.limits.idle_ttl();
        let mut sessions = self.sessions.write().await;

        let mut idle = Vec::new();
        for (id, session) in sessions.iter() {
            if now.duration_since(session.last_active().await) >= ttl {
                idle.push(id.clone());
            }
        }

        let mut evicted = 0;
        for id in idle {
            if sessions.get(&id).is_some_and(|session| session.try_close()) {
                sessions.remove(&id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, live = sessions.len(), "evicted idle sessions");
        }
        evicted
    }

    pub async fn live_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Runs `evict_idle` on a fixed interval until the runtime shuts down.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let every = self.limits.idle_ttl().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                registry.evict_idle().await;
            }
        })
    }

    async fn live(&self, session_id: &str) -> Option<Arc<ConversationSession>> {
        let session = self.sessions.read().await.get(session_id).cloned()?;
        session.touch().await;
        Some(session)
    }

    async fn insert(&self, session: Arc<ConversationSession>) {
        let mut sessions = self.sessions.write().await;
        let newest = session.id.clone();
        sessions.insert(newest.clone(), session);

        let excess = sessions.len().saturating_sub(self.limits.max_live);
        if excess == 0 {
            return;
        }

        let mut by_age = Vec::with_capacity(sessions.len());
        for (id, live) in sessions.iter() {
            if *id != newest {
                by_age.push((live.last_active().await, id.clone()));
            }
        }
        by_age.sort();

        let mut evicted = 0;
        for (_, id) in by_age {
            if evicted == excess {
                break;
            }
            if sessions.get(&id).is_some_and(|live| live.try_close()) {
                sessions.remove(&id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, live = sessions.len(), "evicted least recently used sessions");
        }
    }
}
