//! Scripted backends shared by unit tests.

use async_trait::async_trait;
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::llm::{Backend, BackendEvent, BackendFactory, EventStream, Turn};

pub type ScriptedEvent = Result<BackendEvent, BackendError>;

pub fn delta(text: &str) -> ScriptedEvent {
    Ok(BackendEvent::Delta(text.to_string()))
}

enum Attempt {
    OpenError(BackendError),
    Events(Vec<ScriptedEvent>),
    Live(mpsc::UnboundedReceiver<ScriptedEvent>),
}

#[derive(Default)]
struct Script {
    attempts: Mutex<VecDeque<Attempt>>,
    builds: AtomicUsize,
    prompts: Mutex<Vec<Vec<Turn>>>,
}

/// Every stream opened by any backend it builds consumes the next queued
/// attempt, in order.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, attempt: Attempt) {
        self.script.attempts.lock().unwrap().push_back(attempt);
    }

    pub fn with_events(self, events: Vec<ScriptedEvent>) -> Self {
        self.push(Attempt::Events(events));
        self
    }

    pub fn with_open_error(self, err: BackendError) -> Self {
        self.push(Attempt::OpenError(err));
        self
    }

    /// Queue a stream whose events are fed by the returned sender. Dropping
    /// the sender ends the stream.
    pub fn live(&self) -> mpsc::UnboundedSender<ScriptedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Attempt::Live(rx));
        tx
    }

    pub fn arc(&self) -> Arc<dyn BackendFactory> {
        Arc::new(self.clone())
    }

    pub fn builds(&self) -> usize {
        self.script.builds.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<Turn>> {
        self.script.prompts.lock().unwrap().clone()
    }
}

impl BackendFactory for ScriptedFactory {
    fn build(&self) -> Result<Box<dyn Backend>, BackendError> {
        self.script.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBackend {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedBackend {
    script: Arc<Script>,
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn stream(&self, turns: &[Turn]) -> Result<EventStream, BackendError> {
        self.script.prompts.lock().unwrap().push(turns.to_vec());
        let attempt = self.script.attempts.lock().unwrap().pop_front();
        match attempt {
            Some(Attempt::OpenError(err)) => Err(err),
            Some(Attempt::Events(events)) => Ok(Box::pin(stream::iter(events))),
            Some(Attempt::Live(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            }))),
            None => Err(BackendError::fatal("script exhausted")),
        }
    }
}

/// Factory whose builds always fail, as with a missing API key.
pub struct BrokenFactory;

impl BackendFactory for BrokenFactory {
    fn build(&self) -> Result<Box<dyn Backend>, BackendError> {
        Err(BackendError::fatal("API key variable OPENAI_API_KEY is not set"))
    }
}
