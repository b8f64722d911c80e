//! Adapts a backend event stream into cancellable plain-text deltas.

use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::error::BackendError;
use crate::llm::{Backend, BackendEvent, BackendFactory, EventStream, Turn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Owns one connection's backend handle. The handle is built on first use
/// and replaced, never shared, when credentials expire.
pub struct StreamingBridge {
    factory: Arc<dyn BackendFactory>,
    backend: Option<Box<dyn Backend>>,
}

impl StreamingBridge {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            backend: None,
        }
    }

    /// Open a stream over `turns`. A credential-expiry failure before the
    /// first delta rebuilds the backend and retries once; anything else is
    /// returned as is.
    pub async fn generate_stream(
        &mut self,
        turns: &[Turn],
        cancel: CancelSignal,
    ) -> Result<DeltaStream, BackendError> {
        let mut rebuilt = false;
        loop {
            let backend = self.backend()?;
            match open(backend, turns, cancel.clone()).await {
                Err(err) if err.is_transient_auth() && !rebuilt => {
                    tracing::warn!(error = %err, "Backend credentials expired, rebuilding client");
                    rebuilt = true;
                    self.backend = Some(self.factory.build()?);
                }
                res => return res,
            }
        }
    }

    fn backend(&mut self) -> Result<&dyn Backend, BackendError> {
        if self.backend.is_none() {
            self.backend = Some(self.factory.build()?);
        }
        self.backend
            .as_deref()
            .ok_or_else(|| BackendError::fatal("backend unavailable"))
    }
}

async fn open(backend: &dyn Backend, turns: &[Turn], cancel: CancelSignal) -> Result<DeltaStream, BackendError> {
    let events = backend.stream(turns).await?;
    let mut stream = DeltaStream {
        events,
        pending: None,
        cancel,
        prompt_tokens: 0,
        chunks: 0,
    };

    // Read up to the first visible delta so start-of-stream failures surface
    // here, where they can still be retried.
    while !stream.cancel.is_set() {
        match stream.events.next().await {
            Some(Ok(BackendEvent::Delta(text))) => {
                stream.pending = Some(text);
                break;
            }
            Some(Ok(event)) => stream.observe(event),
            Some(Err(err)) => return Err(err),
            None => break,
        }
    }
    Ok(stream)
}

/// Text deltas of one backend stream.
pub struct DeltaStream {
    events: EventStream,
    pending: Option<String>,
    cancel: CancelSignal,
    prompt_tokens: u32,
    chunks: u32,
}

impl DeltaStream {
    /// Next visible delta. Returns `None` when the backend is exhausted or the
    /// cancel signal is set. Cancel safe: dropping the future loses nothing.
    pub async fn next(&mut self) -> Option<Result<String, BackendError>> {
        loop {
            if self.cancel.is_set() {
                return None;
            }
            let event = match self.pending.take() {
                Some(text) => BackendEvent::Delta(text),
                None => match self.events.next().await? {
                    Ok(event) => event,
                    Err(err) => return Some(Err(err)),
                },
            };
            match event {
                BackendEvent::Delta(text) => {
                    if self.cancel.is_set() {
                        return None;
                    }
                    self.chunks += 1;
                    return Some(Ok(text));
                }
                other => self.observe(other),
            }
        }
    }

    fn observe(&mut self, event: BackendEvent) {
        if let BackendEvent::Usage { prompt_tokens, completion_tokens } = event {
            tracing::debug!(prompt_tokens, completion_tokens, "Backend reported usage");
            self.prompt_tokens = prompt_tokens;
        }
    }

    pub fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Role;
    use crate::testing::{ScriptedFactory, delta};

    fn turns() -> Vec<Turn> {
        vec![Turn { role: Role::User, content: "hello".into(), timestamp: 1.0 }]
    }

    async fn collect(stream: &mut DeltaStream) -> Result<Vec<String>, BackendError> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn yields_visible_deltas_only() {
        let factory = ScriptedFactory::new().with_events(vec![
            Ok(BackendEvent::Other),
            delta("Hel"),
            Ok(BackendEvent::Other),
            delta("lo"),
            Ok(BackendEvent::Usage { prompt_tokens: 9, completion_tokens: 2 }),
        ]);
        let mut bridge = StreamingBridge::new(factory.arc());

        let mut stream = bridge.generate_stream(&turns(), CancelSignal::new()).await.unwrap();
        assert_eq!(collect(&mut stream).await.unwrap(), vec!["Hel", "lo"]);
        assert_eq!(stream.usage(), Usage { prompt_tokens: 9, completion_tokens: 2 });
        assert_eq!(factory.prompts(), vec![turns()]);
    }

    #[tokio::test]
    async fn retries_once_when_open_hits_expired_credentials() {
        let factory = ScriptedFactory::new()
            .with_open_error(BackendError::TransientAuth("ExpiredToken".into()))
            .with_events(vec![delta("a"), delta("b")]);
        let mut bridge = StreamingBridge::new(factory.arc());

        let mut stream = bridge.generate_stream(&turns(), CancelSignal::new()).await.unwrap();
        assert_eq!(collect(&mut stream).await.unwrap(), vec!["a", "b"]);
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn retries_when_first_event_is_expired_credentials() {
        let factory = ScriptedFactory::new()
            .with_events(vec![
                Ok(BackendEvent::Other),
                Err(BackendError::TransientAuth("ExpiredTokenException".into())),
            ])
            .with_events(vec![delta("x"), delta("y"), delta("z")]);
        let mut bridge = StreamingBridge::new(factory.arc());

        let mut stream = bridge.generate_stream(&turns(), CancelSignal::new()).await.unwrap();
        assert_eq!(collect(&mut stream).await.unwrap(), vec!["x", "y", "z"]);
        assert_eq!(stream.usage().completion_tokens, 3);
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn second_expiry_propagates() {
        let expired = BackendError::TransientAuth("ExpiredToken".into());
        let factory = ScriptedFactory::new()
            .with_open_error(expired.clone())
            .with_open_error(expired.clone())
            .with_events(vec![delta("never")]);
        let mut bridge = StreamingBridge::new(factory.arc());

        let err = bridge.generate_stream(&turns(), CancelSignal::new()).await.err().unwrap();
        assert_eq!(err, expired);
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let factory = ScriptedFactory::new()
            .with_open_error(BackendError::fatal("model not found"))
            .with_events(vec![delta("never")]);
        let mut bridge = StreamingBridge::new(factory.arc());

        let err = bridge.generate_stream(&turns(), CancelSignal::new()).await.err().unwrap();
        assert_eq!(err, BackendError::fatal("model not found"));
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test]
    async fn expiry_after_output_is_not_retried() {
        let factory = ScriptedFactory::new()
            .with_events(vec![delta("partial"), Err(BackendError::TransientAuth("ExpiredToken".into()))])
            .with_events(vec![delta("never")]);
        let mut bridge = StreamingBridge::new(factory.arc());

        let mut stream = bridge.generate_stream(&turns(), CancelSignal::new()).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok("partial".to_string())));
        assert!(matches!(stream.next().await, Some(Err(BackendError::TransientAuth(_)))));
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test]
    async fn stops_once_cancelled() {
        let factory = ScriptedFactory::new().with_events(vec![delta("one"), delta("two"), delta("three")]);
        let mut bridge = StreamingBridge::new(factory.arc());
        let cancel = CancelSignal::new();

        let mut stream = bridge.generate_stream(&turns(), cancel.clone()).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok("one".to_string())));
        cancel.set();
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.usage().completion_tokens, 1);
    }

    #[tokio::test]
    async fn bridge_is_reusable_across_streams() {
        let factory = ScriptedFactory::new()
            .with_open_error(BackendError::TransientAuth("ExpiredToken".into()))
            .with_events(vec![delta("first")])
            .with_events(vec![delta("second")]);
        let mut bridge = StreamingBridge::new(factory.arc());

        let mut s1 = bridge.generate_stream(&turns(), CancelSignal::new()).await.unwrap();
        assert_eq!(collect(&mut s1).await.unwrap(), vec!["first"]);
        let mut s2 = bridge.generate_stream(&turns(), CancelSignal::new()).await.unwrap();
        assert_eq!(collect(&mut s2).await.unwrap(), vec!["second"]);
        assert_eq!(factory.builds(), 2);
    }
}
