//! Scripted adapter for tests. Records every input queue it was handed so
//! replay behaviour can be asserted, and plays back a fixed behaviour.

#![allow(clippy::unwrap_used)]

use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterKind;
use crate::adapters::ModelAdapter;
use crate::classifier::ClassifiedError;
use crate::models::AdapterContext;
use crate::models::AdapterEvent;
use crate::models::AdapterMessage;
use crate::models::AdapterResult;
use crate::prompt::ComposedPrompt;

#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Emit each delta as a `working` chunk, then complete with their
    /// concatenation.
    Stream { deltas: Vec<String> },
    /// Fail immediately with the given error.
    Fail(ClassifiedError),
    /// Block until the cancellation token fires, then report `cancelled`.
    HangUntilCancelled,
}

pub struct FakeAdapter {
    kind: AdapterKind,
    behavior: FakeBehavior,
    can_handle: bool,
    runs: AtomicUsize,
    seen_input: Mutex<Vec<Vec<AdapterMessage>>>,
}

impl FakeAdapter {
    pub fn new(kind: AdapterKind, behavior: FakeBehavior) -> Self {
        Self {
            kind,
            behavior,
            can_handle: true,
            runs: AtomicUsize::new(0),
            seen_input: Mutex::new(Vec::new()),
        }
    }

    /// An adapter whose `can_handle` always declines.
    pub fn declining(kind: AdapterKind) -> Self {
        let mut adapter = Self::new(kind, FakeBehavior::Stream { deltas: Vec::new() });
        adapter.can_handle = false;
        adapter
    }

    /// Number of times `run` was invoked.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// The input queues observed across runs, oldest first.
    pub fn seen_input(&self) -> Vec<Vec<AdapterMessage>> {
        self.seen_input.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelAdapter for FakeAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn can_handle(&self, _ctx: &AdapterContext) -> bool {
        self.can_handle
    }

    async fn run(
        &self,
        _prompt: &ComposedPrompt,
        input: &[AdapterMessage],
        _ctx: &AdapterContext,
        events: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, ClassifiedError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen_input.lock().unwrap().push(input.to_vec());

        match &self.behavior {
            FakeBehavior::Fail(err) => Err(err.clone()),
            FakeBehavior::HangUntilCancelled => {
                cancel.cancelled().await;
                Err(ClassifiedError::cancelled())
            }
            FakeBehavior::Stream { deltas } => {
                let started = std::time::Instant::now();
                let _ = events.send(AdapterEvent::Started).await;
                let mut full_text = String::new();
                for delta in deltas {
                    if cancel.is_cancelled() {
                        return Err(ClassifiedError::cancelled());
                    }
                    full_text.push_str(delta);
                    let _ = events
                        .send(AdapterEvent::Delta {
                            text: delta.clone(),
                        })
                        .await;
                }
                let _ = events
                    .send(AdapterEvent::Completed {
                        full_text: full_text.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
                Ok(AdapterResult {
                    full_text,
                    ..AdapterResult::default()
                })
            }
        }
    }
}
