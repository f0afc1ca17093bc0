//! Command/response correlation.
//!
//! Each asynchronous operation registers a oneshot sender under its
//! [`OperationKind`]. Device replies resolve the oldest sender of their kind,
//! so replies of one kind complete strictly in issue order. On disconnect every
//! outstanding sender is failed in one sweep.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::SessionError;

/// Kinds of asynchronous operation; at most one of each is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    StartStream,
    StopStream,
    LoadConfig,
    Update,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Connect,
        OperationKind::StartStream,
        OperationKind::StopStream,
        OperationKind::LoadConfig,
        OperationKind::Update,
    ];

    fn index(self) -> usize {
        match self {
            OperationKind::Connect => 0,
            OperationKind::StartStream => 1,
            OperationKind::StopStream => 2,
            OperationKind::LoadConfig => 3,
            OperationKind::Update => 4,
        }
    }

    /// Operations that move the session between states.
    pub fn is_state_changing(self) -> bool {
        !matches!(self, OperationKind::LoadConfig)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::StartStream => "start_stream",
            OperationKind::StopStream => "stop_stream",
            OperationKind::LoadConfig => "load_config",
            OperationKind::Update => "update",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

/// Per-kind FIFO of waiting completions
pub(crate) struct Correlator {
    queues: [VecDeque<Reply>; 5],
    runtime: Handle,
}

impl Correlator {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            queues: Default::default(),
            runtime,
        }
    }

    pub(crate) fn register(&mut self, kind: OperationKind) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.queues[kind.index()].push_back(tx);
        trace!("registered {} completion", kind);
        Completion::pending(rx, self.runtime.clone())
    }

    pub(crate) fn is_pending(&self, kind: OperationKind) -> bool {
        !self.queues[kind.index()].is_empty()
    }

    pub(crate) fn pending(&self) -> impl Iterator<Item = OperationKind> + '_ {
        OperationKind::ALL
            .into_iter()
            .filter(|kind| self.is_pending(*kind))
    }

    /// Resolve the oldest completion of `kind`. Returns false when nothing
    /// was waiting, so the caller can report the reply as unmatched.
    pub(crate) fn resolve(&mut self, kind: OperationKind, result: Result<(), SessionError>) -> bool {
        let Some(tx) = self.queues[kind.index()].pop_front() else {
            return false;
        };
        if tx.send(result).is_err() {
            debug!("{} completion was dropped before it resolved", kind);
        }
        true
    }

    /// Fail every outstanding completion. Returns how many were failed.
    pub(crate) fn fail_all(&mut self, error: impl Fn(OperationKind) -> SessionError) -> usize {
        let mut failed = 0;
        for kind in OperationKind::ALL {
            while let Some(tx) = self.queues[kind.index()].pop_front() {
                let _ = tx.send(Err(error(kind)));
                failed += 1;
            }
        }
        failed
    }
}

enum State {
    Waiting(oneshot::Receiver<Result<(), SessionError>>),
    Ready(Option<Result<(), SessionError>>),
}

/// Result of an asynchronous session operation.
///
/// Await it, or hand it a callback with [`Completion::on_complete`]. It
/// resolves exactly once; if the session drops the sender without a result
/// the completion resolves with [`SessionError::Unknown`].
#[must_use = "a Completion does nothing unless awaited or given a callback"]
pub struct Completion {
    state: State,
    runtime: Handle,
}

impl Completion {
    fn pending(rx: oneshot::Receiver<Result<(), SessionError>>, runtime: Handle) -> Self {
        Self {
            state: State::Waiting(rx),
            runtime,
        }
    }

    /// A completion that has already resolved.
    pub(crate) fn ready(result: Result<(), SessionError>, runtime: Handle) -> Self {
        Self {
            state: State::Ready(Some(result)),
            runtime,
        }
    }

    /// Run `f` with the result on the session's runtime.
    pub fn on_complete<F>(self, f: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<(), SessionError>) + Send + 'static,
    {
        let runtime = self.runtime.clone();
        runtime.spawn(async move { f(self.await) })
    }
}

impl Future for Completion {
    type Output = Result<(), SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            State::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(SessionError::Unknown(
                        "operation ended without a result".to_string(),
                    ))
                })
            }),
            State::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(SessionError::Unknown("completion polled after it resolved".to_string()))
            })),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Waiting(_) => "waiting",
            State::Ready(_) => "ready",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}
