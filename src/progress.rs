//! Pull progress protocol.
//!
//! A caller passes a [`ProgressSink`] wrapping the sending half of a small
//! `tokio::sync::mpsc` channel. Every update is sent with `try_send`: when
//! the channel is full, the update is dropped. The stream always ends with
//! [`PullProgress::Done`], sent even after a failure, so consumers can loop
//! until they see it:
//!
//! ```rust,ignore
//! let (tx, mut rx) = tokio::sync::mpsc::channel(8);
//! let pull = registry.pull("library/alpine:latest", Some(ProgressSink::new(tx)));
//! tokio::spawn(async move {
//!     while let Some(p) = rx.recv().await {
//!         match p {
//!             PullProgress::Update { completion, .. } => println!("{}%", completion),
//!             PullProgress::Done => break,
//!         }
//!     }
//! });
//! pull.await?;
//! ```

use tokio::sync::mpsc;

/// One message on a progress stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullProgress {
    /// Completion percentage, optionally with an error or status note.
    Update {
        completion: u8,
        error: Option<String>,
    },
    /// End of stream.
    Done,
}

impl PullProgress {
    pub fn completion(&self) -> Option<u8> {
        match self {
            PullProgress::Update { completion, .. } => Some(*completion),
            PullProgress::Done => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            PullProgress::Update { error, .. } => error.as_deref(),
            PullProgress::Done => None,
        }
    }
}

/// Best-effort sender of progress updates. An empty sink discards them.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<PullProgress>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<PullProgress>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Reports a completion percentage.
    pub fn push(&self, completion: u8) {
        self.send(PullProgress::Update {
            completion,
            error: None,
        });
    }

    /// Reports a completion percentage with an error or status note.
    pub fn push_error(&self, completion: u8, error: impl ToString) {
        self.send(PullProgress::Update {
            completion,
            error: Some(error.to_string()),
        });
    }

    /// Terminates the stream.
    ///
    /// Unlike updates, the terminator is not dropped on a full channel: it
    /// is handed to a task that waits for room.
    pub fn done(&self) {
        let Some(tx) = &self.tx else { return };
        if let Err(mpsc::error::TrySendError::Full(done)) = tx.try_send(PullProgress::Done)
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let tx = tx.clone();
            handle.spawn(async move {
                let _ = tx.send(done).await;
            });
        }
    }

    fn send(&self, update: PullProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(update);
        }
    }
}
