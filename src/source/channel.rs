use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::pipeline::RawEvent;
use crate::source::{LogSource, SourceError, SourceResult};

/// Log source fed through an in-process channel
///
/// Useful for embedding the pipeline behind another transport and for
/// driving it deterministically. When every handle is dropped the source
/// reports `SourceError::Closed`.
pub struct ChannelSource {
    name: String,
    events: mpsc::Receiver<SourceResult<RawEvent>>,
}

/// Producer side of a `ChannelSource`
#[derive(Clone)]
pub struct ChannelSourceHandle {
    sender: mpsc::Sender<SourceResult<RawEvent>>,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, ChannelSourceHandle) {
        let (sender, events) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                events,
            },
            ChannelSourceHandle { sender },
        )
    }
}

impl ChannelSourceHandle {
    /// Push an event; waits while the channel is full
    pub async fn send(&self, event: RawEvent) -> SourceResult<()> {
        self.sender
            .send(Ok(event))
            .await
            .map_err(|_| SourceError::Closed)
    }

    /// Make the next pull fail with the given error
    pub async fn fail(&self, error: SourceError) -> SourceResult<()> {
        self.sender
            .send(Err(error))
            .await
            .map_err(|_| SourceError::Closed)
    }
}

#[async_trait]
impl LogSource for ChannelSource {
    async fn next_event(&mut self) -> SourceResult<RawEvent> {
        self.events.recv().await.unwrap_or(Err(SourceError::Closed))
    }

    async fn close(&mut self) {
        self.events.close();
    }

    fn describe(&self) -> String {
        format!("channel:{}", self.name)
    }
}
