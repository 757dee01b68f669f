//! UTF-8-safe chunking for a single output stream (stdout or stderr): append incoming bytes to a
//! dangling buffer, and only flush the whole buffer as one `Log` event once it no longer looks
//! like it ends mid-rune. The check here is "does the whole buffer parse as UTF-8", which is
//! stricter than only checking the trailing bytes, and unlike a `String` built via lossy
//! conversion from partially-invalid bytes, it can never produce a `Log.payload` that is not
//! valid UTF-8: bytes that are invalid (not just incomplete) stay dangling rather than ever
//! reaching a subscriber.

use crate::events::EventHub;
use crate::model::{Event, LogOrigin};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct LogWriter {
    hub: Arc<EventHub>,
    origin: LogOrigin,
    dangling: Vec<u8>,
    /// A byte-identical copy of every flushed payload, forwarded to the build's logs sink
    /// websocket client if one is connected.
    sink: Option<mpsc::UnboundedSender<String>>,
}

impl LogWriter {
    pub fn new(hub: Arc<EventHub>, origin: LogOrigin, sink: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            hub,
            origin,
            dangling: Vec::new(),
            sink,
        }
    }

    /// Appends `data` to the dangling buffer and, if the result is valid UTF-8, emits it as a
    /// single `Log` event and clears the buffer. Otherwise holds everything for the next call.
    pub async fn write(&mut self, data: &[u8]) {
        self.dangling.extend_from_slice(data);

        let text = match std::str::from_utf8(&self.dangling) {
            Ok(text) => text.to_string(),
            Err(_) => return,
        };

        self.dangling.clear();
        self.emit(text).await;
    }

    /// Flushes whatever remains in the dangling buffer at stream end, lossily, so that a
    /// process that ends mid-sequence (a bug on its part, not ours) never silently drops output.
    pub async fn finish(&mut self) {
        if self.dangling.is_empty() {
            return;
        }

        let text = String::from_utf8_lossy(&self.dangling).into_owned();
        self.dangling.clear();
        self.emit(text).await;
    }

    async fn emit(&mut self, payload: String) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(payload.clone());
        }

        self.hub
            .emit_event(Event::Log {
                payload,
                origin: self.origin.clone(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogSource;

    fn origin() -> LogOrigin {
        LogOrigin {
            source: LogSource::Stdout,
            id: "1".into(),
        }
    }

    #[tokio::test]
    async fn flushes_clean_utf8_immediately() {
        let hub = Arc::new(EventHub::new("b", 16));
        let mut sub = hub.subscribe().await;
        let mut writer = LogWriter::new(hub.clone(), origin(), None);

        writer.write(b"hello").await;

        assert_eq!(
            sub.next().await,
            Some(Event::Log {
                payload: "hello".into(),
                origin: origin(),
            })
        );
    }

    #[tokio::test]
    async fn holds_bytes_that_split_a_multibyte_character() {
        let hub = Arc::new(EventHub::new("b", 16));
        let mut sub = hub.subscribe().await;
        let mut writer = LogWriter::new(hub.clone(), origin(), None);

        // "é" is 0xC3 0xA9 in UTF-8; split across two writes.
        writer.write(&[0xC3]).await;
        writer.write(&[0xA9]).await;

        assert_eq!(
            sub.next().await,
            Some(Event::Log {
                payload: "é".into(),
                origin: origin(),
            })
        );
    }

    #[tokio::test]
    async fn finish_lossily_flushes_a_truncated_tail() {
        let hub = Arc::new(EventHub::new("b", 16));
        let mut sub = hub.subscribe().await;
        let mut writer = LogWriter::new(hub.clone(), origin(), None);

        writer.write(&[0xC3]).await;
        writer.finish().await;

        match sub.next().await {
            Some(Event::Log { payload, .. }) => assert!(payload.contains('\u{FFFD}')),
            other => panic!("expected a lossily-flushed Log event, got {other:?}"),
        }
    }
}
