//! Typed send helpers over an open realtime channel.

use crate::error::ConnectionError;
use oracle_realtime_types::{ClientEvent, Item, SessionConfig};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::{self, error::TrySendError};

type SendObserver = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Converts a sample count into whole milliseconds, rounding down.
pub fn samples_to_ms(samples: u64, sample_rate: u32) -> u32 {
    if sample_rate == 0 {
        return 0;
    }
    (samples.saturating_mul(1000) / u64::from(sample_rate)) as u32
}

/// A cloneable handle for sending events on the current connection.
///
/// Every event that is accepted by the channel is also handed to the optional
/// observer, which is how outbound traffic reaches the event log.
#[derive(Clone)]
pub struct RealtimeClient {
    outbound: mpsc::Sender<ClientEvent>,
    observer: Option<SendObserver>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("closed", &self.outbound.is_closed())
            .finish()
    }
}

impl RealtimeClient {
    pub fn new(outbound: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            outbound,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl Fn(&ClientEvent) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    fn observe(&self, event: &ClientEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    pub async fn send(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?;
        self.observe(&event);
        permit.send(event);
        Ok(())
    }

    /// Sends without waiting for queue space; used on the audio path where a
    /// full queue means the frame is dropped.
    pub fn try_send(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        let permit = self.outbound.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => ConnectionError::ChannelFull,
            TrySendError::Closed(()) => ConnectionError::ChannelClosed,
        })?;
        self.observe(&event);
        permit.send(event);
        Ok(())
    }

    pub async fn update_session(&self, session: SessionConfig) -> Result<(), ConnectionError> {
        self.send(ClientEvent::SessionUpdate { session }).await
    }

    /// Appends one base64 PCM16 frame to the server's input buffer.
    pub fn append_input_audio(&self, audio: String) -> Result<(), ConnectionError> {
        self.try_send(ClientEvent::InputAudioBufferAppend { audio })
    }

    pub async fn commit_input_audio(&self) -> Result<(), ConnectionError> {
        self.send(ClientEvent::InputAudioBufferCommit).await
    }

    pub async fn create_response(&self) -> Result<(), ConnectionError> {
        self.send(ClientEvent::ResponseCreate).await
    }

    /// Adds a user text turn and asks the model to answer it.
    pub async fn send_user_text(&self, text: &str) -> Result<(), ConnectionError> {
        self.send(ClientEvent::ConversationItemCreate {
            previous_item_id: None,
            item: Item::user_text(text),
        })
        .await?;
        self.create_response().await
    }

    /// Cancels the in-flight response and truncates the assistant item at the
    /// sample the listener actually reached.
    pub async fn cancel_response(
        &self,
        item_id: &str,
        content_index: u32,
        sample_offset: u64,
        sample_rate: u32,
    ) -> Result<(), ConnectionError> {
        self.send(ClientEvent::ResponseCancel).await?;
        self.send(ClientEvent::ConversationItemTruncate {
            item_id: item_id.to_string(),
            content_index,
            audio_end_ms: samples_to_ms(sample_offset, sample_rate),
        })
        .await
    }

    pub async fn delete_item(&self, item_id: &str) -> Result<(), ConnectionError> {
        self.send(ClientEvent::ConversationItemDelete {
            item_id: item_id.to_string(),
        })
        .await
    }

    /// Returns a tool result to the model and lets it continue.
    pub async fn submit_function_output(&self, call_id: &str, output: &str) -> Result<(), ConnectionError> {
        self.send(ClientEvent::ConversationItemCreate {
            previous_item_id: None,
            item: Item::function_call_output(call_id, output),
        })
        .await?;
        self.create_response().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_samples_to_ms() {
        assert_eq!(samples_to_ms(24_000, 24_000), 1000);
        assert_eq!(samples_to_ms(12_345, 24_000), 514);
        assert_eq!(samples_to_ms(0, 24_000), 0);
        assert_eq!(samples_to_ms(100, 0), 0);
    }

    #[tokio::test]
    async fn test_cancel_response_sends_cancel_then_truncate() {
        let (tx, mut rx) = mpsc::channel(8);
        let client = RealtimeClient::new(tx);
        client.cancel_response("item_7", 0, 36_000, 24_000).await.unwrap();

        assert_eq!(rx.recv().await, Some(ClientEvent::ResponseCancel));
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::ConversationItemTruncate {
                item_id: "item_7".into(),
                content_index: 0,
                audio_end_ms: 1500,
            })
        );
    }

    #[tokio::test]
    async fn test_observer_sees_sent_events() {
        let (tx, _rx) = mpsc::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let client = RealtimeClient::new(tx).with_observer(move |event| {
            sink.lock().unwrap().push(event.kind());
        });

        client.send_user_text("hello").await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["conversation.item.create", "response.create"]
        );
    }

    #[test]
    fn test_observer_skips_dropped_frames() {
        let (tx, _rx) = mpsc::channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let client = RealtimeClient::new(tx).with_observer(move |event| {
            sink.lock().unwrap().push(event.kind());
        });

        client.append_input_audio("AAAA".into()).unwrap();
        assert!(client.append_input_audio("BBBB".into()).is_err());
        assert_eq!(*seen.lock().unwrap(), vec!["input_audio_buffer.append"]);
    }

    #[test]
    fn test_try_send_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let client = RealtimeClient::new(tx);
        client.append_input_audio("AAAA".into()).unwrap();
        assert!(matches!(
            client.append_input_audio("AAAA".into()),
            Err(ConnectionError::ChannelFull)
        ));
        drop(rx);
        assert!(matches!(
            client.append_input_audio("AAAA".into()),
            Err(ConnectionError::ChannelClosed)
        ));
    }
}
