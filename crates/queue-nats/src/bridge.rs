//! Prefetch Bridge over NATS JetStream.
//!
//! A durable, capped stream carries freshly-dispatched jobs; a pull
//! consumer lets each worker process non-blockingly ask for one without
//! polling the database. Completion fan-out rides plain core NATS
//! publish/subscribe on a per-process subject, since it is a fire-and-forget
//! wakeup signal rather than work that must survive a crash.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use futures::StreamExt;
use queue_core::{CompletionNotice, Job, PrefetchBridge, QueueError, QueueResult};
use uuid::Uuid;

use crate::session::NatsListenerSession;

const FETCH_EXPIRES: Duration = Duration::from_millis(50);
/// Jobs older than this are dropped from the stream even if never consumed,
/// so a crashed or disconnected consumer can't wedge storage forever; the
/// Dispatcher's own `jobs` row is always the source of truth.
const MAX_AGE: Duration = Duration::from_secs(15);

pub struct NatsBridge {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    consumer: PullConsumer,
    queue_name: String,
    listener: Arc<NatsListenerSession>,
}

impl NatsBridge {
    /// `channel_id` is this process's own listen channel, passed straight
    /// through to [`NatsListenerSession::spawn`], the same value a
    /// DB-listen deployment would pass to `ListenerSession::spawn`.
    pub async fn connect(nats_url: &str, queue_name: &str, channel_id: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(nats_url).await?;
        let jetstream = jetstream::new(client.clone());

        let stream_name = format!("{queue_name}-prefetch");
        let subject = format!("{queue_name}.prefetch");
        let stream = jetstream
            .get_or_create_stream(StreamConfig {
                name: stream_name.clone(),
                subjects: vec![subject],
                max_age: MAX_AGE,
                ..Default::default()
            })
            .await?;

        let consumer = stream
            .get_or_create_consumer(
                &format!("{queue_name}-prefetch-workers"),
                jetstream::consumer::pull::Config {
                    durable_name: Some(format!("{queue_name}-prefetch-workers")),
                    ..Default::default()
                },
            )
            .await?;

        let listener = NatsListenerSession::spawn(nats_url.to_string(), queue_name, channel_id);

        Ok(Self {
            client,
            jetstream,
            consumer,
            queue_name: queue_name.to_string(),
            listener,
        })
    }
}

#[async_trait::async_trait]
impl PrefetchBridge for NatsBridge {
    async fn publish_job(&self, job: &Job) -> QueueResult<()> {
        let subject = format!("{}.prefetch", self.queue_name);
        let payload = serde_json::to_vec(job)
            .map_err(|err| QueueError::Decode(err.to_string()))?;
        self.jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|err| QueueError::Transport(err.into()))?
            .await
            .map_err(|err| QueueError::Transport(err.into()))?;
        Ok(())
    }

    async fn try_receive_job(&self) -> QueueResult<Option<Job>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(FETCH_EXPIRES)
            .messages()
            .await
            .map_err(|err| QueueError::Transport(err.into()))?;

        match messages.next().await {
            Some(Ok(message)) => {
                let job: Job = serde_json::from_slice(&message.payload)
                    .map_err(|err| QueueError::Decode(err.to_string()))?;
                message
                    .ack()
                    .await
                    .map_err(|err| QueueError::Transport(anyhow::anyhow!("ack failed: {err}")))?;
                Ok(Some(job))
            }
            Some(Err(err)) => Err(QueueError::Transport(err.into())),
            None => Ok(None),
        }
    }

    async fn publish_completion(&self, notice: CompletionNotice) -> QueueResult<()> {
        // No channel means the job was never meant to be waited on over the
        // bus (`listen_channel_id` is optional); nothing to do.
        let Some(channel_id) = &notice.listen_channel_id else {
            return Ok(());
        };
        let subject = crate::session::channel_subject(&self.queue_name, channel_id);
        let payload = serde_json::to_vec(&notice).map_err(|err| QueueError::Decode(err.to_string()))?;
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|err| QueueError::Transport(err.into()))?;
        Ok(())
    }

    fn register_wait(&self, job_id: Uuid) -> Option<tokio::sync::oneshot::Receiver<CompletionNotice>> {
        Some(self.listener.register(job_id))
    }

    fn cancel_wait(&self, job_id: Uuid) {
        self.listener.cancel(job_id);
    }
}
