use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::broadcast;
use updater_api::{constants::PROGRESS_BUFFER_CAP, job::Job};

/// One event on the progress stream of a job.
#[derive(Clone, Debug)]
pub enum UpdateEvent {
    /// A fresh snapshot of the job after a status transition.
    Status(Box<Job>),
    /// One log line.
    Log(String),
    /// Final snapshot; no further events follow for this job.
    Complete(Box<Job>),
}

impl UpdateEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::Status(_) => "status",
            UpdateEvent::Log(_) => "log",
            UpdateEvent::Complete(_) => "complete",
        }
    }

    /// JSON payload of the event.
    pub fn payload(&self) -> String {
        match self {
            UpdateEvent::Status(job) | UpdateEvent::Complete(job) => {
                serde_json::to_string(job).unwrap_or_else(|_| "{}".into())
            }
            UpdateEvent::Log(line) => {
                serde_json::to_string(&serde_json::json!({ "line": line }))
                    .unwrap_or_else(|_| "{}".into())
            }
        }
    }
}

/// Single-writer, multi-reader broadcast of job progress, scoped per job id.
///
/// Each subscriber gets a bounded buffer; a subscriber that lags further than
/// the buffer is disconnected rather than stalling the engine.
#[derive(Default)]
pub struct ProgressBus {
    topics: Mutex<HashMap<String, broadcast::Sender<UpdateEvent>>>,
}

impl ProgressBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sender side for a job, created on first use. The engine is the only
    /// caller that writes to it.
    pub fn publisher(&self, job_id: &str) -> broadcast::Sender<UpdateEvent> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(PROGRESS_BUFFER_CAP).0)
            .clone()
    }

    /// Subscribe to a job's stream. Returns `None` for a job this process
    /// never published events for.
    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<UpdateEvent>> {
        let topics = self.topics.lock().unwrap();
        topics.get(job_id).map(|sender| sender.subscribe())
    }

    /// Drop the topic of a finished job. Existing subscribers keep draining
    /// their buffers; new subscribers get `None`.
    pub fn retire(&self, job_id: &str) {
        self.topics.lock().unwrap().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use updater_api::job::JobStatus;

    use super::*;

    fn sample_job() -> Job {
        Job::new("bus test", 1, true)
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let bus = ProgressBus::new();
        let publisher = bus.publisher("job-1");
        let mut subscriber = bus.subscribe("job-1").unwrap();

        let mut done = sample_job();
        done.status = JobStatus::Completed;

        publisher.send(UpdateEvent::Status(Box::new(sample_job()))).unwrap();
        publisher.send(UpdateEvent::Log("copying files".into())).unwrap();
        publisher.send(UpdateEvent::Complete(Box::new(done))).unwrap();

        assert!(matches!(subscriber.recv().await.unwrap(), UpdateEvent::Status(_)));
        match subscriber.recv().await.unwrap() {
            UpdateEvent::Log(line) => assert_eq!(line, "copying files"),
            other => panic!("expected log, got {other:?}"),
        }
        assert!(matches!(
            subscriber.recv().await.unwrap(),
            UpdateEvent::Complete(_)
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_not_blocking() {
        let bus = ProgressBus::new();
        let publisher = bus.publisher("job-2");
        let mut subscriber = bus.subscribe("job-2").unwrap();

        // Overflow the per-subscriber buffer; the sender never blocks.
        for i in 0..(PROGRESS_BUFFER_CAP + 10) {
            publisher.send(UpdateEvent::Log(format!("line {i}"))).unwrap();
        }

        // The lagging subscriber observes the overflow instead of stale data.
        assert!(matches!(
            subscriber.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_topics_are_scoped_per_job() {
        let bus = ProgressBus::new();
        let _publisher = bus.publisher("job-a");
        assert!(bus.subscribe("job-a").is_some());
        assert!(bus.subscribe("job-b").is_none());

        bus.retire("job-a");
        assert!(bus.subscribe("job-a").is_none());
    }

    #[test]
    fn test_event_names_and_payloads() {
        let event = UpdateEvent::Log("hello".into());
        assert_eq!(event.name(), "log");
        assert_eq!(event.payload(), r#"{"line":"hello"}"#);

        let event = UpdateEvent::Status(Box::new(sample_job()));
        assert_eq!(event.name(), "status");
        assert!(event.payload().contains("\"job_id\""));
    }
}
