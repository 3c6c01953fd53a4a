//! Construction options for a `Watcher` and the workers it spawns.
//!
//! Both types are plain serde structs so the CLI can load them from a JSON
//! file. Nothing here is validated; `WatcherBuilder::build` does that.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BATCH_LIMIT: usize = 1;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration shared by every worker of one watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    /// Shell command each worker runs.
    pub command: String,

    /// Paths opened up (0o777) before each batch and handed to the workers.
    #[serde(default)]
    pub volumes: Vec<PathBuf>,

    #[serde(
        default,
        rename = "maxJobDurationSeconds",
        with = "optional_seconds"
    )]
    pub max_job_duration: Option<Duration>,
}

impl WorkerOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            volumes: Vec::new(),
            max_job_duration: None,
        }
    }

    pub fn with_volumes<I, P>(mut self, volumes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.volumes = volumes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_job_duration(mut self, duration: Duration) -> Self {
        self.max_job_duration = Some(duration);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherOptions {
    pub queue_url: Option<String>,

    pub worker_options: Option<WorkerOptions>,

    /// Upper bound on messages requested per poll.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    #[serde(
        default = "default_poll_timeout",
        rename = "pollTimeoutSeconds",
        with = "seconds"
    )]
    pub poll_timeout: Duration,
}

impl WatcherOptions {
    pub fn new(queue_url: impl Into<String>, worker_options: WorkerOptions) -> Self {
        Self {
            queue_url: Some(queue_url.into()),
            worker_options: Some(worker_options),
            ..Self::default()
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            queue_url: None,
            worker_options: None,
            batch_limit: DEFAULT_BATCH_LIMIT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

fn default_batch_limit() -> usize {
    DEFAULT_BATCH_LIMIT
}

fn default_poll_timeout() -> Duration {
    DEFAULT_POLL_TIMEOUT
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|secs| secs.map(Duration::from_secs))
    }
}
