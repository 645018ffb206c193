//! In-page SCORM runtime adapter.
//!
//! Content talks to [`RuntimeApi`] synchronously; commits are handed to a
//! background worker that delivers them through a [`CommitTransport`] and
//! retries on the auto-commit interval until they are acknowledged.

pub mod api;
pub mod commit;
pub mod error;

pub use api::RuntimeApi;
pub use commit::{CommitTransport, HttpTransport, TransportError};
pub use error::CmiError;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::time::Duration;
use uuid::Uuid;

use crate::{cmi::ScormVersion, models::PriorProgress};

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_auto_commit")]
    pub auto_commit_interval: Duration,
    /// Leading SetValue calls during which an empty write cannot wipe a
    /// restored bookmark. Zero disables the guard.
    #[serde(default = "default_protection_window")]
    pub resume_protection_window: usize,
    /// Extra delivery attempts for the final commit after Terminate.
    #[serde(default = "default_final_retries")]
    pub final_commit_retries: u32,
}

fn default_auto_commit() -> Duration {
    Duration::from_secs(30)
}

fn default_protection_window() -> usize {
    5
}

fn default_final_retries() -> u32 {
    3
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            auto_commit_interval: default_auto_commit(),
            resume_protection_window: default_protection_window(),
            final_commit_retries: default_final_retries(),
        }
    }
}

/// Everything the host page embeds for one launch.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LaunchConfig {
    pub session_id: Uuid,
    pub scorm_version: ScormVersion,
    pub learner_id: String,
    #[serde(default)]
    pub learner_name: Option<String>,
    pub sync_url: String,
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde(default)]
    pub prior: Option<PriorProgress>,
    #[serde(default)]
    pub settings: RuntimeSettings,
}
