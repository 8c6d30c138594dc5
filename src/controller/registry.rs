use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::shared::error::{LabError, LabResult};
use crate::shared::models::state_helpers::can_transition_to;
use crate::shared::models::{
    ActivityKind, IdeType, LabConfig, LabEnvironment, LabMetrics, LabStatus,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for observers. Receivers that fall behind miss events;
/// the registry itself never blocks on them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LabEvent {
    StatusChanged {
        lab_id: String,
        from: LabStatus,
        to: LabStatus,
        at: DateTime<Utc>,
    },
    TimeoutWarning {
        lab_id: String,
        deadline: &'static str,
        remaining_seconds: i64,
    },
}

/// What a stop request should do, decided atomically against current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// RUNNING or PAUSED: hand the lab to the reaper.
    Enqueue,
    /// CREATING or STARTING: recorded, torn down once provisioning finishes.
    Deferred,
    /// Already stopping or terminal.
    AlreadyHandled,
}

/// Authoritative store of every lab and its state machine.
pub struct SessionRegistry {
    labs: RwLock<HashMap<String, LabEnvironment>>,
    events: broadcast::Sender<LabEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            labs: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LabEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: LabEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Register a new lab in CREATING and return its id.
    pub async fn create(&self, student_id: &str, course_id: &str, config: LabConfig) -> String {
        let id = Uuid::new_v4().to_string();
        let lab = LabEnvironment::new(
            id.clone(),
            student_id.to_string(),
            course_id.to_string(),
            config,
        );
        info!(
            "Lab {} created for student {} in course {}",
            id, student_id, course_id
        );
        self.labs.write().await.insert(id.clone(), lab);
        id
    }

    pub async fn get(&self, id: &str) -> LabResult<LabEnvironment> {
        self.labs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LabError::SessionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<LabEnvironment> {
        let mut labs: Vec<_> = self.labs.read().await.values().cloned().collect();
        labs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        labs
    }

    /// Every lab not yet in a terminal state.
    pub async fn list_active(&self) -> Vec<LabEnvironment> {
        let mut labs: Vec<_> = self
            .labs
            .read()
            .await
            .values()
            .filter(|lab| !lab.status.is_terminal())
            .cloned()
            .collect();
        labs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        labs
    }

    /// Compare-and-swap the lab's status.
    ///
    /// Succeeds only when the current status is one of `from`. Entering a
    /// terminal state finalizes the lab's metrics with `reason`.
    pub async fn transition(
        &self,
        id: &str,
        from: &[LabStatus],
        to: LabStatus,
        reason: Option<&str>,
    ) -> LabResult<LabEnvironment> {
        let mut labs = self.labs.write().await;
        let lab = labs
            .get_mut(id)
            .ok_or_else(|| LabError::SessionNotFound(id.to_string()))?;

        let actual = lab.status;
        if !from.contains(&actual) || !can_transition_to(actual, to) {
            debug!("Lab {} CAS {:?} -> {} lost (status {})", id, from, to, actual);
            return Err(LabError::InvalidTransition {
                id: id.to_string(),
                actual,
                to,
            });
        }

        let now = Utc::now();
        lab.status = to;
        lab.updated_at = now;
        if let Some(reason) = reason {
            lab.status_message = Some(reason.to_string());
        }
        if to.is_terminal() && lab.metrics.is_none() {
            lab.metrics = Some(LabMetrics {
                duration_seconds: lab.age(now).num_seconds().max(0),
                files_read: lab.activity.files_read,
                files_written: lab.activity.files_written,
                commands_run: lab.activity.commands_run,
                final_status: to,
                stop_reason: reason.map(str::to_string),
                finalized_at: now,
            });
        }
        let snapshot = lab.clone();
        drop(labs);

        info!("Lab {} {} -> {}", id, actual, to);
        self.emit(LabEvent::StatusChanged {
            lab_id: id.to_string(),
            from: actual,
            to,
            at: now,
        });
        Ok(snapshot)
    }

    /// Mark a gateway access. Only RUNNING labs accept activity; this is
    /// the one place `last_accessed` is written.
    pub async fn touch(&self, id: &str) -> LabResult<LabEnvironment> {
        let mut labs = self.labs.write().await;
        let lab = labs
            .get_mut(id)
            .ok_or_else(|| LabError::SessionNotFound(id.to_string()))?;
        if lab.status != LabStatus::Running {
            return Err(LabError::SessionNotReady {
                id: id.to_string(),
                status: lab.status,
            });
        }
        lab.last_accessed = Some(Utc::now());
        Ok(lab.clone())
    }

    /// Count a gateway operation that completed. Labs already finalized keep
    /// their metrics as recorded.
    pub async fn record_activity(&self, id: &str, kind: ActivityKind) -> LabResult<()> {
        let mut labs = self.labs.write().await;
        let lab = labs
            .get_mut(id)
            .ok_or_else(|| LabError::SessionNotFound(id.to_string()))?;
        if lab.status.is_terminal() {
            return Ok(());
        }
        match kind {
            ActivityKind::FileRead => lab.activity.files_read += 1,
            ActivityKind::FileWrite => lab.activity.files_written += 1,
            ActivityKind::Command => lab.activity.commands_run += 1,
            ActivityKind::Listing => {}
        }
        Ok(())
    }

    pub async fn request_stop(&self, id: &str) -> LabResult<StopDisposition> {
        let mut labs = self.labs.write().await;
        let lab = labs
            .get_mut(id)
            .ok_or_else(|| LabError::SessionNotFound(id.to_string()))?;
        let disposition = match lab.status {
            LabStatus::Running | LabStatus::Paused => StopDisposition::Enqueue,
            LabStatus::Creating | LabStatus::Starting => {
                lab.stop_requested = true;
                StopDisposition::Deferred
            }
            LabStatus::Stopping | LabStatus::Stopped | LabStatus::Error => {
                StopDisposition::AlreadyHandled
            }
        };
        Ok(disposition)
    }

    pub async fn set_endpoints(
        &self,
        id: &str,
        ports: BTreeMap<IdeType, u16>,
        ide_urls: BTreeMap<IdeType, String>,
        storage_path: PathBuf,
    ) -> LabResult<()> {
        self.update(id, |lab| {
            lab.ports = ports;
            lab.ide_urls = ide_urls;
            lab.persistent_storage_path = Some(storage_path);
        })
        .await
    }

    pub async fn set_container_id(&self, id: &str, container_id: &str) -> LabResult<()> {
        let container_id = container_id.to_string();
        self.update(id, |lab| lab.container_id = Some(container_id))
            .await
    }

    async fn update<F>(&self, id: &str, f: F) -> LabResult<()>
    where
        F: FnOnce(&mut LabEnvironment),
    {
        let mut labs = self.labs.write().await;
        let lab = labs
            .get_mut(id)
            .ok_or_else(|| LabError::SessionNotFound(id.to_string()))?;
        f(lab);
        lab.updated_at = Utc::now();
        Ok(())
    }

    /// Test hook for driving the monitor without waiting.
    #[cfg(test)]
    pub(crate) async fn backdate(
        &self,
        id: &str,
        created_by: chrono::Duration,
        accessed_by: Option<chrono::Duration>,
    ) {
        let mut labs = self.labs.write().await;
        if let Some(lab) = labs.get_mut(id) {
            lab.created_at -= created_by;
            if let Some(delta) = accessed_by {
                lab.last_accessed = Some(Utc::now() - delta);
            }
        }
    }
}
