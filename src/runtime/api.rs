use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Weak},
};
use tokio::{
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use super::{
    commit::{spawn_worker, CommitTransport, HttpTransport, WorkerMsg},
    error::{error_string, CmiError},
    LaunchConfig,
};
use crate::{
    cmi::{
        format_decimal,
        schema::{self, Access, Kind, ValueError},
        ScormVersion,
    },
    models::CommitRequest,
};

const DATA_MODEL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotInitialized,
    Running,
    Terminated,
}

type Failure = (CmiError, String);

fn reject(error: CmiError, diagnostic: impl Into<String>) -> Failure {
    (error, diagnostic.into())
}

/// Per-session state, built at Initialize and dropped at Terminate.
struct Session {
    session_id: Uuid,
    version: ScormVersion,
    cache: BTreeMap<String, String>,
    /// Elements changed since the last payload was cut.
    dirty: BTreeSet<String>,
    sequence: i64,
    started: Instant,
    prior_total_seconds: i64,
    resume: bool,
    set_calls: usize,
}

impl Session {
    fn open(config: &LaunchConfig) -> Self {
        let version = config.scorm_version;
        let el = version.elements();
        let prior = config.prior.clone().unwrap_or_default();
        let has_bookmark = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        let resume = prior.entry.as_deref() == Some("resume")
            || has_bookmark(&prior.lesson_location)
            || has_bookmark(&prior.suspend_data);

        let mut cache = BTreeMap::new();
        cache.insert(el.learner_id.to_string(), config.learner_id.clone());
        cache.insert(
            el.learner_name.to_string(),
            config.learner_name.clone().unwrap_or_default(),
        );
        cache.insert(el.credit.to_string(), "credit".to_string());
        cache.insert(el.mode.to_string(), "normal".to_string());

        // Restored values are all marked dirty so the first commit seeds the
        // new attempt with them.
        let initial_status = match version {
            ScormVersion::Scorm12 => "not attempted",
            ScormVersion::Scorm2004 => "unknown",
        };
        let mut restored: Vec<(&str, String)> = vec![
            (
                el.completion_status,
                prior
                    .completion_status
                    .clone()
                    .unwrap_or_else(|| initial_status.to_string()),
            ),
            (el.entry, if resume { "resume" } else { "ab-initio" }.to_string()),
            (el.total_time, version.format_duration(prior.total_time_seconds)),
        ];
        if let Some(k) = el.success_status {
            restored.push((k, prior.success_status.clone().unwrap_or_else(|| "unknown".into())));
        }
        let scores = [
            (Some(el.score_raw), prior.score_raw),
            (Some(el.score_min), prior.score_min),
            (Some(el.score_max), prior.score_max),
            (el.score_scaled, prior.score_scaled),
        ];
        for (key, value) in scores {
            if let (Some(k), Some(v)) = (key, value) {
                restored.push((k, format_decimal(v)));
            }
        }
        if let Some(loc) = prior.lesson_location.clone() {
            restored.push((el.location, loc));
        }
        if let Some(data) = prior.suspend_data.clone() {
            restored.push((el.suspend_data, data));
        }

        let mut dirty = BTreeSet::new();
        for (k, v) in restored {
            cache.insert(k.to_string(), v);
            dirty.insert(k.to_string());
        }

        Self {
            session_id: config.session_id,
            version,
            cache,
            dirty,
            sequence: 0,
            started: Instant::now(),
            prior_total_seconds: prior.total_time_seconds,
            resume,
            set_calls: 0,
        }
    }

    fn write(&mut self, element: &str, value: String) {
        self.cache.insert(element.to_string(), value);
        self.dirty.insert(element.to_string());
    }

    /// Number of members currently held for an array collection.
    fn count(&self, collection: &str) -> usize {
        let prefix = format!("{collection}.");
        self.cache
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| k[prefix.len()..].split('.').next()?.parse::<usize>().ok())
            .map(|i| i + 1)
            .max()
            .unwrap_or(0)
    }

    /// Stamps the session clock and cuts the next numbered payload from the
    /// dirty set.
    fn next_payload(&mut self, terminated: bool) -> CommitRequest {
        let el = self.version.elements();
        let elapsed = self.started.elapsed().as_secs() as i64;
        let session_time = self.version.format_duration(elapsed);
        let total_time = self.version.format_duration(self.prior_total_seconds + elapsed);
        self.write(el.session_time, session_time);
        self.write(el.total_time, total_time);

        self.sequence += 1;
        let raw = std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|k| self.cache.get(&k).cloned().map(|v| (k, v)))
            .collect();
        CommitRequest {
            session_id: self.session_id,
            sequence_number: self.sequence,
            scorm_version: self.version,
            raw,
            terminated,
        }
    }

    fn read(&self, element: &str) -> Result<String, Failure> {
        let version = self.version;
        if element.is_empty() {
            return Err(reject(CmiError::GetFailure, "empty element name"));
        }
        if let Some(base) = element.strip_suffix("._children") {
            return match schema::lookup(version, element).map(|d| d.kind) {
                Some(Kind::Children(list)) => Ok(list.to_string()),
                _ if is_known(version, base) => Err(reject(CmiError::NoChildren, format!("{base} has no children"))),
                _ => Err(reject(CmiError::UndefinedElement, element)),
            };
        }
        if let Some(base) = element.strip_suffix("._count") {
            return match schema::lookup(version, element).map(|d| d.kind) {
                Some(Kind::Count) => Ok(self.count(base).to_string()),
                _ if is_known(version, base) => Err(reject(CmiError::NotAnArray, format!("{base} is not an array"))),
                _ => Err(reject(CmiError::UndefinedElement, element)),
            };
        }
        let def = schema::lookup(version, element).ok_or_else(|| reject(CmiError::UndefinedElement, element))?;
        if matches!(def.kind, Kind::Version) {
            return Ok(DATA_MODEL_VERSION.to_string());
        }
        if def.access == Access::WriteOnly {
            return Err(reject(CmiError::WriteOnly, element));
        }
        match self.cache.get(element) {
            Some(v) => Ok(v.clone()),
            None if version == ScormVersion::Scorm2004 => Err(reject(CmiError::NotInitialized, element)),
            None => Ok(String::new()),
        }
    }

    fn store(&mut self, element: &str, value: &str, protection_window: usize) -> Result<(), Failure> {
        let version = self.version;
        if element.is_empty() {
            return Err(reject(CmiError::SetFailure, "empty element name"));
        }
        let def = schema::lookup(version, element);
        if def.is_some_and(|d| d.is_keyword())
            || element.ends_with("._children")
            || element.ends_with("._count")
            || element.ends_with("._version")
        {
            return Err(reject(CmiError::SetKeyword, element));
        }
        let def = def.ok_or_else(|| reject(CmiError::UndefinedElement, element))?;
        if def.access == Access::ReadOnly {
            return Err(reject(CmiError::ReadOnly, element));
        }
        def.check_value(value).map_err(|e| match e {
            ValueError::TypeMismatch => reject(CmiError::TypeMismatch, format!("{element}={value:?}")),
            ValueError::OutOfRange => reject(CmiError::OutOfRange, format!("{element}={value:?}")),
        })?;
        self.check_array_order(element)?;
        if version == ScormVersion::Scorm2004 {
            self.check_dependency(element)?;
        }

        let el = version.elements();
        if self.resume
            && self.set_calls <= protection_window
            && el.is_bookmark(element)
            && value.is_empty()
            && self.cache.get(element).is_some_and(|v| !v.is_empty())
        {
            tracing::info!(
                session_id = %self.session_id,
                element,
                call = self.set_calls,
                "ignoring empty write over restored bookmark"
            );
            return Ok(());
        }
        self.write(element, value.to_string());
        Ok(())
    }

    /// Array members must be appended in order: index n is legal only when
    /// `_count` is at least n.
    fn check_array_order(&self, element: &str) -> Result<(), Failure> {
        let segs: Vec<&str> = element.split('.').collect();
        for (pos, seg) in segs.iter().enumerate() {
            if seg.is_empty() || !seg.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(index) = seg.parse::<usize>() else {
                return Err(reject(CmiError::SetFailure, format!("bad index in {element}")));
            };
            let collection = segs[..pos].join(".");
            let count = self.count(&collection);
            if index > count {
                return Err(reject(
                    CmiError::SetFailure,
                    format!("{collection}.{index} skips ahead of _count {count}"),
                ));
            }
        }
        Ok(())
    }

    fn check_dependency(&self, element: &str) -> Result<(), Failure> {
        let segs: Vec<&str> = element.split('.').collect();
        if let ["cmi", family @ ("interactions" | "objectives"), index, field, ..] = segs.as_slice() {
            if *field != "id" && !self.cache.contains_key(&format!("cmi.{family}.{index}.id")) {
                return Err(reject(
                    CmiError::DependencyNotEstablished,
                    format!("cmi.{family}.{index}.id must be set first"),
                ));
            }
        }
        Ok(())
    }
}

/// True when `element` names a schema element or a group of them.
fn is_known(version: ScormVersion, element: &str) -> bool {
    let (pattern, _) = schema::normalize(element);
    let group = format!("{pattern}.");
    schema::table(version)
        .iter()
        .any(|d| d.pattern == pattern || d.pattern.starts_with(&group))
}

struct Inner {
    phase: Phase,
    session: Option<Session>,
    last_error: Option<CmiError>,
    diagnostic: String,
    worker: Option<UnboundedSender<WorkerMsg>>,
    join: Option<JoinHandle<()>>,
}

impl Inner {
    fn succeed(&mut self) -> bool {
        self.last_error = None;
        self.diagnostic.clear();
        true
    }

    fn fail(&mut self, (error, diagnostic): Failure) -> bool {
        self.last_error = Some(error);
        self.diagnostic = diagnostic;
        false
    }

    /// Cuts a payload and queues it for the worker, under the caller's lock.
    fn dispatch(&mut self, wrap: fn(CommitRequest) -> WorkerMsg, terminated: bool) -> bool {
        let (Some(session), Some(tx)) = (self.session.as_mut(), self.worker.as_ref()) else {
            return false;
        };
        tx.send(wrap(session.next_payload(terminated))).is_ok()
    }

    fn close(&mut self) {
        self.phase = Phase::Terminated;
        self.session = None;
        self.worker = None;
    }
}

/// The API object content discovers on the host page.
///
/// Calls never block on the network: commits are queued for a background
/// worker and Terminate returns as soon as the final payload is queued.
pub struct RuntimeApi {
    config: LaunchConfig,
    transport: Arc<dyn CommitTransport>,
    inner: Arc<Mutex<Inner>>,
}

impl RuntimeApi {
    pub fn new(config: LaunchConfig, transport: Arc<dyn CommitTransport>) -> Self {
        Self {
            config,
            transport,
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::NotInitialized,
                session: None,
                last_error: None,
                diagnostic: String::new(),
                worker: None,
                join: None,
            })),
        }
    }

    /// Runtime that posts commits to the launch's sync URL.
    pub fn over_http(config: LaunchConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(config.sync_url.clone()));
        Self::new(config, transport)
    }

    pub fn version(&self) -> ScormVersion {
        self.config.scorm_version
    }

    pub fn initialize(&self, param: &str) -> bool {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        match phase {
            Phase::Running => return inner.fail(reject(CmiError::AlreadyInitialized, "")),
            Phase::Terminated => return inner.fail(reject(CmiError::ContentTerminated, "")),
            Phase::NotInitialized => {}
        }
        if !param.is_empty() {
            return inner.fail(reject(CmiError::InvalidArgument, "Initialize takes \"\""));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return inner.fail(reject(CmiError::InitFailed, "no async runtime for the commit worker"));
        }

        let session = Session::open(&self.config);
        tracing::info!(
            session_id = %session.session_id,
            version = %session.version,
            resume = session.resume,
            "runtime initialized"
        );

        let settings = &self.config.settings;
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let worker = spawn_worker(
            self.transport.clone(),
            settings.auto_commit_interval,
            settings.final_commit_retries,
            move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock();
                    if inner.phase == Phase::Running {
                        inner.dispatch(WorkerMsg::Commit, false);
                    }
                }
            },
        );
        inner.session = Some(session);
        inner.worker = Some(worker.tx);
        inner.join = Some(worker.join);
        inner.phase = Phase::Running;
        inner.succeed()
    }

    pub fn get_value(&self, element: &str) -> String {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let result = match (inner.phase, inner.session.as_ref()) {
            (Phase::NotInitialized, _) => Err(reject(CmiError::GetBeforeInit, "")),
            (Phase::Terminated, _) => Err(reject(CmiError::GetAfterTerminate, "")),
            (Phase::Running, Some(session)) => session.read(element),
            (Phase::Running, None) => Err(reject(CmiError::General, "no active session")),
        };
        match result {
            Ok(value) => {
                inner.succeed();
                value
            }
            Err(failure) => {
                inner.fail(failure);
                String::new()
            }
        }
    }

    pub fn set_value(&self, element: &str, value: &str) -> bool {
        let window = self.config.settings.resume_protection_window;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let result = match (inner.phase, inner.session.as_mut()) {
            (Phase::NotInitialized, _) => Err(reject(CmiError::SetBeforeInit, "")),
            (Phase::Terminated, _) => Err(reject(CmiError::SetAfterTerminate, "")),
            (Phase::Running, Some(session)) => {
                session.set_calls += 1;
                session.store(element, value, window)
            }
            (Phase::Running, None) => Err(reject(CmiError::General, "no active session")),
        };
        match result {
            Ok(()) => inner.succeed(),
            Err(failure) => inner.fail(failure),
        }
    }

    pub fn commit(&self, param: &str) -> bool {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        match phase {
            Phase::NotInitialized => return inner.fail(reject(CmiError::CommitBeforeInit, "")),
            Phase::Terminated => return inner.fail(reject(CmiError::CommitAfterTerminate, "")),
            Phase::Running => {}
        }
        if !param.is_empty() {
            return inner.fail(reject(CmiError::InvalidArgument, "Commit takes \"\""));
        }
        if inner.dispatch(WorkerMsg::Commit, false) {
            inner.succeed()
        } else {
            inner.fail(reject(CmiError::CommitFailure, "commit worker is gone"))
        }
    }

    /// Queues the final commit and ends the session without waiting for delivery.
    pub fn terminate(&self, param: &str) -> bool {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        match phase {
            Phase::NotInitialized => return inner.fail(reject(CmiError::TerminateBeforeInit, "")),
            Phase::Terminated => return inner.fail(reject(CmiError::TerminateAfterTerminate, "")),
            Phase::Running => {}
        }
        if !param.is_empty() {
            return inner.fail(reject(CmiError::InvalidArgument, "Terminate takes \"\""));
        }
        let queued = inner.dispatch(WorkerMsg::Final, true);
        if !queued {
            tracing::warn!(session_id = %self.config.session_id, "final commit could not be queued");
        }
        tracing::info!(session_id = %self.config.session_id, "runtime terminated");
        inner.close();
        inner.succeed()
    }

    /// Host page is being dismissed: hand whatever is unsaved to the worker
    /// for one best-effort delivery.
    pub fn on_unload(&self) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Running {
            return;
        }
        inner.dispatch(WorkerMsg::Unload, false);
        inner.close();
    }

    /// Waits until the commit worker has drained and exited.
    pub async fn finished(&self) {
        let join = self.inner.lock().join.take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "commit worker failed");
            }
        }
    }

    pub fn get_last_error(&self) -> u16 {
        self.inner
            .lock()
            .last_error
            .map(|e| e.code(self.version()))
            .unwrap_or(0)
    }

    pub fn get_error_string(&self, code: u16) -> &'static str {
        error_string(self.version(), code)
    }

    pub fn get_diagnostic(&self, code: u16) -> String {
        let inner = self.inner.lock();
        let is_last = inner.last_error.map(|e| e.code(self.version())) == Some(code);
        if is_last && !inner.diagnostic.is_empty() {
            inner.diagnostic.clone()
        } else {
            error_string(self.version(), code).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::PriorProgress,
        runtime::{commit::tests::RecordingTransport, RuntimeSettings},
    };
    use std::time::Duration;

    fn config(version: ScormVersion, prior: Option<PriorProgress>) -> LaunchConfig {
        LaunchConfig {
            session_id: Uuid::new_v4(),
            scorm_version: version,
            learner_id: "learner-1".into(),
            learner_name: Some("Ada".into()),
            sync_url: "http://localhost/progress".into(),
            content_url: None,
            prior,
            settings: RuntimeSettings::default(),
        }
    }

    fn runtime(cfg: LaunchConfig) -> (RuntimeApi, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        (RuntimeApi::new(cfg, transport.clone()), transport)
    }

    fn bookmarked() -> PriorProgress {
        PriorProgress {
            lesson_location: Some("slide-7".into()),
            suspend_data: Some("state=abc".into()),
            entry: Some("resume".into()),
            total_time_seconds: 120,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_errors_follow_state() {
        let (api, _) = runtime(config(ScormVersion::Scorm2004, None));
        assert_eq!(api.get_value("cmi.location"), "");
        assert_eq!(api.get_last_error(), 122);
        assert!(!api.commit(""));
        assert_eq!(api.get_last_error(), 142);

        assert!(api.initialize(""));
        assert_eq!(api.get_last_error(), 0);
        assert!(!api.initialize(""));
        assert_eq!(api.get_last_error(), 103);

        assert!(api.terminate(""));
        assert!(!api.set_value("cmi.location", "x"));
        assert_eq!(api.get_last_error(), 133);
        assert!(!api.terminate(""));
        assert_eq!(api.get_last_error(), 113);
        assert!(!api.initialize(""));
        assert_eq!(api.get_last_error(), 104);
        api.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn schema_rules_are_enforced() {
        let (api, _) = runtime(config(ScormVersion::Scorm2004, None));
        api.initialize("");

        assert_eq!(api.get_value("cmi.learner_id"), "learner-1");
        assert!(!api.set_value("cmi.learner_id", "someone-else"));
        assert_eq!(api.get_last_error(), 404);
        assert!(!api.set_value("cmi.nonsense", "1"));
        assert_eq!(api.get_last_error(), 401);
        assert!(!api.set_value("cmi.completion_status", "done"));
        assert_eq!(api.get_last_error(), 406);
        assert!(!api.set_value("cmi.score.scaled", "1.5"));
        assert_eq!(api.get_last_error(), 407);
        assert!(!api.set_value("cmi.interactions._count", "3"));
        assert_eq!(api.get_last_error(), 404);

        assert_eq!(api.get_value("cmi.location"), "");
        assert_eq!(api.get_last_error(), 403);
        assert_eq!(api.get_value("cmi._version"), "1.0");
        assert_eq!(api.get_value("cmi.score._children"), "scaled,raw,min,max");
        assert_eq!(api.get_value("cmi.location._children"), "");
        assert_eq!(api.get_last_error(), 301);

        assert!(api.set_value("cmi.location", "page-3"));
        assert_eq!(api.get_value("cmi.location"), "page-3");
        assert_eq!(api.get_diagnostic(0), "No Error");
        api.terminate("");
        api.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn arrays_append_in_order() {
        let (api, _) = runtime(config(ScormVersion::Scorm2004, None));
        api.initialize("");

        assert_eq!(api.get_value("cmi.interactions._count"), "0");
        assert!(!api.set_value("cmi.interactions.1.id", "q2"));
        assert_eq!(api.get_last_error(), 351);
        assert!(!api.set_value("cmi.interactions.0.type", "choice"));
        assert_eq!(api.get_last_error(), 408);

        assert!(api.set_value("cmi.interactions.0.id", "q1"));
        assert!(api.set_value("cmi.interactions.0.type", "choice"));
        assert!(api.set_value("cmi.interactions.1.id", "q2"));
        assert_eq!(api.get_value("cmi.interactions._count"), "2");
        api.terminate("");
        api.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scorm12_codes() {
        let (api, transport) = runtime(config(ScormVersion::Scorm12, None));
        assert!(api.initialize(""));
        assert_eq!(api.get_value("cmi.core.lesson_status"), "not attempted");
        assert_eq!(api.get_value("cmi.core.entry"), "ab-initio");
        assert_eq!(api.get_value("cmi.suspend_data"), "");
        assert_eq!(api.get_last_error(), 0);

        assert_eq!(api.get_value("cmi.core.session_time"), "");
        assert_eq!(api.get_last_error(), 404);
        assert!(!api.set_value("cmi.core._children", "x"));
        assert_eq!(api.get_last_error(), 402);
        assert_eq!(api.get_error_string(402), "Invalid set value, element is a keyword");

        assert!(api.set_value("cmi.core.lesson_status", "passed"));
        assert!(api.set_value("cmi.core.score.raw", "92"));
        assert!(api.terminate(""));
        api.finished().await;

        let sent = transport.delivered();
        let last = sent.last().unwrap();
        assert!(last.terminated);
        assert_eq!(last.scorm_version, ScormVersion::Scorm12);
        assert_eq!(last.raw["cmi.core.lesson_status"], "passed");
        assert_eq!(last.raw["cmi.core.session_time"], "00:00:00");
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restores_bookmark_and_guards_against_early_clear() {
        let (api, _) = runtime(config(ScormVersion::Scorm2004, Some(bookmarked())));
        api.initialize("");
        assert_eq!(api.get_value("cmi.entry"), "resume");
        assert_eq!(api.get_value("cmi.location"), "slide-7");

        // content resetting its own state during init
        assert!(api.set_value("cmi.location", ""));
        assert!(api.set_value("cmi.suspend_data", ""));
        assert_eq!(api.get_last_error(), 0);
        assert_eq!(api.get_value("cmi.location"), "slide-7");
        assert_eq!(api.get_value("cmi.suspend_data"), "state=abc");

        // a non-empty write always lands
        assert!(api.set_value("cmi.location", "slide-8"));
        assert_eq!(api.get_value("cmi.location"), "slide-8");

        for _ in 0..3 {
            api.set_value("cmi.exit", "suspend");
        }
        // outside the window an empty write is honoured
        assert!(api.set_value("cmi.location", ""));
        assert_eq!(api.get_value("cmi.location"), "");
        api.terminate("");
        api.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn protection_window_zero_disables_guard() {
        let mut cfg = config(ScormVersion::Scorm2004, Some(bookmarked()));
        cfg.settings.resume_protection_window = 0;
        let (api, _) = runtime(cfg);
        api.initialize("");
        assert!(api.set_value("cmi.location", ""));
        assert_eq!(api.get_value("cmi.location"), "");
        api.terminate("");
        api.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commits_are_numbered_and_carry_only_changes() {
        let (api, transport) = runtime(config(ScormVersion::Scorm2004, Some(bookmarked())));
        api.initialize("");
        api.set_value("cmi.location", "slide-9");
        assert!(api.commit(""));
        tokio::time::sleep(Duration::from_millis(1)).await;

        api.set_value("cmi.score.raw", "85");
        api.terminate("");
        api.finished().await;

        let sent = transport.delivered();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].sequence_number, 1);
        assert_eq!(sent[1].sequence_number, 2);
        // first payload seeds the new attempt with the restored state
        assert_eq!(sent[0].raw["cmi.suspend_data"], "state=abc");
        assert_eq!(sent[0].raw["cmi.location"], "slide-9");
        assert!(!sent[1].raw.contains_key("cmi.location"));
        assert_eq!(sent[1].raw["cmi.score.raw"], "85");
        assert!(sent[1].terminated);
        assert_eq!(sent[1].raw["cmi.total_time"], "PT0H2M0S");
    }

    #[tokio::test(start_paused = true)]
    async fn auto_commit_reports_elapsed_time() {
        let (api, transport) = runtime(config(ScormVersion::Scorm2004, None));
        api.initialize("");
        api.set_value("cmi.location", "p1");
        tokio::time::sleep(Duration::from_secs(31)).await;

        let sent = transport.delivered();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].terminated);
        assert_eq!(
            ScormVersion::Scorm2004.parse_duration(&sent[0].raw["cmi.session_time"]),
            Some(30)
        );
        api.terminate("");
        api.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_progress_survives_outage() {
        let (api, transport) = runtime(config(ScormVersion::Scorm2004, None));
        transport.set_offline(true);
        api.initialize("");
        api.set_value("cmi.location", "p4");
        api.commit("");
        tokio::time::sleep(Duration::from_millis(1)).await;
        api.set_value("cmi.completion_status", "completed");
        api.terminate("");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(transport.delivered().is_empty());

        transport.set_offline(false);
        api.finished().await;
        let sent = transport.delivered();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sequence_number, 2);
        assert!(sent[0].terminated);
        assert_eq!(sent[0].raw["cmi.location"], "p4");
        assert_eq!(sent[0].raw["cmi.completion_status"], "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn unload_sends_once_and_closes() {
        let (api, transport) = runtime(config(ScormVersion::Scorm2004, None));
        api.initialize("");
        api.set_value("cmi.suspend_data", "s");
        api.on_unload();
        api.finished().await;

        let sent = transport.delivered();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].terminated);
        assert!(!api.commit(""));
        assert_eq!(api.get_last_error(), 143);
    }
}
