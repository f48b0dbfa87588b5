use crate::error::Result;
use crate::model::{DevMode, WorkloadKind, WorkloadRef};
use crate::state::{StateStore, StateStoreExt};
use crate::workflow::{DevModeState, WorkflowStep};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const TMP_STATUS: &str = "tmpStatus";
const TMP_ID: &str = "tmpId";
const TMP_APP: &str = "tmpApp";
const TMP_DEVSPACE: &str = "tmpDevspace";
const TMP_NAMESPACE: &str = "tmpNamespace";
const TMP_WORKLOAD: &str = "tmpWorkload";
const TMP_WORKLOAD_PATH: &str = "tmpWorkloadPath";
const TMP_RESOURCE_TYPE: &str = "tmpResourceType";
const TMP_KUBECONFIG_PATH: &str = "tmpKubeconfigPath";
const TMP_CONTAINER: &str = "tmpContainer";
const TMP_MODE: &str = "tmpMode";
const TMP_IMAGE: &str = "tmpDevstartImage";
const TMP_STORAGE_CLASS: &str = "tmpStorageClass";
const TMP_HEADER: &str = "tmpHeader";
const TMP_APPEND_COMMAND: &str = "tmpDevstartAppendCommand";
const TMP_COMMAND: &str = "tmpDevStartCommand";

const ALL_KEYS: [&str; 16] = [
    TMP_STATUS,
    TMP_ID,
    TMP_APP,
    TMP_DEVSPACE,
    TMP_NAMESPACE,
    TMP_WORKLOAD,
    TMP_WORKLOAD_PATH,
    TMP_RESOURCE_TYPE,
    TMP_KUBECONFIG_PATH,
    TMP_CONTAINER,
    TMP_MODE,
    TMP_IMAGE,
    TMP_STORAGE_CLASS,
    TMP_HEADER,
    TMP_APPEND_COMMAND,
    TMP_COMMAND,
];

/// Snapshot of an in-progress dev session, picked up by the next process
/// that starts in the session's working directory.
#[derive(Clone)]
pub struct ResumeRecord {
    store: Arc<dyn StateStore>,
}

impl ResumeRecord {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn snapshot(&self, state: &DevModeState, work_dir: &Path) -> Result<()> {
        let workload = &state.workload;
        let id = workload.state_id();
        let entries = [
            (TMP_STATUS, Value::from(format!("{id}_status"))),
            (TMP_ID, Value::from(id.clone())),
            (TMP_APP, Value::from(workload.app_name.clone())),
            (TMP_DEVSPACE, Value::from(workload.space_name.clone())),
            (TMP_NAMESPACE, Value::from(workload.namespace.clone())),
            (TMP_WORKLOAD, Value::from(workload.name.clone())),
            (TMP_WORKLOAD_PATH, Value::from(work_dir.display().to_string())),
            (TMP_RESOURCE_TYPE, Value::from(workload.kind.as_arg())),
            (
                TMP_KUBECONFIG_PATH,
                Value::from(workload.kubeconfig_path.display().to_string()),
            ),
            (TMP_CONTAINER, Value::from(state.container.clone())),
            (TMP_MODE, Value::from(state.mode.as_str())),
            (TMP_IMAGE, Value::from(state.image.clone())),
        ];
        for (key, value) in entries {
            self.store.set_value(key, value)?;
        }

        self.set_optional(TMP_STORAGE_CLASS, workload.storage_class.as_deref())?;
        self.set_optional(TMP_HEADER, state.header.as_deref())?;
        self.set_optional(TMP_COMMAND, state.command.as_deref())?;
        if workload.dev_start_append_command.is_empty() {
            self.store.remove(TMP_APPEND_COMMAND)?;
        } else {
            self.store
                .set_as(TMP_APPEND_COMMAND, &workload.dev_start_append_command)?;
        }

        info!(workload = %workload, dir = %work_dir.display(), "resume record saved");
        Ok(())
    }

    fn set_optional(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value.filter(|value| !value.is_empty()) {
            Some(value) => self.store.set_value(key, Value::from(value)),
            None => self.store.remove(key),
        }
    }

    /// Takes the record when it belongs to `dir`; leaves it untouched otherwise.
    pub fn consume_if_matching(&self, dir: &Path) -> Result<Option<DevModeState>> {
        let Some(recorded) = self.store.get_string(TMP_WORKLOAD_PATH)? else {
            return Ok(None);
        };
        if Path::new(&recorded) != dir {
            return Ok(None);
        }

        let state = self.read(PathBuf::from(recorded));
        self.clear()?;
        match state {
            Ok(Some(state)) => {
                info!(workload = %state.workload, "resuming dev session");
                Ok(Some(state))
            }
            Ok(None) => {
                warn!(dir = %dir.display(), "incomplete resume record dropped");
                Ok(None)
            }
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "unreadable resume record dropped");
                Ok(None)
            }
        }
    }

    fn read(&self, work_dir: PathBuf) -> Result<Option<DevModeState>> {
        let store = &self.store;
        let (
            Some(app),
            Some(namespace),
            Some(name),
            Some(kind),
            Some(kubeconfig),
            Some(container),
            Some(image),
        ) = (
            store.get_string(TMP_APP)?,
            store.get_string(TMP_NAMESPACE)?,
            store.get_string(TMP_WORKLOAD)?,
            store.get_string(TMP_RESOURCE_TYPE)?,
            store.get_string(TMP_KUBECONFIG_PATH)?,
            store.get_string(TMP_CONTAINER)?,
            store.get_string(TMP_IMAGE)?,
        )
        else {
            return Ok(None);
        };
        let Some(kind) = WorkloadKind::from_token(&kind) else {
            return Ok(None);
        };

        let mut workload = WorkloadRef::new(app, kind, name, namespace, kubeconfig);
        if let Some(space) = store.get_string(TMP_DEVSPACE)? {
            workload.space_name = space;
        }
        workload.storage_class = store.get_string(TMP_STORAGE_CLASS)?;
        workload.dev_start_append_command = store
            .get_as::<Vec<String>>(TMP_APPEND_COMMAND)?
            .unwrap_or_default();

        let mode = store
            .get_string(TMP_MODE)?
            .and_then(|mode| DevMode::from_token(&mode))
            .unwrap_or_default();

        let mut state = DevModeState::new(workload, mode);
        state.container = container;
        state.image = image;
        state.header = store.get_string(TMP_HEADER)?;
        state.command = store.get_string(TMP_COMMAND)?;
        state.work_dir = Some(work_dir);
        state.step = WorkflowStep::AttachingTerminal;
        Ok(Some(state))
    }

    pub fn clear(&self) -> Result<()> {
        for key in ALL_KEYS {
            self.store.remove(key)?;
        }
        Ok(())
    }

    pub fn is_pending(&self) -> Result<bool> {
        Ok(self.store.get_string(TMP_WORKLOAD_PATH)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{ALL_KEYS, ResumeRecord, TMP_APP, TMP_WORKLOAD_PATH};
    use crate::model::{DevMode, WorkloadKind, WorkloadRef};
    use crate::state::{MemoryStateStore, StateStore};
    use crate::workflow::{DevModeState, WorkflowStep};
    use std::path::Path;
    use std::sync::Arc;

    fn state() -> DevModeState {
        let mut workload = WorkloadRef::new("shop", WorkloadKind::StatefulSet, "db", "dev", "/k/1");
        workload.space_name = "Dev Space".into();
        workload.storage_class = Some("ssd".into());
        workload.dev_start_append_command = vec!["--priority-class".into(), "critical".into()];
        let mut state = DevModeState::new(workload, DevMode::Copy);
        state.container = "db".into();
        state.image = "mysql:8".into();
        state.header = Some("x-env=dev".into());
        state.command = Some("debug".into());
        state
    }

    fn record() -> (Arc<MemoryStateStore>, ResumeRecord) {
        let store = Arc::new(MemoryStateStore::new());
        let record = ResumeRecord::new(store.clone());
        (store, record)
    }

    #[test]
    fn other_directory_leaves_record_untouched() {
        let (store, record) = record();
        record.snapshot(&state(), Path::new("/src/db")).unwrap();

        assert!(record.consume_if_matching(Path::new("/src/other")).unwrap().is_none());
        assert!(store.get_value(TMP_WORKLOAD_PATH).unwrap().is_some());
        assert!(record.is_pending().unwrap());
    }

    #[test]
    fn matching_directory_consumes_once() {
        let (store, record) = record();
        record.snapshot(&state(), Path::new("/src/db")).unwrap();

        let resumed = record.consume_if_matching(Path::new("/src/db")).unwrap().unwrap();
        assert_eq!(resumed.step, WorkflowStep::AttachingTerminal);
        assert_eq!(resumed.workload, state().workload);
        assert_eq!(resumed.container, "db");
        assert_eq!(resumed.image, "mysql:8");
        assert_eq!(resumed.mode, DevMode::Copy);
        assert_eq!(resumed.header.as_deref(), Some("x-env=dev"));
        assert_eq!(resumed.command.as_deref(), Some("debug"));
        assert_eq!(resumed.work_dir.as_deref(), Some(Path::new("/src/db")));

        for key in ALL_KEYS {
            assert!(store.get_value(key).unwrap().is_none(), "{key} left behind");
        }
        assert!(record.consume_if_matching(Path::new("/src/db")).unwrap().is_none());
    }

    #[test]
    fn optional_keys_are_removed_when_absent() {
        let (store, record) = record();
        record.snapshot(&state(), Path::new("/src/db")).unwrap();

        let mut plain = state();
        plain.header = None;
        plain.command = None;
        plain.workload.storage_class = None;
        plain.workload.dev_start_append_command.clear();
        record.snapshot(&plain, Path::new("/src/db")).unwrap();

        assert!(store.get_value("tmpHeader").unwrap().is_none());
        assert!(store.get_value("tmpDevStartCommand").unwrap().is_none());
        assert!(store.get_value("tmpStorageClass").unwrap().is_none());
        assert!(store.get_value("tmpDevstartAppendCommand").unwrap().is_none());
    }

    #[test]
    fn incomplete_record_is_dropped() {
        let (store, record) = record();
        record.snapshot(&state(), Path::new("/src/db")).unwrap();
        store.remove(TMP_APP).unwrap();

        assert!(record.consume_if_matching(Path::new("/src/db")).unwrap().is_none());
        assert!(!record.is_pending().unwrap());
    }
}
