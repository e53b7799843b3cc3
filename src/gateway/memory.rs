//! In-Memory Gateway
//!
//! Simulates the subset of the storage controller API the reconciler uses:
//! SVMs, volumes, volume snapshots and replication relationships, including
//! the asynchronous relationship initialization. Every call is recorded so
//! tests can assert which requests were (or were not) issued.

use super::{format_backend_message, nil_or_one, records_from_value};
use crate::domain::ports::{
    lookup_str, name_object, BackendGateway, Identity, Query, Record, RecordsResponse,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Controller error code for a reference to an object that does not exist
pub const CODE_ENTRY_DOES_NOT_EXIST: &str = "6619337";

/// Controller error code for a duplicate name
pub const CODE_DUPLICATE_ENTRY: &str = "1638555";

// =============================================================================
// Call Log
// =============================================================================

/// Gateway method a call went through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMethod {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl CallMethod {
    fn verb(&self) -> &'static str {
        match self {
            CallMethod::Get | CallMethod::List => "GET",
            CallMethod::Create => "POST",
            CallMethod::Update => "PATCH",
            CallMethod::Delete => "DELETE",
        }
    }
}

/// One recorded gateway call
#[derive(Debug, Clone)]
pub struct GatewayCall {
    pub method: CallMethod,
    pub path: String,
    pub query: Query,
    pub body: Option<Record>,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    method: CallMethod,
    path_prefix: String,
    status: u16,
    message: String,
}

// =============================================================================
// Simulated Controller State
// =============================================================================

#[derive(Debug)]
struct Relationship {
    record: Record,
    /// Reads remaining before a requested transition becomes visible
    pending: Option<(String, u32)>,
}

#[derive(Debug)]
struct ControllerState {
    svms: BTreeMap<String, Record>,
    volumes: BTreeMap<String, Record>,
    /// snapshot uuid -> (volume uuid, record)
    snapshots: BTreeMap<String, (String, Record)>,
    relationships: BTreeMap<String, Relationship>,
    calls: Vec<GatewayCall>,
    failures: Vec<InjectedFailure>,
    next_id: u64,
    /// `None` means initialization never completes
    initialize_after_reads: Option<u32>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            svms: BTreeMap::new(),
            volumes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            relationships: BTreeMap::new(),
            calls: Vec::new(),
            failures: Vec::new(),
            next_id: 1,
            initialize_after_reads: Some(1),
        }
    }
}

impl ControllerState {
    fn allocate_id(&mut self, prefix: &str) -> String {
        let id = format!("{}-{:08x}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    fn svm_by_name(&self, name: &str) -> Option<&Record> {
        self.svms
            .values()
            .find(|svm| lookup_str(svm, "name") == Some(name))
    }

    fn volume_in_svm(&self, svm_name: &str, volume_name: &str) -> Option<&Record> {
        self.volumes.values().find(|vol| {
            lookup_str(vol, "name") == Some(volume_name)
                && lookup_str(vol, "svm.name") == Some(svm_name)
        })
    }

    fn insert_svm(&mut self, name: &str) -> String {
        let uuid = self.allocate_id("svm");
        let mut record = Record::new();
        record.insert("uuid".into(), json!(uuid));
        record.insert("name".into(), json!(name));
        record.insert("ipspace".into(), name_object("Default"));
        record.insert("snapshot_policy".into(), name_object("default"));
        record.insert("subtype".into(), json!("default"));
        record.insert("language".into(), json!("c.utf_8"));
        record.insert("max_volumes".into(), json!("unlimited"));
        self.svms.insert(uuid.clone(), record);
        uuid
    }

    fn insert_volume(&mut self, svm_uuid: &str, svm_name: &str, name: &str) -> String {
        let uuid = self.allocate_id("vol");
        let record = json!({
            "uuid": uuid,
            "name": name,
            "svm": {"uuid": svm_uuid, "name": svm_name},
        });
        if let Value::Object(record) = record {
            self.volumes.insert(uuid.clone(), record);
        }
        uuid
    }
}

// =============================================================================
// Memory Gateway
// =============================================================================

/// Gateway backed by an in-process controller simulation
pub struct MemoryGateway {
    name: String,
    state: Mutex<ControllerState>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// Create an empty simulated controller
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Seed an SVM; returns the existing id if the name is taken
    pub fn add_svm(&self, name: &str) -> Identity {
        let mut state = self.state.lock();
        if let Some(id) = state.svm_by_name(name).and_then(Identity::from_record) {
            return id;
        }
        Identity::new(state.insert_svm(name))
    }

    /// Seed a volume in an SVM, creating the SVM if needed
    pub fn add_volume(&self, svm: &str, name: &str) -> Identity {
        let svm_id = self.add_svm(svm);
        let mut state = self.state.lock();
        if let Some(id) = state.volume_in_svm(svm, name).and_then(Identity::from_record) {
            return id;
        }
        Identity::new(state.insert_volume(svm_id.as_str(), svm, name))
    }

    /// Seed a second SVM record with an already used name
    pub fn add_duplicate_svm(&self, name: &str) -> Identity {
        Identity::new(self.state.lock().insert_svm(name))
    }

    /// Number of relationship reads after an initialize request before the
    /// new state is observed; `None` stalls initialization forever
    pub fn initialize_after_reads(&self, reads: Option<u32>) {
        self.state.lock().initialize_after_reads = reads;
    }

    /// Fail every call of `method` whose path starts with `path_prefix`
    pub fn inject_failure(&self, method: CallMethod, path_prefix: &str, status: u16, message: &str) {
        self.state.lock().failures.push(InjectedFailure {
            method,
            path_prefix: path_prefix.to_string(),
            status,
            message: message.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls through `method`
    pub fn count(&self, method: CallMethod) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Current backend state of a relationship
    pub fn relationship_state(&self, id: &Identity) -> Option<String> {
        self.state
            .lock()
            .relationships
            .get(id.as_str())
            .and_then(|r| lookup_str(&r.record, "state").map(str::to_string))
    }

    pub fn relationship_count(&self) -> usize {
        self.state.lock().relationships.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Raw snapshot record, bypassing the call log
    pub fn snapshot_record(&self, id: &Identity) -> Option<Record> {
        self.state
            .lock()
            .snapshots
            .get(id.as_str())
            .map(|(_, record)| record.clone())
    }

    /// Raw SVM record, bypassing the call log
    pub fn svm_record(&self, id: &Identity) -> Option<Record> {
        self.state.lock().svms.get(id.as_str()).cloned()
    }

    /// Route one call. `Ok(None)` is a 404 on GET.
    fn handle(
        &self,
        method: CallMethod,
        path: &str,
        query: &Query,
        body: Option<&Record>,
    ) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        state.calls.push(GatewayCall {
            method,
            path: path.to_string(),
            query: query.clone(),
            body: body.cloned(),
        });
        debug!(gateway = %self.name, "{} {}", method.verb(), path);

        if let Some(failure) = state
            .failures
            .iter()
            .find(|f| f.method == method && path.starts_with(&f.path_prefix))
        {
            return Err(Error::backend(
                method.verb(),
                path,
                failure.status,
                failure.message.clone(),
            ));
        }

        let empty = Record::new();
        let body = body.unwrap_or(&empty);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let verb = method.verb();

        use CallMethod::*;
        match (method, segments.as_slice()) {
            // -----------------------------------------------------------------
            // SVMs
            // -----------------------------------------------------------------
            (Get | List, ["svm", "svms"]) => {
                let records: Vec<Record> = state
                    .svms
                    .values()
                    .filter(|r| matches_query(r, query, &["name"]))
                    .cloned()
                    .collect();
                Ok(Some(collection(records)))
            }
            (Create, ["svm", "svms"]) => {
                let name = required_str(verb, path, body, "name")?;
                if state.svm_by_name(&name).is_some() {
                    return Err(duplicate(verb, path, &name));
                }
                let uuid = state.insert_svm(&name);
                let record = state.svms.get_mut(&uuid).map(|record| {
                    merge(record, body);
                    record.clone()
                });
                Ok(Some(created(query, record)))
            }
            (Get, ["svm", "svms", id]) => Ok(state.svms.get(*id).cloned().map(Value::Object)),
            (Update, ["svm", "svms", id]) => {
                if let Some(name) = lookup_str(body, "name") {
                    let taken = state
                        .svms
                        .iter()
                        .any(|(uuid, r)| uuid.as_str() != *id && lookup_str(r, "name") == Some(name));
                    if taken {
                        return Err(duplicate(verb, path, name));
                    }
                }
                let record = state.svms.get_mut(*id).ok_or_else(|| missing(verb, path))?;
                merge(record, body);
                Ok(Some(Value::Null))
            }
            (Delete, ["svm", "svms", id]) => {
                state.svms.remove(*id).ok_or_else(|| missing(verb, path))?;
                Ok(Some(Value::Null))
            }

            // -----------------------------------------------------------------
            // Volumes
            // -----------------------------------------------------------------
            (Get | List, ["storage", "volumes"]) => {
                let records: Vec<Record> = state
                    .volumes
                    .values()
                    .filter(|r| matches_query(r, query, &["name", "svm.uuid", "svm.name"]))
                    .cloned()
                    .collect();
                Ok(Some(collection(records)))
            }
            (Delete, ["storage", "volumes", id]) => {
                state.volumes.remove(*id).ok_or_else(|| missing(verb, path))?;
                state.snapshots.retain(|_, (vol, _)| vol.as_str() != *id);
                Ok(Some(Value::Null))
            }

            // -----------------------------------------------------------------
            // Volume snapshots
            // -----------------------------------------------------------------
            (Get | List, ["storage", "volumes", volume, "snapshots"]) => {
                let records: Vec<Record> = state
                    .snapshots
                    .values()
                    .filter(|(vol, r)| vol.as_str() == *volume && matches_query(r, query, &["name"]))
                    .map(|(_, r)| r.clone())
                    .collect();
                Ok(Some(collection(records)))
            }
            (Create, ["storage", "volumes", volume, "snapshots"]) => {
                let volume_record = state
                    .volumes
                    .get(*volume)
                    .cloned()
                    .ok_or_else(|| missing(verb, path))?;
                let name = required_str(verb, path, body, "name")?;
                let taken = state
                    .snapshots
                    .values()
                    .any(|(vol, r)| vol.as_str() == *volume && lookup_str(r, "name") == Some(name.as_str()));
                if taken {
                    return Err(duplicate(verb, path, &name));
                }
                let uuid = state.allocate_id("snap");
                let mut record = Record::new();
                record.insert("uuid".into(), json!(uuid));
                record.insert(
                    "volume".into(),
                    json!({"uuid": volume, "name": lookup_str(&volume_record, "name")}),
                );
                if let Some(svm) = volume_record.get("svm") {
                    record.insert("svm".into(), svm.clone());
                }
                record.insert("create_time".into(), json!(chrono::Utc::now().to_rfc3339()));
                merge(&mut record, body);
                state
                    .snapshots
                    .insert(uuid, (volume.to_string(), record.clone()));
                Ok(Some(created(query, Some(record))))
            }
            (Get, ["storage", "volumes", volume, "snapshots", id]) => Ok(state
                .snapshots
                .get(*id)
                .filter(|(vol, _)| vol.as_str() == *volume)
                .map(|(_, r)| Value::Object(r.clone()))),
            (Update, ["storage", "volumes", volume, "snapshots", id]) => {
                let (vol, record) = state
                    .snapshots
                    .get_mut(*id)
                    .ok_or_else(|| missing(verb, path))?;
                if vol.as_str() != *volume {
                    return Err(missing(verb, path));
                }
                merge(record, body);
                Ok(Some(Value::Null))
            }
            (Delete, ["storage", "volumes", volume, "snapshots", id]) => {
                let owned = state
                    .snapshots
                    .get(*id)
                    .map(|(vol, _)| vol.as_str() == *volume)
                    .unwrap_or(false);
                if !owned {
                    return Err(missing(verb, path));
                }
                state.snapshots.remove(*id);
                Ok(Some(Value::Null))
            }

            // -----------------------------------------------------------------
            // Replication relationships
            // -----------------------------------------------------------------
            (Get | List, ["snapmirror", "relationships"]) => {
                let records: Vec<Record> = state
                    .relationships
                    .values()
                    .filter(|r| {
                        matches_query(&r.record, query, &["source.path", "destination.path"])
                    })
                    .map(|r| r.record.clone())
                    .collect();
                Ok(Some(collection(records)))
            }
            (Create, ["snapmirror", "relationships"]) => {
                let source = required_str(verb, path, body, "source.path")?;
                let destination = required_str(verb, path, body, "destination.path")?;
                let create_destination = body
                    .get("create_destination")
                    .and_then(|v| v.get("enabled"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                check_endpoint(&state, verb, path, &source, false)?;
                if let Some(volume) = check_endpoint(&state, verb, path, &destination, create_destination)? {
                    let (svm, _) = split_endpoint(&destination);
                    let svm_uuid = state
                        .svm_by_name(svm)
                        .and_then(Identity::from_record)
                        .ok_or_else(|| not_exist(verb, path))?;
                    state.insert_volume(svm_uuid.as_str(), svm, &volume);
                }

                let uuid = state.allocate_id("sm");
                let mut record = Record::new();
                record.insert("uuid".into(), json!(uuid));
                for side in ["source", "destination"] {
                    if let Some(v) = body.get(side) {
                        record.insert(side.into(), v.clone());
                    }
                }
                record.insert("state".into(), json!("uninitialized"));
                record.insert("healthy".into(), json!(false));
                state.relationships.insert(
                    uuid,
                    Relationship {
                        record: record.clone(),
                        pending: None,
                    },
                );
                Ok(Some(created(query, Some(record))))
            }
            (Get, ["snapmirror", "relationships", id]) => {
                let Some(relationship) = state.relationships.get_mut(*id) else {
                    return Ok(None);
                };
                advance(relationship);
                Ok(Some(Value::Object(relationship.record.clone())))
            }
            (Update, ["snapmirror", "relationships", id]) => {
                let after = state.initialize_after_reads;
                let relationship = state
                    .relationships
                    .get_mut(*id)
                    .ok_or_else(|| missing(verb, path))?;
                let target = required_str(verb, path, body, "state")?;
                if body.len() != 1 {
                    return Err(Error::backend(
                        verb,
                        path,
                        400,
                        format_backend_message("only the state field can be modified", Some("13001")),
                    ));
                }
                match after {
                    Some(0) => {
                        relationship.record.insert("state".into(), json!(target));
                        relationship.record.insert("healthy".into(), json!(true));
                    }
                    Some(reads) => relationship.pending = Some((target, reads)),
                    None => relationship.pending = Some((target, u32::MAX)),
                }
                Ok(Some(Value::Null))
            }
            (Delete, ["snapmirror", "relationships", id]) => {
                state
                    .relationships
                    .remove(*id)
                    .ok_or_else(|| missing(verb, path))?;
                Ok(Some(Value::Null))
            }

            _ => Err(Error::backend(
                verb,
                path,
                400,
                format_backend_message("API not found", Some("3")),
            )),
        }
    }
}

#[async_trait]
impl BackendGateway for MemoryGateway {
    async fn get(&self, path: &str, query: &Query) -> Result<Option<Record>> {
        match self.handle(CallMethod::Get, path, query, None)? {
            Some(value) => nil_or_one("GET", path, records_from_value("GET", path, value)?),
            None => Ok(None),
        }
    }

    async fn list(&self, path: &str, query: &Query) -> Result<Vec<Record>> {
        match self.handle(CallMethod::List, path, query, None)? {
            Some(value) => records_from_value("GET", path, value),
            None => Ok(Vec::new()),
        }
    }

    async fn create(&self, path: &str, query: &Query, body: &Record) -> Result<RecordsResponse> {
        let value = self
            .handle(CallMethod::Create, path, query, Some(body))?
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn update(&self, path: &str, query: &Query, body: &Record) -> Result<Option<Record>> {
        self.handle(CallMethod::Update, path, query, Some(body))?;
        Ok(None)
    }

    async fn delete(&self, path: &str, query: &Query) -> Result<()> {
        self.handle(CallMethod::Delete, path, query, None)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn collection(records: Vec<Record>) -> Value {
    json!({ "num_records": records.len(), "records": records })
}

fn created(query: &Query, record: Option<Record>) -> Value {
    match (query.get("return_records"), record) {
        (Some("true"), Some(record)) => collection(vec![record]),
        _ => collection(Vec::new()),
    }
}

fn matches_query(record: &Record, query: &Query, filters: &[&str]) -> bool {
    filters.iter().all(|key| match query.get(key) {
        Some(expected) => lookup_str(record, key) == Some(expected),
        None => true,
    })
}

fn merge(record: &mut Record, body: &Record) {
    for (key, value) in body {
        record.insert(key.clone(), value.clone());
    }
}

fn advance(relationship: &mut Relationship) {
    if let Some((target, reads)) = relationship.pending.take() {
        if reads <= 1 {
            relationship.record.insert("state".into(), json!(target));
            relationship.record.insert("healthy".into(), json!(true));
        } else if reads == u32::MAX {
            relationship.pending = Some((target, reads));
        } else {
            relationship.pending = Some((target, reads - 1));
        }
    }
}

fn split_endpoint(endpoint: &str) -> (&str, &str) {
    endpoint.split_once(':').unwrap_or((endpoint, ""))
}

/// Check that `svm:volume` exists. Returns the volume name to create when
/// it is missing but provisioning was requested.
fn check_endpoint(
    state: &ControllerState,
    verb: &str,
    path: &str,
    endpoint: &str,
    provision: bool,
) -> Result<Option<String>> {
    let (svm, volume) = split_endpoint(endpoint);
    if state.svm_by_name(svm).is_none() {
        return Err(not_exist(verb, path));
    }
    if volume.is_empty() || state.volume_in_svm(svm, volume).is_some() {
        return Ok(None);
    }
    if provision {
        Ok(Some(volume.to_string()))
    } else {
        Err(not_exist(verb, path))
    }
}

fn required_str(verb: &str, path: &str, body: &Record, field: &str) -> Result<String> {
    lookup_str(body, field)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::backend(
                verb,
                path,
                400,
                format_backend_message(&format!("missing required field \"{}\"", field), Some("2")),
            )
        })
}

fn missing(verb: &str, path: &str) -> Error {
    Error::backend(
        verb,
        path,
        404,
        format_backend_message("entry doesn't exist", Some("4")),
    )
}

fn not_exist(verb: &str, path: &str) -> Error {
    Error::backend(
        verb,
        path,
        400,
        format_backend_message(
            "the source or destination endpoint does not exist",
            Some(CODE_ENTRY_DOES_NOT_EXIST),
        ),
    )
}

fn duplicate(verb: &str, path: &str, name: &str) -> Error {
    Error::backend(
        verb,
        path,
        409,
        format_backend_message(&format!("duplicate entry \"{}\"", name), Some(CODE_DUPLICATE_ENTRY)),
    )
}
