//! Request, result and dataset DTOs.

use crate::hashing::hash_str;
use crate::Priority;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Kind of physical property a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Density,
    EnthalpyOfMixing,
    EnthalpyOfVaporization,
    ExcessMolarVolume,
    DielectricConstant,
    SolvationFreeEnergy,
}

impl PropertyType {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::Density => "Density",
            PropertyType::EnthalpyOfMixing => "EnthalpyOfMixing",
            PropertyType::EnthalpyOfVaporization => "EnthalpyOfVaporization",
            PropertyType::ExcessMolarVolume => "ExcessMolarVolume",
            PropertyType::DielectricConstant => "DielectricConstant",
            PropertyType::SolvationFreeEnergy => "SolvationFreeEnergy",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measured physical property (dataset record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalProperty {
    pub id: String,
    pub property_type: PropertyType,
    pub value: f64,
    pub uncertainty: f64,
    /// Substance, thermodynamic state and any other input that determines the simulation.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Ordered collection of physical properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    #[serde(default)]
    pub properties: Vec<PhysicalProperty>,
}

impl DataSet {
    pub fn new(properties: Vec<PhysicalProperty>) -> Self {
        Self { properties }
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Index records by id. Later duplicates shadow earlier ones.
    pub fn by_id(&self) -> HashMap<&str, &PhysicalProperty> {
        self.properties.iter().map(|p| (p.id.as_str(), p)).collect()
    }

    /// Dataset holding only the record at `index`, or `None` when out of range.
    pub fn single(&self, index: usize) -> Option<DataSet> {
        self.properties
            .get(index)
            .map(|p| DataSet::new(vec![p.clone()]))
    }
}

/// Force field parameters, opaque to the orchestrator apart from their content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceFieldSource {
    pub name: String,
    pub content: String,
}

impl ForceFieldSource {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// blake3 hex digest of the force field content.
    pub fn content_hash(&self) -> String {
        hash_str(&self.content)
    }
}

/// Identity of a work item: (property id, replicate, force field).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItemKey {
    pub id: String,
    pub replicate: u32,
    pub force_field: String,
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.id, self.force_field, self.replicate)
    }
}

/// One logical unit of estimation: one property under one force field and replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub property_type: PropertyType,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub replicate: u32,
    pub force_field: String,
    pub force_field_hash: String,
}

impl WorkItem {
    pub fn key(&self) -> WorkItemKey {
        WorkItemKey {
            id: self.id.clone(),
            replicate: self.replicate,
            force_field: self.force_field.clone(),
        }
    }
}

/// Acceptance criterion for one observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTolerance {
    pub observable: String,
    #[serde(default)]
    pub relative_tolerance: Option<f64>,
    #[serde(default)]
    pub absolute_tolerance: Option<f64>,
    #[serde(default)]
    pub n_uncorrelated_samples: Option<u32>,
}

/// Per-property-type estimation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationSchema {
    #[serde(default = "default_n_molecules")]
    pub n_molecules: u32,
    #[serde(default)]
    pub error_tolerances: Vec<ErrorTolerance>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Escalate a failed estimate to an error and abort the rest of its property chain.
    #[serde(default)]
    pub error_on_failure: bool,
}

fn default_n_molecules() -> u32 {
    1000
}

fn default_max_iterations() -> u32 {
    60
}

impl Default for EstimationSchema {
    fn default() -> Self {
        Self {
            n_molecules: default_n_molecules(),
            error_tolerances: Vec::new(),
            max_iterations: default_max_iterations(),
            error_on_failure: false,
        }
    }
}

impl EstimationSchema {
    /// Equilibration schema: potential energy and density within 5% over 300
    /// uncorrelated samples, at most 60 iterations, failures recorded rather than raised.
    pub fn equilibration(n_molecules: u32) -> Self {
        let tolerance = |observable: &str| ErrorTolerance {
            observable: observable.to_string(),
            relative_tolerance: Some(0.05),
            absolute_tolerance: None,
            n_uncorrelated_samples: Some(300),
        };
        Self {
            n_molecules,
            error_tolerances: vec![tolerance("PotentialEnergy"), tolerance("Density")],
            max_iterations: 60,
            error_on_failure: false,
        }
    }
}

/// Options attached to a request and expanded per work item at decomposition time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub calculation_layers: Vec<String>,
    /// Property type name -> schema.
    #[serde(default)]
    pub schemas: BTreeMap<String, EstimationSchema>,
    /// Used for property types without an entry in `schemas`.
    #[serde(default)]
    pub default_schema: EstimationSchema,
}

impl RequestOptions {
    pub fn add_schema(&mut self, property_type: PropertyType, schema: EstimationSchema) {
        self.schemas.insert(property_type.as_str().to_string(), schema);
    }

    pub fn schema_for(&self, property_type: PropertyType) -> &EstimationSchema {
        self.schemas
            .get(property_type.as_str())
            .unwrap_or(&self.default_schema)
    }
}

/// Body of `POST /requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub dataset: DataSet,
    pub force_field: ForceFieldSource,
    #[serde(default)]
    pub options: RequestOptions,
    /// Replicate indices; every property is estimated once per replicate.
    #[serde(default = "default_replicates")]
    pub replicates: Vec<u32>,
    /// Scheduling class for every computation this request needs.
    #[serde(default)]
    pub priority: Priority,
}

fn default_replicates() -> Vec<u32> {
    vec![1]
}

/// A request after decomposition, as owned by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub work_items: Vec<WorkItem>,
    pub options: RequestOptions,
    #[serde(default)]
    pub priority: Priority,
    pub submitted_at: String,
}

/// Value and uncertainty produced by a successful estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub uncertainty: f64,
    #[serde(default)]
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatedProperty {
    pub id: String,
    pub property_type: PropertyType,
    pub replicate: u32,
    pub force_field: String,
    pub value: f64,
    pub uncertainty: f64,
    pub cache_key: String,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsuccessfulProperty {
    pub id: String,
    pub property_type: PropertyType,
    pub replicate: u32,
    pub force_field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationException {
    pub id: String,
    pub property_type: PropertyType,
    pub replicate: u32,
    pub force_field: String,
    pub message: String,
}

/// Classified outcome of a request. Every work item lands in exactly one of the three sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_id: String,
    pub estimated: Vec<EstimatedProperty>,
    pub unsuccessful: Vec<UnsuccessfulProperty>,
    pub exceptions: Vec<EstimationException>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PartitionError {
    #[error("work item {0} is missing from the result")]
    Missing(WorkItemKey),
    #[error("work item {0} appears more than once in the result")]
    Duplicated(WorkItemKey),
    #[error("work item {0} was not part of the request")]
    Unexpected(WorkItemKey),
}

impl RequestResult {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Total number of classified work items.
    pub fn len(&self) -> usize {
        self.estimated.len() + self.unsuccessful.len() + self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every classified work item, in set order (estimated, unsuccessful, exceptions).
    pub fn keys(&self) -> Vec<WorkItemKey> {
        let key = |id: &str, replicate: u32, force_field: &str| WorkItemKey {
            id: id.to_string(),
            replicate,
            force_field: force_field.to_string(),
        };
        self.estimated
            .iter()
            .map(|p| key(&p.id, p.replicate, &p.force_field))
            .chain(
                self.unsuccessful
                    .iter()
                    .map(|p| key(&p.id, p.replicate, &p.force_field)),
            )
            .chain(
                self.exceptions
                    .iter()
                    .map(|p| key(&p.id, p.replicate, &p.force_field)),
            )
            .collect()
    }

    /// Check that `expected` is partitioned exactly by the three outcome sets.
    pub fn verify_partition(&self, expected: &[WorkItemKey]) -> Result<(), PartitionError> {
        let expected: HashSet<&WorkItemKey> = expected.iter().collect();
        let mut seen = HashSet::new();
        for key in self.keys() {
            if !expected.contains(&key) {
                return Err(PartitionError::Unexpected(key));
            }
            if !seen.insert(key.clone()) {
                return Err(PartitionError::Duplicated(key));
            }
        }
        for key in expected {
            if !seen.contains(key) {
                return Err(PartitionError::Missing(key.clone()));
            }
        }
        Ok(())
    }
}

/// Base response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct BaseResponse<T> {
    #[serde(default = "default_code")]
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<T>,
}

fn default_code() -> i32 {
    200
}

impl<T> BaseResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitData {
    pub request_id: String,
    pub work_items: usize,
}

/// Response of `POST /requests`.
pub type SubmitResponse = BaseResponse<SubmitData>;

/// Coarse request state as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Running,
    Completed,
    /// A backend-level fault stopped the request; no result will be produced.
    Faulted,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Faulted)
    }
}

/// Number of work items in each state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub queued: usize,
    pub dispatched: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
}

impl ProgressCounts {
    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.errored
    }

    pub fn total(&self) -> usize {
        self.queued + self.dispatched + self.running + self.terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatusData {
    pub request_id: String,
    pub status: RequestStatus,
    pub progress: ProgressCounts,
    pub submitted_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
    /// Present only once every work item is terminal.
    #[serde(default)]
    pub result: Option<RequestResult>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `GET /requests/status`.
pub type StatusResponse = BaseResponse<RequestStatusData>;
