//! Cache key derivation.

use prop_types::{hash_value, CacheKey, EstimationSchema, WorkItem};
use serde_json::json;

/// Derive the cache key of a work item under a schema.
///
/// The key covers the force field content hash, property type, the item parameters, the
/// replicate index and the schema fields that change the simulation. The property id, the
/// force field name and `error_on_failure` do not contribute.
pub fn cache_key(item: &WorkItem, schema: &EstimationSchema) -> CacheKey {
    let inputs = json!({
        "force_field_hash": item.force_field_hash,
        "property_type": item.property_type.as_str(),
        "parameters": item.parameters,
        "replicate": item.replicate,
        "n_molecules": schema.n_molecules,
        "max_iterations": schema.max_iterations,
        "error_tolerances": schema.error_tolerances,
    });
    CacheKey(hash_value(&inputs))
}
