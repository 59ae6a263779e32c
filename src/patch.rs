use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation};
use serde_json::Value;

pub const AFFINITY_PATH: [&str; 2] = ["spec", "affinity"];

/// Builds the single-operation patch that adds `value` at `/spec/affinity`.
pub fn build_affinity_patch(value: &Value) -> Patch {
    Patch(vec![PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(AFFINITY_PATH),
        value: value.clone(),
    })])
}

/// Wire form of a patch, as carried in the `patch` field of an admission response.
pub fn render_patch(patch: &Patch) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(patch)
}
