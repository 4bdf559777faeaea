mod field_transform;
#[allow(clippy::module_inception)]
mod mutation;
mod mutation_batch;

pub use field_transform::{FieldTransform, TransformOperation};
pub use mutation::{calculate_overlay_mutation, Mutation, MutationResult, Precondition};
pub use mutation_batch::{
    MutationBatch, MutationBatchResult, Overlay, OverlayedDocument, BATCH_ID_UNKNOWN,
};
