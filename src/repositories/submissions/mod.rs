mod commands;
mod queries;

pub(crate) use commands::{create, update_versioned};
pub(crate) use queries::{exists, find_by_id, list_by_batch, list_resumable};

pub(crate) const COLUMNS: &str = "\
    id, batch_id, position, document_ref, document_hash, extracted_text, status, score, \
    max_score, criterion_scores, similarity, keyword_coverage, feedback, error_kind, \
    error_detail, attempt_count, next_attempt_at, version, created_at, updated_at";
