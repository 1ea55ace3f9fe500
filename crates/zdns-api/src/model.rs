//! Classifier artifact loading (C2, load half) and `POST /model/train`.
//!
//! The artifact itself is an opaque serialized pipeline (spec §1 non-goal:
//! model training is "an opaque batch job producing a serialized
//! classifier"; original_source/backend/inference/model.py loads it with
//! `joblib.load`, i.e. a Python pickle — not a format this process can or
//! should deserialize). The loader's contract is exist-or-not, plus a raw
//! byte scan for spec §4.1's positive-class hint strings — reported via
//! `/model/status` for observability, but not used to compute a real class
//! index, since that requires deserializing `classes_` and this process
//! never does. A present-but-unparseable artifact degrades the same way a
//! missing one does — through `ModelPipeline::infer` returning `Err`, which
//! `Classifier::classify` already turns into `heuristic_fallback`.

use std::path::Path;

use actix_web::{get, post, web, HttpResponse};
use zdns_core::classifier::ModelPipeline;
use zdns_core::config;

use crate::state::AppState;

/// Positive-class label names the pipeline's `classes_` might carry (spec
/// §4.1); checked case-insensitively.
const POSITIVE_CLASS_HINTS: &[&str] = &["dga", "malicious", "malware", "1"];

/// Placeholder pipeline standing in for the real joblib artifact: confirms
/// the artifact file is present and readable, and reports which class index
/// spec §4.1's label-sniffing would select, without pretending to run real
/// TF-IDF+NB inference on it. Present only so `source="model"` is reachable
/// once a genuine Rust-side scorer (or an FFI bridge to the Python artifact)
/// is wired in; until then `infer` always defers to the heuristic by
/// returning an error, which is an honest reflection of "we can't actually
/// read this pickle." `positive_index` is hardcoded to spec §4.1's default —
/// this process never deserializes the pickle's actual `classes_` array, so
/// it cannot compute a real index even when a hint matches; `matched_hint`
/// records what the byte scan *did* find, surfaced via `/model/status` so
/// the scan isn't silently discarded work.
struct SniffedPipeline {
    positive_index: usize,
    matched_hint: Option<&'static str>,
}

impl ModelPipeline for SniffedPipeline {
    fn infer(&self, _domain: &str) -> Result<f64, String> {
        Err(format!(
            "artifact loaded (positive class index {}, hint={:?}), but in-process inference is not implemented for this format",
            self.positive_index, self.matched_hint
        ))
    }

    fn diagnostics(&self) -> Option<String> {
        Some(format!(
            "positive_index={} positive_class_hint={:?}",
            self.positive_index, self.matched_hint
        ))
    }
}

/// Attempts to load the classifier artifact at `path`. Returns `None` (and
/// logs like the teacher's `load_model`) when the file is missing or
/// unreadable — the caller then constructs `Classifier::new(None)` and the
/// heuristic fallback takes over for every query.
pub fn load_classifier_model(path: &str) -> Option<Box<dyn ModelPipeline>> {
    if !Path::new(path).exists() {
        log::info!("[classifier] model not found at {path}, using heuristic baseline");
        return None;
    }

    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("[classifier] failed to read model at {path}: {e}");
            return None;
        }
    };
    if bytes.is_empty() {
        log::warn!("[classifier] model at {path} is empty, using heuristic baseline");
        return None;
    }

    let matched_hint = sniff_positive_class_hint(&bytes);
    log::info!(
        "[classifier] loaded model artifact from {path} ({} bytes, hint={:?})",
        bytes.len(),
        matched_hint
    );
    Some(Box::new(SniffedPipeline {
        positive_index: 1,
        matched_hint,
    }))
}

/// Scans the raw artifact bytes for any of the positive-class hint strings
/// (sklearn pickles carry class label strings as readable ASCII literals)
/// and returns the one that matched, if any. Spec §4.1's positive index
/// always defaults to 1 regardless of the result — this scan cannot locate
/// the hint's actual position in the pickle's `classes_` array without
/// deserializing it — so the hint is reported for observability
/// (`/model/status`) rather than used to pick a different index.
fn sniff_positive_class_hint(bytes: &[u8]) -> Option<&'static str> {
    let text = String::from_utf8_lossy(bytes);
    let lower = text.to_lowercase();
    POSITIVE_CLASS_HINTS.iter().find(|hint| lower.contains(**hint)).copied()
}

#[get("/model/status")]
pub async fn model_status(state: web::Data<AppState>) -> HttpResponse {
    let (loaded, diagnostics) = match state.classifier.read() {
        Ok(guard) => (guard.is_loaded(), guard.diagnostics()),
        Err(poisoned) => {
            let guard = poisoned.into_inner();
            (guard.is_loaded(), guard.diagnostics())
        }
    };
    HttpResponse::Ok().json(serde_json::json!({
        "loaded": loaded,
        "fallback_active": !loaded,
        "model_path": config::classifier_model_path(),
        "model_version": if loaded { "artifact" } else { "heuristic" },
        "diagnostics": diagnostics,
    }))
}

#[post("/model/train")]
pub async fn train_model(_state: web::Data<AppState>) -> HttpResponse {
    // Training is an opaque external batch job (spec §1 non-goal); this
    // process only ever loads its output. Synchronous invocation here is a
    // deliberate 500 until an actual training pipeline is wired in.
    HttpResponse::InternalServerError().json(serde_json::json!({
        "error": "model training is performed out of process; no trainer is configured"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_none() {
        assert!(load_classifier_model("/nonexistent/path/to/model.pkl").is_none());
    }

    #[test]
    fn sniffs_dga_hint() {
        assert_eq!(sniff_positive_class_hint(b"classes_ dga malware"), Some("dga"));
    }

    #[test]
    fn no_hint_found_yields_none() {
        assert_eq!(sniff_positive_class_hint(b"classes_ benign safe"), None);
    }
}
