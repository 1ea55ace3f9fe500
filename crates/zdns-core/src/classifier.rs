//! The classifier (C2): a trained model when available, a deterministic
//! heuristic fallback otherwise. Same shape as the teacher's
//! `virustotal::get_cached_or_fetch` — try the primary source, fall back
//! when it's unavailable, and tag the result with where it came from.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Benign,
    Suspicious,
    Malicious,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Benign => "BENIGN",
            Label::Suspicious => "SUSPICIOUS",
            Label::Malicious => "MALICIOUS",
        }
    }

    fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Label::Malicious
        } else if score >= 0.6 {
            Label::Suspicious
        } else {
            Label::Benign
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub label: Label,
    pub score: f64,
    pub features: HashMap<String, f64>,
    pub source: &'static str,
}

/// Trait boundary for a loaded model pipeline, so `Classifier` doesn't care
/// whether the artifact is a TF-IDF+NB pipeline or something else, as long as
/// it can score a domain string.
pub trait ModelPipeline: Send + Sync {
    /// Returns `P(positive | domain)` in `[0, 1]`, or an error if inference fails.
    fn infer(&self, domain: &str) -> Result<f64, String>;

    /// Free-form diagnostic string surfaced by `/model/status`, e.g. which
    /// positive-class hint a loader found at load time. `None` by default.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Immutable, process-wide handle returned by `load_classifier`. Replaces
/// the teacher's process-wide mutable model pointer pattern (spec §9 design
/// note) — load once, hand out `Arc`-free shared references, and reload only
/// by constructing a fresh `Classifier` and swapping the handle at the call
/// site.
pub struct Classifier {
    model: Option<Box<dyn ModelPipeline>>,
}

impl Classifier {
    /// `model` is `None` when no artifact could be loaded at startup — the
    /// caller (zdns-api's main) is responsible for attempting the load and
    /// reporting `ModelUnavailable` via logs; the classifier itself just
    /// degrades gracefully from here on.
    pub fn new(model: Option<Box<dyn ModelPipeline>>) -> Self {
        Classifier { model }
    }

    pub fn reload(&mut self, model: Option<Box<dyn ModelPipeline>>) {
        self.model = model;
    }

    /// Whether an artifact is currently loaded, for `/model/status`.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// The loaded model's diagnostic string, if any, for `/model/status`.
    pub fn diagnostics(&self) -> Option<String> {
        self.model.as_ref().and_then(|m| m.diagnostics())
    }

    pub fn classify(&self, domain: &str) -> Classification {
        let normalized = normalize(domain);

        if let Some(model) = &self.model {
            match model.infer(&normalized) {
                Ok(score) => {
                    let score = round4(score.clamp(0.0, 1.0));
                    return Classification {
                        label: Label::from_score(score),
                        score,
                        features: HashMap::new(),
                        source: "model",
                    };
                }
                Err(e) => {
                    log::warn!("[classifier] model inference failed for {domain}: {e}, falling back to heuristic");
                    let mut c = heuristic_classify(&normalized);
                    c.source = "heuristic_fallback";
                    return c;
                }
            }
        }

        heuristic_classify(&normalized)
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

fn round4(score: f64) -> f64 {
    (score * 10000.0).round() / 10000.0
}

/// Deterministic heuristic scorer, applied to the leftmost label
/// (everything before the first `.`).
fn heuristic_classify(domain: &str) -> Classification {
    let payload = domain.split('.').next().unwrap_or(domain);
    let l = payload.chars().count();
    let h = shannon_entropy(payload);
    let digits = payload.chars().filter(|c| c.is_ascii_digit()).count();
    let vowels = payload.chars().filter(|c| "aeiou".contains(*c)).count();
    let d = if l > 0 { digits as f64 / l as f64 } else { 0.0 };
    let v = if l > 0 { vowels as f64 / l as f64 } else { 0.0 };

    let h_term = if h > 3.5 {
        0.4
    } else if h > 2.5 {
        0.2
    } else {
        0.0
    };
    let l_term = if l > 20 {
        0.3
    } else if l > 12 {
        0.1
    } else {
        0.0
    };
    let d_term = if d > 0.3 { 0.3 } else { 0.0 };
    let v_term = if v < 0.15 { 0.2 } else { 0.0 };

    let score = round4((h_term + l_term + d_term + v_term).clamp(0.0, 0.99));

    let mut features = HashMap::new();
    features.insert("length".to_string(), l as f64);
    features.insert("entropy".to_string(), h);
    features.insert("digit_ratio".to_string(), d);
    features.insert("vowel_ratio".to_string(), v);

    Classification {
        label: Label::from_score(score),
        score,
        features,
        source: "heuristic",
    }
}

fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let len = s.chars().count() as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_on_long_high_entropy_label_blocks() {
        // 24-char label, no repeats, low vowel ratio: length and digit and
        // vowel terms alone already clear the BLOCK threshold regardless of
        // the exact entropy bucket.
        let c = Classifier::new(None);
        let result = c.classify("x82j9q71snfla0358dkqpzwy.example.com");
        assert_eq!(result.source, "heuristic");
        assert!(result.score >= 0.9, "expected high score, got {}", result.score);
        assert_eq!(result.label, Label::Malicious);
    }

    #[test]
    fn heuristic_on_benign_label_allows() {
        let c = Classifier::new(None);
        let result = c.classify("google.com");
        assert_eq!(result.score, 0.0);
        assert_eq!(result.label, Label::Benign);
    }

    #[test]
    fn model_inference_error_falls_back_to_heuristic() {
        struct Failing;
        impl ModelPipeline for Failing {
            fn infer(&self, _domain: &str) -> Result<f64, String> {
                Err("artifact corrupt".to_string())
            }
        }
        let c = Classifier::new(Some(Box::new(Failing)));
        let result = c.classify("google.com");
        assert_eq!(result.source, "heuristic_fallback");
    }

    #[test]
    fn model_success_reports_model_source() {
        struct Fixed(f64);
        impl ModelPipeline for Fixed {
            fn infer(&self, _domain: &str) -> Result<f64, String> {
                Ok(self.0)
            }
        }
        let c = Classifier::new(Some(Box::new(Fixed(0.42))));
        let result = c.classify("anything.test");
        assert_eq!(result.source, "model");
        assert_eq!(result.score, 0.42);
    }

    #[test]
    fn score_rounds_to_four_decimals() {
        struct Fixed(f64);
        impl ModelPipeline for Fixed {
            fn infer(&self, _domain: &str) -> Result<f64, String> {
                Ok(self.0)
            }
        }
        let c = Classifier::new(Some(Box::new(Fixed(0.123456))));
        let result = c.classify("anything.test");
        assert_eq!(result.score, 0.1235);
    }
}
