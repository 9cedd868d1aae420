use crate::models::ExtractedReceipt;

/// Decides, once per extraction, whether a human has to look at the receipt
pub trait ReviewPolicy: Send + Sync {
    /// `Some(reason)` routes the receipt to `review_required`
    fn review_reason(&self, extraction: &ExtractedReceipt) -> Option<String>;
}

/// Review whenever a required field is missing or a field was dropped as mistyped
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFieldsPolicy;

impl ReviewPolicy for RequiredFieldsPolicy {
    fn review_reason(&self, extraction: &ExtractedReceipt) -> Option<String> {
        if !extraction.missing_required.is_empty() {
            return Some(format!("missing required fields: {}", extraction.missing_required.join(", ")));
        }
        if !extraction.issues.is_empty() {
            return Some(format!("unusable fields: {}", extraction.issues.join("; ")));
        }
        None
    }
}

/// Review when the provider reports a confidence below the threshold.
/// An absent confidence is not a reason on its own.
#[derive(Debug, Clone, Copy)]
pub struct MinConfidencePolicy {
    pub min_confidence: f64,
}

impl ReviewPolicy for MinConfidencePolicy {
    fn review_reason(&self, extraction: &ExtractedReceipt) -> Option<String> {
        match extraction.confidence {
            Some(c) if c < self.min_confidence => Some(format!(
                "confidence {:.2} below {:.2}",
                c, self.min_confidence
            )),
            _ => None,
        }
    }
}

/// First policy that asks for review wins
#[derive(Default)]
pub struct CompositePolicy {
    policies: Vec<Box<dyn ReviewPolicy>>,
}

impl CompositePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl ReviewPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    /// Required fields always, confidence only when configured
    pub fn standard(min_confidence: Option<f64>) -> Self {
        let policy = Self::new().with(RequiredFieldsPolicy);
        match min_confidence {
            Some(min_confidence) => policy.with(MinConfidencePolicy { min_confidence }),
            None => policy,
        }
    }
}

impl ReviewPolicy for CompositePolicy {
    fn review_reason(&self, extraction: &ExtractedReceipt) -> Option<String> {
        self.policies.iter().find_map(|p| p.review_reason(extraction))
    }
}
