//! Cache key derivation
//!
//! A [`CacheKey`] is the SHA-256 of the normalized prompt, the selection
//! identity, the options that change the output, and a hash of the context.
//! Fields are length-prefixed before hashing so adjacent fields cannot run
//! into each other. Matching is exact.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::InferenceRequest;
use crate::routing::selector::SelectionStrategy;

/// Exact-match cache key (hex SHA-256)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for `request` when served under `selection`
    ///
    /// `selection` is the model the caller asked for, or the strategy label
    /// when the router picks.
    #[must_use]
    pub fn derive(request: &InferenceRequest, selection: &str) -> Self {
        let options = request.options();
        let constraints = request.constraints();

        let mut hasher = Sha256::new();
        put(&mut hasher, normalize_prompt(request.prompt()).as_bytes());
        put(&mut hasher, selection.as_bytes());
        put(&mut hasher, &options.max_tokens.unwrap_or(0).to_be_bytes());
        put(
            &mut hasher,
            &options.temperature.map_or(u32::MAX, f32::to_bits).to_be_bytes(),
        );
        let caps: Vec<String> = options
            .required_capabilities
            .iter()
            .map(|c| format!("{c:?}"))
            .collect();
        put(&mut hasher, caps.join(",").as_bytes());
        put(
            &mut hasher,
            &constraints.budget_limit.map_or(u64::MAX, f64::to_bits).to_be_bytes(),
        );
        put(
            &mut hasher,
            &constraints
                .quality_threshold
                .map_or(u64::MAX, f64::to_bits)
                .to_be_bytes(),
        );
        put(
            &mut hasher,
            &constraints.max_latency_ms.unwrap_or(u64::MAX).to_be_bytes(),
        );
        put(&mut hasher, &context_hash(options.context.as_deref()));

        Self(hex::encode(hasher.finalize()))
    }

    /// Key for `request` using the router's selection identity
    #[must_use]
    pub fn for_request(request: &InferenceRequest, strategy: SelectionStrategy) -> Self {
        match request.options().model_hint.as_deref() {
            Some(model) => Self::derive(request, model),
            None => Self::derive(request, &format!("auto:{strategy}")),
        }
    }

    /// Key to store a response under once `served_by` answered it
    ///
    /// A hinted key only ever holds the hinted model's output; responses from
    /// any other model are stored under the strategy's key.
    #[must_use]
    pub fn for_response(request: &InferenceRequest, strategy: SelectionStrategy, served_by: &str) -> Self {
        match request.options().model_hint.as_deref() {
            Some(model) if model != served_by => Self::derive(request, &format!("auto:{strategy}")),
            _ => Self::for_request(request, strategy),
        }
    }

    /// Wrap a key read back from storage
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex form, also used as the persistent store key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.get(..16).unwrap_or(&self.0))
    }
}

/// Trim and collapse whitespace runs; case is preserved
#[must_use]
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn context_hash(context: Option<&str>) -> [u8; 32] {
    let mut out = [0; 32];
    if let Some(c) = context.filter(|c| !c.is_empty()) {
        out.copy_from_slice(&Sha256::digest(c.as_bytes()));
    }
    out
}

fn put(hasher: &mut Sha256, field: &[u8]) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field);
}
