//! Per-million-token pricing used for cost estimation.
//!
//! Resolution order at runtime: hook-provided pricing → custom-provider
//! snapshot → this built-in fallback table → zero.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// USD per million input/output tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    /// Estimated cost in USD for a (input, output) token pair.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_mtok
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_mtok
    }
}

/// Immutable pricing snapshot: custom entries layered over a built-in
/// fallback table. Keys are `"provider/model_id"`; fallback entries may use
/// a model-id prefix (longest prefix wins).
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    custom: HashMap<String, ModelPricing>,
}

/// Built-in fallback prices. Deliberately coarse — real deployments supply
/// exact prices through the pricing hook or the admin snapshot.
const FALLBACK: &[(&str, &str, ModelPricing)] = &[
    ("anthropic", "claude-opus", ModelPricing::new(15.0, 75.0)),
    ("anthropic", "claude-sonnet", ModelPricing::new(3.0, 15.0)),
    ("anthropic", "claude-haiku", ModelPricing::new(0.8, 4.0)),
    ("openai", "gpt-4o-mini", ModelPricing::new(0.15, 0.6)),
    ("openai", "gpt-4o", ModelPricing::new(2.5, 10.0)),
    ("openai", "gpt-4.1", ModelPricing::new(2.0, 8.0)),
    ("google", "gemini-1.5-pro", ModelPricing::new(1.25, 5.0)),
    ("google", "gemini-1.5-flash", ModelPricing::new(0.075, 0.3)),
];

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer custom `"provider/model"` entries over the fallback table.
    pub fn with_custom(entries: HashMap<String, ModelPricing>) -> Self {
        Self { custom: entries }
    }

    pub fn insert(&mut self, provider: &str, model_id: &str, pricing: ModelPricing) {
        self.custom
            .insert(format!("{provider}/{model_id}"), pricing);
    }

    /// Look up pricing for a model. Custom entries match exactly; fallback
    /// entries match on model-id prefix so dated releases resolve to their
    /// family (longest prefix wins).
    pub fn lookup(&self, provider: &str, model_id: &str) -> Option<ModelPricing> {
        if let Some(p) = self.custom.get(&format!("{provider}/{model_id}")) {
            return Some(*p);
        }
        FALLBACK
            .iter()
            .filter(|(prov, prefix, _)| *prov == provider && model_id.starts_with(prefix))
            .max_by_key(|(_, prefix, _)| prefix.len())
            .map(|(_, _, p)| *p)
    }

    /// Like [`lookup`] but zero-priced when unknown, for call sites that
    /// must always produce a number.
    pub fn lookup_or_zero(&self, provider: &str, model_id: &str) -> ModelPricing {
        self.lookup(provider, model_id)
            .unwrap_or(ModelPricing::new(0.0, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_cost_scales_per_million() {
        let p = ModelPricing::new(3.0, 15.0);
        let cost = p.estimate_cost(1_000_000, 2_000_000);
        assert!((cost - 33.0).abs() < 1e-9);
    }

    #[test]
    fn fallback_prefix_match() {
        let table = PricingTable::new();
        let p = table.lookup("anthropic", "claude-sonnet-4-20260115").unwrap();
        assert_eq!(p, ModelPricing::new(3.0, 15.0));
        assert!(table.lookup("anthropic", "unknown-model").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = PricingTable::new();
        // "gpt-4o-mini-2026" must resolve to gpt-4o-mini, not gpt-4o.
        let p = table.lookup("openai", "gpt-4o-mini-2026").unwrap();
        assert_eq!(p, ModelPricing::new(0.15, 0.6));
    }

    #[test]
    fn custom_overrides_fallback() {
        let mut table = PricingTable::new();
        table.insert("anthropic", "claude-sonnet-4", ModelPricing::new(1.0, 2.0));
        let p = table.lookup("anthropic", "claude-sonnet-4").unwrap();
        assert_eq!(p, ModelPricing::new(1.0, 2.0));
    }

    #[test]
    fn unknown_model_is_zero_priced() {
        let table = PricingTable::new();
        let p = table.lookup_or_zero("acme", "frontier-1");
        assert_eq!(p.estimate_cost(1_000_000, 1_000_000), 0.0);
    }
}
