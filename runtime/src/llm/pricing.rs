//! Cost, energy, and carbon accounting for LLM calls.
//!
//! Per-million-token rates are selected by prefix match on the model name;
//! energy scales per-token with a model-class constant and carbon assumes
//! the 500 g/kWh global grid average.

use fabric_contracts::ResourceUsage;

const CARBON_GRAMS_PER_KWH: f64 = 500.0;

/// (input, output) cents per million tokens.
fn rates_for(model: &str) -> (f64, f64) {
    let lowered = model.to_lowercase();
    if model.starts_with("gpt-4o-mini") {
        (15.0, 60.0)
    } else if model.starts_with("gpt-4o") {
        (250.0, 1000.0)
    } else if model.starts_with("gpt-4-turbo") {
        (1000.0, 3000.0)
    } else if model.starts_with("gpt-3.5-turbo") {
        (50.0, 150.0)
    } else if lowered.contains("llama") {
        (10.0, 10.0)
    } else if lowered.contains("claude") {
        (300.0, 1500.0)
    } else {
        (20.0, 20.0)
    }
}

/// kWh per thousand tokens for the model class.
fn energy_rate_for(model: &str) -> f64 {
    let lowered = model.to_lowercase();
    if lowered.contains("llama") && model.contains("17B") {
        0.0002
    } else if model.contains("gpt-4") {
        0.0005
    } else {
        0.0003
    }
}

/// Build the full usage record for one call.
pub fn usage_for(model: &str, prompt_tokens: u64, completion_tokens: u64) -> ResourceUsage {
    let (input_rate, output_rate) = rates_for(model);
    let input_cost_cents = prompt_tokens as f64 / 1_000_000.0 * input_rate;
    let output_cost_cents = completion_tokens as f64 / 1_000_000.0 * output_rate;

    let total_tokens = prompt_tokens + completion_tokens;
    let energy_kwh = total_tokens as f64 / 1000.0 * energy_rate_for(model);

    ResourceUsage {
        tokens_used: total_tokens,
        tokens_input: prompt_tokens,
        tokens_output: completion_tokens,
        cost_cents: input_cost_cents + output_cost_cents,
        energy_kwh,
        carbon_grams: energy_kwh * CARBON_GRAMS_PER_KWH,
        model_used: Some(model.to_string()),
    }
}
