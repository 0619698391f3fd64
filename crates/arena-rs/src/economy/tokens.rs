//! Token budget accounting: LLM usage charges and hint purchases.

use crate::model::{Participant, Rules};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Raw token counts reported by a provider for one call.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// What one [`charge_tokens`] call did to a participant's budget.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TokenCharge {
    pub raw: TokenUsage,
    pub adjusted_prompt_tokens: u64,
    pub adjusted_completion_tokens: u64,
    /// Tokens actually removed from the budget (less than the adjusted sum
    /// when the budget hit zero).
    pub deducted: u64,
    pub remaining_tokens: u64,
}

impl TokenCharge {
    pub fn adjusted_total(&self) -> u64 {
        self.adjusted_prompt_tokens
            .saturating_add(self.adjusted_completion_tokens)
    }

    pub fn exhausted(&self) -> bool {
        self.remaining_tokens == 0
    }
}

/// `floor(raw * multiplier)`, multiplier 1 when the model has none.
pub fn adjust(raw: u64, multiplier: Option<f64>) -> u64 {
    let m = multiplier.unwrap_or(1.0);
    if !m.is_finite() || m <= 0.0 {
        return 0;
    }
    (raw as f64 * m).floor() as u64
}

/// Charge one LLM call to `participant`. The budget is clamped at zero.
pub fn charge_tokens(
    participant: &mut Participant,
    usage: TokenUsage,
    model_id: &str,
    rules: &Rules,
) -> TokenCharge {
    let prompt = adjust(
        usage.prompt_tokens,
        rules.input_token_multipliers.get(model_id).copied(),
    );
    let completion = adjust(
        usage.completion_tokens,
        rules.output_token_multipliers.get(model_id).copied(),
    );
    let total = prompt.saturating_add(completion);
    let deducted = total.min(participant.remaining_tokens);
    participant.remaining_tokens -= deducted;
    participant.llm_tokens = participant.llm_tokens.saturating_add(total);

    debug!(
        participant = %participant.id,
        model = model_id,
        "Charged {total} tokens (raw {}+{}, adjusted {prompt}+{completion}), {} remaining",
        usage.prompt_tokens,
        usage.completion_tokens,
        participant.remaining_tokens
    );

    TokenCharge {
        raw: usage,
        adjusted_prompt_tokens: prompt,
        adjusted_completion_tokens: completion,
        deducted,
        remaining_tokens: participant.remaining_tokens,
    }
}

/// Result of asking for a hint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HintDecision {
    Granted { level: u8, cost: u64, remaining_tokens: u64 },
    /// Not enough budget; nothing was charged.
    Denied { level: u8, cost: u64, remaining_tokens: u64 },
    UnknownLevel { level: u8 },
}

impl HintDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, HintDecision::Granted { .. })
    }
}

/// Charge the level's hint cost if the budget covers it.
pub fn grant_hint(participant: &mut Participant, level: u8, rules: &Rules) -> HintDecision {
    let Some(cost) = rules.hint_cost(level) else {
        return HintDecision::UnknownLevel { level };
    };
    if participant.remaining_tokens < cost {
        info!(
            participant = %participant.id,
            "Hint level {level} denied: costs {cost}, {} remaining",
            participant.remaining_tokens
        );
        return HintDecision::Denied {
            level,
            cost,
            remaining_tokens: participant.remaining_tokens,
        };
    }
    participant.remaining_tokens -= cost;
    participant.hint_tokens = participant.hint_tokens.saturating_add(cost);
    debug!(participant = %participant.id, "Hint level {level} granted for {cost} tokens");
    HintDecision::Granted {
        level,
        cost,
        remaining_tokens: participant.remaining_tokens,
    }
}
