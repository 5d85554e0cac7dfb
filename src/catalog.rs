//! Model metadata, static model tables and token-limit lookup.

use serde::{Deserialize, Serialize};

/// Static description of a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    pub id: String,
    pub name: String,
    pub default_base_url: String,
    pub icon: String,
}

/// What kind of model an entry describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Embedding,
    Image,
    Audio,
    Other,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub vision: bool,
    pub pdf_input: bool,
    pub tool_calling: bool,
    pub web_search: bool,
    pub reasoning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenLimits {
    pub max_total_tokens: u32,
    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
    /// Conversation size at which a host should start summarizing history.
    pub recommended_summary_threshold: u32,
}

impl TokenLimits {
    /// Limits for a model with a shared context window of `context` tokens of
    /// which up to `max_output` may be generated.
    pub const fn new(context: u32, max_output: u32) -> Self {
        let max_input = context.saturating_sub(max_output);
        Self {
            max_total_tokens: context,
            max_input_tokens: max_input,
            max_output_tokens: max_output,
            recommended_summary_threshold: max_input / 4 * 3,
        }
    }

    /// Limits for a model whose input and output budgets are separate.
    pub const fn split(max_input: u32, max_output: u32) -> Self {
        Self {
            max_total_tokens: max_input + max_output,
            max_input_tokens: max_input,
            max_output_tokens: max_output,
            recommended_summary_threshold: max_input / 4 * 3,
        }
    }
}

/// One model as listed by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetaData {
    pub id: String,
    pub display_name: String,
    pub icon: String,
    pub model_type: ModelType,
    pub capabilities: Capabilities,
    pub token_limits: TokenLimits,
}

/// A row of a backend's static model table.
#[derive(Debug, Clone, Copy)]
pub struct KnownModel {
    /// User-facing name.
    pub alias: &'static str,
    /// Identifier the API expects.
    pub api_id: &'static str,
    pub display_name: &'static str,
    pub model_type: ModelType,
    pub capabilities: Capabilities,
    pub limits: TokenLimits,
}

impl KnownModel {
    pub fn to_metadata(&self, icon: &str) -> ModelMetaData {
        let mut capabilities = self.capabilities;
        capabilities.max_context = Some(self.limits.max_total_tokens);
        ModelMetaData {
            id: self.alias.to_string(),
            display_name: self.display_name.to_string(),
            icon: icon.to_string(),
            model_type: self.model_type,
            capabilities,
            token_limits: self.limits,
        }
    }
}

/// Capability shorthand for the static tables.
pub const fn caps(vision: bool, tool_calling: bool, reasoning: bool) -> Capabilities {
    Capabilities {
        vision,
        pdf_input: false,
        tool_calling,
        web_search: false,
        reasoning,
        max_context: None,
    }
}

/// Map a user-facing alias to the API model id. Unknown names pass through.
pub fn resolve_alias(table: &[KnownModel], model: &str) -> String {
    table
        .iter()
        .find(|m| m.alias == model)
        .map(|m| m.api_id.to_string())
        .unwrap_or_else(|| model.to_string())
}

/// Find the table row describing `model`.
///
/// Tried in order:
/// 1. exact match on alias or API id;
/// 2. the same after stripping a vendor prefix (`openai/gpt-4o` -> `gpt-4o`);
/// 3. the longest alias or API id that prefixes the name and ends on a `-`,
///    `:`, `@` or the end of the name, so `gpt-4o-mini-2024-07-18` lands on
///    `gpt-4o-mini` and never on `gpt-4`.
pub fn find_model<'a>(table: &'a [KnownModel], model: &str) -> Option<&'a KnownModel> {
    let exact = |name: &str| table.iter().find(|m| m.alias == name || m.api_id == name);

    if let Some(found) = exact(model) {
        return Some(found);
    }
    let bare = model.rsplit('/').next().unwrap_or(model);
    if let Some(found) = exact(bare) {
        return Some(found);
    }

    table
        .iter()
        .flat_map(|m| [(m.alias, m), (m.api_id, m)])
        .filter(|(key, _)| is_boundary_prefix(key, bare))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, m)| m)
}

fn is_boundary_prefix(key: &str, name: &str) -> bool {
    if key.is_empty() || !name.starts_with(key) {
        return false;
    }
    matches!(name[key.len()..].chars().next(), None | Some('-' | ':' | '@'))
}

/// Token limits for `model`, or `default` when the table has no match.
pub fn lookup_limits(table: &[KnownModel], model: &str, default: TokenLimits) -> TokenLimits {
    find_model(table, model).map(|m| m.limits).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[KnownModel] = &[
        KnownModel {
            alias: "gpt-4",
            api_id: "gpt-4",
            display_name: "GPT-4",
            model_type: ModelType::Llm,
            capabilities: caps(false, true, false),
            limits: TokenLimits::new(8_192, 4_096),
        },
        KnownModel {
            alias: "gpt-4o",
            api_id: "gpt-4o",
            display_name: "GPT-4o",
            model_type: ModelType::Llm,
            capabilities: caps(true, true, false),
            limits: TokenLimits::new(128_000, 16_384),
        },
        KnownModel {
            alias: "gpt-4o-mini",
            api_id: "gpt-4o-mini",
            display_name: "GPT-4o mini",
            model_type: ModelType::Llm,
            capabilities: caps(true, true, false),
            limits: TokenLimits::new(128_000, 16_000),
        },
        KnownModel {
            alias: "claude-sonnet-4",
            api_id: "claude-sonnet-4-20250514",
            display_name: "Claude Sonnet 4",
            model_type: ModelType::Llm,
            capabilities: caps(true, true, true),
            limits: TokenLimits::new(200_000, 64_000),
        },
    ];

    const DEFAULT: TokenLimits = TokenLimits::new(4_096, 1_024);

    #[test]
    fn test_exact_alias_and_api_id() {
        assert_eq!(find_model(TABLE, "claude-sonnet-4").unwrap().display_name, "Claude Sonnet 4");
        assert_eq!(
            find_model(TABLE, "claude-sonnet-4-20250514").unwrap().display_name,
            "Claude Sonnet 4"
        );
    }

    #[test]
    fn test_longest_boundary_prefix() {
        let limits = lookup_limits(TABLE, "gpt-4o-mini-2024-07-18", DEFAULT);
        assert_eq!(limits.max_output_tokens, 16_000);
        let limits = lookup_limits(TABLE, "gpt-4o-2024-08-06", DEFAULT);
        assert_eq!(limits.max_output_tokens, 16_384);
    }

    #[test]
    fn test_prefix_needs_boundary() {
        // "gpt-4" is a prefix of "gpt-4turbo" but not at a separator.
        assert_eq!(lookup_limits(TABLE, "gpt-4turbo", DEFAULT), DEFAULT);
    }

    #[test]
    fn test_vendor_prefix_is_stripped() {
        assert_eq!(lookup_limits(TABLE, "openai/gpt-4o", DEFAULT).max_total_tokens, 128_000);
    }

    #[test]
    fn test_unknown_gets_default() {
        assert_eq!(lookup_limits(TABLE, "mystery-model", DEFAULT), DEFAULT);
        assert_eq!(lookup_limits(TABLE, "", DEFAULT), DEFAULT);
    }

    #[test]
    fn test_alias_resolution_passes_unknown_through() {
        assert_eq!(resolve_alias(TABLE, "claude-sonnet-4"), "claude-sonnet-4-20250514");
        assert_eq!(resolve_alias(TABLE, "claude-opus-9"), "claude-opus-9");
    }

    #[test]
    fn test_summary_threshold() {
        let limits = TokenLimits::new(128_000, 16_000);
        assert_eq!(limits.max_input_tokens, 112_000);
        assert_eq!(limits.recommended_summary_threshold, 84_000);
    }
}
