//! The provider factory contract.

use std::sync::Arc;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::LlmConfig;
use chorus_domain::error::Result;

use crate::traits::Provider;

/// Builds configured provider instances for one provider id.
///
/// Factories are registered in the [process-global registry](crate::registry)
/// and looked up by id. The creation path is `validate` → `create`; an
/// invalid config surfaces as `InvalidRequest` before any network work.
pub trait ProviderFactory: Send + Sync {
    /// The registry id ("openai", "anthropic", ...). Case-sensitive.
    fn provider_id(&self) -> &'static str;

    /// Human-readable name for diagnostics.
    fn display_name(&self) -> &'static str;

    /// The operation families providers built by this factory support.
    ///
    /// Advertised per provider family, not per model; runtime error mapping
    /// is the enforcement point for model-level gaps.
    fn capabilities(&self) -> &'static [CapabilityKind];

    /// The factory's default config (base url, model, limits). The builder
    /// merges caller-set fields over these.
    fn defaults(&self) -> LlmConfig;

    /// Check a config for shape problems (missing base url, out-of-range
    /// sampling values). Credential presence is checked at `create`.
    fn validate(&self, config: &LlmConfig) -> Result<()>;

    /// Construct a provider instance from the config.
    fn create(&self, config: &LlmConfig) -> Result<Arc<dyn Provider>>;

    fn supports(&self, kind: CapabilityKind) -> bool {
        self.capabilities().contains(&kind)
    }
}

/// Range checks shared by the built-in factories.
pub(crate) fn validate_sampling(config: &LlmConfig) -> Result<()> {
    use chorus_domain::error::LlmError;

    if let Some(t) = config.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(LlmError::InvalidRequest(format!(
                "temperature {t} out of range [0, 2]"
            )));
        }
    }
    if let Some(p) = config.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(LlmError::InvalidRequest(format!(
                "top_p {p} out of range [0, 1]"
            )));
        }
    }
    if config.max_tokens == Some(0) {
        return Err(LlmError::InvalidRequest("max_tokens must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_ranges() {
        let mut cfg = LlmConfig::default();
        validate_sampling(&cfg).unwrap();

        cfg.temperature = Some(2.5);
        assert!(validate_sampling(&cfg).is_err());
        cfg.temperature = Some(1.0);

        cfg.top_p = Some(1.5);
        assert!(validate_sampling(&cfg).is_err());
        cfg.top_p = Some(0.9);

        cfg.max_tokens = Some(0);
        assert!(validate_sampling(&cfg).is_err());
    }
}
