use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Resolves `requested` for `capability`, restricted to `provider` when
    /// one is given. Falls back to the first capable model and says why.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
        provider: Option<&str>,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self
                .registry
                .ensure(requested_value, capability)
                .filter(|model| provider.map_or(true, |name| model.provider == name))
            {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = match provider {
            Some(name) => self.registry.by_provider(name, capability),
            None => self.registry.by_capability(capability),
        };
        let Some(model) = candidates.first().cloned() else {
            return Err(match provider {
                Some(name) => format!(
                    "No models available for capability '{capability}' on provider '{name}'."
                ),
                None => format!("No models available for capability '{capability}'."),
            });
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::models::{CAPABILITY_IMAGE, CAPABILITY_STRUCTURED};

    fn model(name: &str, provider: &str, capability: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: vec![capability.to_string()],
            context_window: None,
        }
    }

    #[test]
    fn falls_back_when_requested_model_unavailable() {
        let mut models = IndexMap::new();
        models.insert(
            "image-fallback".to_string(),
            model("image-fallback", "dryrun", CAPABILITY_IMAGE),
        );
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("missing"), CAPABILITY_IMAGE, None)
            .unwrap();
        assert_eq!(selection.model.name, "image-fallback");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for capability 'image'.")
        );
    }

    #[test]
    fn no_request_uses_default_with_explanation() {
        let selection = ModelSelector::new(None)
            .select(None, CAPABILITY_STRUCTURED, None)
            .unwrap();
        assert_eq!(selection.model.name, "gemini-2.5-flash");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn provider_filter_skips_models_of_other_providers() {
        let selector = ModelSelector::new(None);
        let selection = selector
            .select(Some("gemini-2.5-flash-image"), CAPABILITY_IMAGE, Some("dryrun"))
            .unwrap();
        assert_eq!(selection.model.name, "dryrun-image-1");
        assert!(selection.fallback_reason.is_some());

        let err = selector
            .select(None, CAPABILITY_IMAGE, Some("nowhere"))
            .err()
            .unwrap_or_default();
        assert_eq!(
            err,
            "No models available for capability 'image' on provider 'nowhere'."
        );
    }

    #[test]
    fn raises_when_no_models_for_capability() {
        let mut models = IndexMap::new();
        models.insert(
            "text-only".to_string(),
            model("text-only", "dryrun", CAPABILITY_STRUCTURED),
        );
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("gemini-2.5-flash-image"), CAPABILITY_IMAGE, None)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for capability 'image'.");
    }
}
