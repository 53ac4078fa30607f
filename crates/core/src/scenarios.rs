//! Static scenario catalog, loaded once at startup.

use std::path::Path;

use dispatchsim_protocol::ScenarioDescriptor;
use tracing::info;

use crate::error::{CatalogError, SessionError};

const EMBEDDED_CATALOG: &str = include_str!("../resources/scenarios.json");

#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    scenarios: Vec<ScenarioDescriptor>,
}

impl ScenarioCatalog {
    pub fn embedded() -> Result<Self, CatalogError> {
        Self::from_json(EMBEDDED_CATALOG)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let scenarios: Vec<ScenarioDescriptor> = serde_json::from_str(json)?;
        if scenarios.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { scenarios })
    }

    /// Load `override_path` when it exists, otherwise the built-in catalog.
    pub fn load(override_path: Option<&Path>) -> Result<Self, CatalogError> {
        if let Some(path) = override_path.filter(|p| p.exists()) {
            let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let catalog = Self::from_json(&json)?;
            info!(
                component = "catalog",
                event = "catalog.loaded",
                source = %path.display(),
                scenarios = catalog.scenarios.len(),
                "Loaded scenario catalog override"
            );
            return Ok(catalog);
        }
        Self::embedded()
    }

    pub fn all(&self) -> &[ScenarioDescriptor] {
        &self.scenarios
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Entries whose event type matches, case-insensitively.
    pub fn by_event_type<'a>(
        &'a self,
        event_type: &'a str,
    ) -> impl Iterator<Item = &'a ScenarioDescriptor> + 'a {
        self.scenarios
            .iter()
            .filter(move |s| s.event_type.eq_ignore_ascii_case(event_type.trim()))
    }

    /// Validate a scenario selection.
    ///
    /// A code can appear more than once with different subtypes; the first
    /// entry allowing the requested subtype wins.
    pub fn resolve(
        &self,
        code: &str,
        subtype: Option<&str>,
    ) -> Result<&ScenarioDescriptor, SessionError> {
        let code = code.trim();
        let mut candidates = self
            .scenarios
            .iter()
            .filter(|s| s.code.eq_ignore_ascii_case(code))
            .peekable();

        if candidates.peek().is_none() {
            return Err(SessionError::Validation(format!(
                "Unknown scenario code '{code}'"
            )));
        }

        match subtype.map(str::trim).filter(|s| !s.is_empty()) {
            None => candidates
                .next()
                .ok_or_else(|| SessionError::Validation(format!("Unknown scenario code '{code}'"))),
            Some(subtype) => candidates.find(|s| s.allows_subtype(subtype)).ok_or_else(|| {
                SessionError::Validation(format!(
                    "Subtype '{subtype}' is not available for scenario {code}"
                ))
            }),
        }
    }
}
