//! Module kinds and the library configuration of the signature manager factory.
use crate::agent_error::{AgentError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A family of cryptographic modules the agent can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleKind {
    /// SoftHSM, or any module that follows the PKCS#11 standard without vendor extensions.
    #[serde(rename = "SoftHSM")]
    SoftHsm,
}

impl ModuleKind {
    /// The configuration name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::SoftHsm => "SoftHSM",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SoftHSM" => Ok(ModuleKind::SoftHsm),
            other => Err(AgentError::new(
                ErrorKind::InvalidArgument,
                format!("unsupported module kind '{}'", other),
            )),
        }
    }
}

/// The PKCS#11 library backing each module kind, as read from the service configuration.
///
/// ```json
/// { "modules": { "SoftHSM": "/usr/local/lib/softhsm/libsofthsm2.so" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Library path per module kind.
    #[serde(default)]
    pub modules: BTreeMap<ModuleKind, PathBuf>,
}

impl FactoryConfig {
    /// Adds or replaces the library of `kind`.
    pub fn with_module(mut self, kind: ModuleKind, library: impl Into<PathBuf>) -> Self {
        self.modules.insert(kind, library.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_kind_names() {
        assert_eq!("SoftHSM".parse::<ModuleKind>().unwrap(), ModuleKind::SoftHsm);
        assert_eq!(ModuleKind::SoftHsm.to_string(), "SoftHSM");
        let err = "Luna".parse::<ModuleKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.message(), "unsupported module kind 'Luna'");
    }

    #[test]
    fn deserializes_from_json() {
        let config: FactoryConfig = serde_json::from_str(
            r#"{ "modules": { "SoftHSM": "/usr/local/lib/softhsm/libsofthsm2.so" } }"#,
        )
        .expect("Failed to deserialize");
        assert_eq!(
            config,
            FactoryConfig::default()
                .with_module(ModuleKind::SoftHsm, "/usr/local/lib/softhsm/libsofthsm2.so")
        );

        let empty: FactoryConfig = serde_json::from_str("{}").expect("Failed to deserialize");
        assert!(empty.modules.is_empty());
        let unknown = r#"{ "modules": { "Luna": "/x.so" } }"#;
        assert!(serde_json::from_str::<FactoryConfig>(unknown).is_err());
    }
}
