use serde::{Deserialize, Serialize};

use kiln_codegen::{BackendKind, MatchOptions, UnreachableRows};

/// Compiler switches. Every toggle defaults to off.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Inline small global functions at their call sites.
    pub enable_module_inlining: bool,
    /// Lower matches to a row table walked at run time.
    pub build_interpreted_matches: bool,
    /// Reject matches with an arm no value can reach.
    pub require_match_reachability: bool,
    /// Use a jump table for every match over one primitive scrutinee.
    pub always_lower_prim_match_tables: bool,
    /// Lower matches through a decision tree.
    pub build_columnwise_matches: bool,
    pub backend: BackendKind,
}

impl CompilerConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        // A struct of plain booleans and a unit enum always serialises.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub(crate) fn match_options(&self, sink: Option<&UnreachableRows>) -> MatchOptions {
        MatchOptions {
            interpreted: self.build_interpreted_matches,
            column_wise: self.build_columnwise_matches,
            force_tables: self.always_lower_prim_match_tables,
            require_reachability: self.require_match_reachability,
            unreachable_sink: sink.cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let config = CompilerConfig {
            build_columnwise_matches: true,
            require_match_reachability: true,
            ..CompilerConfig::default()
        };
        let back = CompilerConfig::from_json(&config.to_json()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_fields_default_to_off() {
        let config = CompilerConfig::from_json(r#"{ "enable_module_inlining": true }"#).unwrap();
        assert!(config.enable_module_inlining);
        assert!(!config.build_interpreted_matches);
        assert_eq!(config.backend, BackendKind::Cranelift);
    }

    #[test]
    fn default_serialises_every_toggle() {
        insta::assert_snapshot!(CompilerConfig::default().to_json(), @r#"
        {
          "enable_module_inlining": false,
          "build_interpreted_matches": false,
          "require_match_reachability": false,
          "always_lower_prim_match_tables": false,
          "build_columnwise_matches": false,
          "backend": "cranelift"
        }
        "#);
    }
}
