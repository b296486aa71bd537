//! # Config
//!
//! Engine settings

/// Settings for a [`HookEngine`](crate::entry::HookEngine)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Functions that may never be hooked
    pub deny_list: Vec<String>,
    /// Name prefixes that may never be hooked
    pub denied_prefixes: Vec<String>,
    /// Name reported for functions of the core image in status lines
    pub core_name: String,
}

impl EngineConfig {
    /// Returns the reason `name` can't be hooked, if any
    pub fn check_name(&self, name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("empty function name".to_string());
        }
        if self.deny_list.iter().any(|denied| denied == name) {
            return Err(format!("{name} may not be hooked"));
        }
        if let Some(prefix) = self
            .denied_prefixes
            .iter()
            .find(|prefix| name.starts_with(prefix.as_str()))
        {
            return Err(format!("{name} matches denied prefix {prefix}"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    /// Denies the routines the engine itself runs while patching or reporting
    fn default() -> Self {
        Self {
            deny_list: ["attack_logger", "__clear_cache", "mprotect", "memcpy"]
                .into_iter()
                .map(String::from)
                .collect(),
            denied_prefixes: vec!["funchook_".to_string()],
            core_name: "core".to_string(),
        }
    }
}
