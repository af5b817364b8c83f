//! Native modules scripts may import, and the table deciding which of their
//! attributes are reachable.

mod encoding;
mod json;
mod math;
mod pattern;
mod random;
mod time;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::limits::RuntimeLimits;
use crate::runtime::{Exception, Value};

pub(crate) use pattern::PatternCache;

/// A module implemented by the engine.
///
/// Modules are stateless and shared by every call; per-call state lives in
/// the [`ModuleContext`].
pub(crate) trait NativeModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every attribute the module implements, constants included
    fn exports(&self) -> &'static [&'static str];

    fn constant(&self, _name: &str) -> Option<Value> {
        None
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        cx: &mut ModuleContext<'_>,
    ) -> Result<Value, Exception>;
}

/// Per-call state available to module functions
pub(crate) struct ModuleContext<'a> {
    pub limits: &'a RuntimeLimits,
    pub patterns: &'a mut PatternCache,
    pub deadline: Instant,
}

/// Names of the modules the engine implements.
pub const NATIVE_MODULES: [&str; 6] = ["base64", "json", "math", "random", "re", "time"];

pub(crate) fn native(name: &str) -> Option<Arc<dyn NativeModule>> {
    let module: Arc<dyn NativeModule> = match name {
        "base64" => Arc::new(encoding::Base64Module),
        "json" => Arc::new(json::JsonModule),
        "math" => Arc::new(math::MathModule),
        "random" => Arc::new(random::RandomModule),
        "re" => Arc::new(pattern::PatternModule),
        "time" => Arc::new(time::TimeModule),
        _ => return None,
    };
    Some(module)
}

fn unknown_attribute(module: &str, name: &str) -> Exception {
    Exception::attribute_error(format!("module '{module}' has no attribute '{name}'"))
}

// ============================================================================
// Allowed-module table
// ============================================================================

/// `[modules]` config section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleTableConfig {
    pub version: Option<u32>,
    /// Module name to permitted attributes. Absent means every native module
    /// with all of its attributes.
    pub allow: Option<BTreeMap<String, Vec<String>>>,
}

/// Fixed, versioned mapping of module name to permitted attribute names.
///
/// Built once at startup and shared read-only by every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedModuleTable {
    version: u32,
    modules: BTreeMap<String, BTreeSet<String>>,
}

impl AllowedModuleTable {
    /// Every native module with its full attribute list
    pub fn builtin() -> Self {
        let modules = NATIVE_MODULES
            .iter()
            .filter_map(|name| native(name))
            .map(|m| {
                let attrs = m.exports().iter().map(|a| a.to_string()).collect();
                (m.name().to_string(), attrs)
            })
            .collect();
        Self {
            version: 1,
            modules,
        }
    }

    pub fn from_config(config: &ModuleTableConfig) -> Result<Self, ConfigError> {
        let Some(allow) = &config.allow else {
            let mut table = Self::builtin();
            table.version = config.version.unwrap_or(table.version);
            return Ok(table);
        };

        let mut modules = BTreeMap::new();
        for (name, attrs) in allow {
            let module = native(name).ok_or_else(|| ConfigError::UnknownModule(name.clone()))?;
            let exports = module.exports();
            let mut permitted = BTreeSet::new();
            for attr in attrs {
                if !exports.contains(&attr.as_str()) {
                    return Err(ConfigError::UnknownAttribute {
                        module: name.clone(),
                        attribute: attr.clone(),
                    });
                }
                permitted.insert(attr.clone());
            }
            modules.insert(name.clone(), permitted);
        }
        Ok(Self {
            version: config.version.unwrap_or(1),
            modules,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn permitted(&self, module: &str) -> Option<&BTreeSet<String>> {
        self.modules.get(module)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Check that every requested module is in the table, returning the
    /// offending names otherwise.
    pub fn check_subset<'a, I>(&self, requested: I) -> Result<(), Vec<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let missing: Vec<String> = requested
            .into_iter()
            .filter(|m| !self.contains(m))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    /// Build the proxy handed to a script that imports `module`.
    pub(crate) fn proxy(&self, module: &str) -> Option<ModuleProxy> {
        let permitted = self.modules.get(module)?.clone();
        let module = native(module)?;
        Some(ModuleProxy { module, permitted })
    }
}

impl Default for AllowedModuleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// What a script holds after `import m`.
///
/// Attribute lookup is an explicit allow check: a name that is not
/// permitted fails exactly like a name the module does not have.
pub(crate) struct ModuleProxy {
    module: Arc<dyn NativeModule>,
    permitted: BTreeSet<String>,
}

impl ModuleProxy {
    pub fn name(&self) -> &'static str {
        self.module.name()
    }

    pub fn attr(&self, name: &str) -> Result<Value, Exception> {
        if !self.permitted.contains(name) || !self.module.exports().contains(&name) {
            return Err(unknown_attribute(self.module.name(), name));
        }
        if let Some(value) = self.module.constant(name) {
            return Ok(value);
        }
        Ok(Value::ModuleFn(std::rc::Rc::new(crate::runtime::ModuleFn {
            module: self.module.clone(),
            name: name.to_string(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_lists_every_native_module() {
        let table = AllowedModuleTable::builtin();
        assert_eq!(table.version(), 1);
        for name in NATIVE_MODULES {
            assert!(table.contains(name), "{name}");
        }
        assert!(table.permitted("re").unwrap().contains("search"));
        assert!(!table.permitted("re").unwrap().contains("compile"));
    }

    #[test]
    fn config_narrows_the_table() {
        let config = ModuleTableConfig {
            version: Some(7),
            allow: Some(BTreeMap::from([(
                "math".to_string(),
                vec!["sqrt".to_string(), "pi".to_string()],
            )])),
        };
        let table = AllowedModuleTable::from_config(&config).unwrap();
        assert_eq!(table.version(), 7);
        assert!(table.contains("math"));
        assert!(!table.contains("json"));
    }

    #[test]
    fn config_rejects_unknown_entries() {
        let bad_module = ModuleTableConfig {
            version: None,
            allow: Some(BTreeMap::from([("os".to_string(), vec![])])),
        };
        assert!(matches!(
            AllowedModuleTable::from_config(&bad_module),
            Err(ConfigError::UnknownModule(_))
        ));

        let bad_attr = ModuleTableConfig {
            version: None,
            allow: Some(BTreeMap::from([(
                "math".to_string(),
                vec!["__dict__".to_string()],
            )])),
        };
        assert!(matches!(
            AllowedModuleTable::from_config(&bad_attr),
            Err(ConfigError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn subset_check_reports_missing_names() {
        let table = AllowedModuleTable::builtin();
        let requested: BTreeSet<String> = ["math", "os", "subprocess"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            table.check_subset(&requested),
            Err(vec!["os".to_string(), "subprocess".to_string()])
        );
    }

    #[test]
    fn denied_and_absent_attributes_fail_identically() {
        let config = ModuleTableConfig {
            version: None,
            allow: Some(BTreeMap::from([("math".to_string(), vec!["sqrt".to_string()])])),
        };
        let table = AllowedModuleTable::from_config(&config).unwrap();
        let proxy = table.proxy("math").unwrap();

        assert!(proxy.attr("sqrt").is_ok());
        let denied = proxy.attr("floor").err().unwrap();
        let absent = proxy.attr("no_such_thing").err().unwrap();
        assert_eq!(denied.kind, absent.kind);
        assert_eq!(
            denied.message.replace("floor", "X"),
            absent.message.replace("no_such_thing", "X")
        );
    }
}
