//! Architectural layers and the import rules between them.
//!
//! Layers are detected from path segments (`src/domain/models/user.ts` is in the
//! domain layer). Import specifiers are pulled out of step content with a few
//! line-oriented patterns; this is a heuristic scan, not a parser.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Domain,
    Data,
    Infra,
    Presentation,
    Main,
}

impl Layer {
    /// Parse a layer name; `infrastructure` normalizes to [`Layer::Infra`].
    pub fn parse(name: &str) -> Option<Layer> {
        match name.trim().to_ascii_lowercase().as_str() {
            "domain" => Some(Layer::Domain),
            "data" => Some(Layer::Data),
            "infra" | "infrastructure" => Some(Layer::Infra),
            "presentation" => Some(Layer::Presentation),
            "main" => Some(Layer::Main),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Domain => "domain",
            Layer::Data => "data",
            Layer::Infra => "infra",
            Layer::Presentation => "presentation",
            Layer::Main => "main",
        }
    }

    /// First path segment naming a layer.
    pub fn from_path(path: &str) -> Option<Layer> {
        path.split(['/', '\\']).find_map(Layer::parse)
    }

    /// Dependency rule: which layers code in `self` may import from.
    pub fn may_import(self, target: Layer) -> bool {
        match self {
            Layer::Domain => target == Layer::Domain,
            Layer::Data => matches!(target, Layer::Domain | Layer::Data),
            Layer::Infra => matches!(target, Layer::Domain | Layer::Data | Layer::Infra),
            Layer::Presentation => matches!(target, Layer::Domain | Layer::Presentation),
            Layer::Main => true,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An import that breaks the layer rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportViolation {
    CrossLayer {
        from: Layer,
        to: Layer,
        module: String,
    },
    ExternalInDomain {
        module: String,
    },
}

impl ImportViolation {
    pub fn is_cross_layer(&self) -> bool {
        matches!(self, ImportViolation::CrossLayer { .. })
    }
}

impl fmt::Display for ImportViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportViolation::CrossLayer { from, to, module } => {
                write!(f, "{from} layer imports {to} layer module '{module}'")
            }
            ImportViolation::ExternalInDomain { module } => {
                write!(f, "domain layer imports external dependency '{module}'")
            }
        }
    }
}

static ES_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[^'"]*?\bfrom\s+)?['"]([^'"]+)['"]"#)
        .expect("es import regex")
});
static REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require regex")
});
static RUST_USE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([A-Za-z_][A-Za-z0-9_:]*)")
        .expect("use regex")
});

/// Module specifiers imported by `content`, in order of appearance per pattern.
pub fn imported_modules(content: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for re in [&*ES_IMPORT, &*REQUIRE] {
        for caps in re.captures_iter(content) {
            modules.push(caps[1].to_string());
        }
    }
    for caps in RUST_USE.captures_iter(content) {
        modules.push(caps[1].replace("::", "/"));
    }
    modules
}

/// True if `module` points outside the project (a package, not a path).
pub fn is_external_module(module: &str) -> bool {
    const INTERNAL_PREFIXES: [&str; 4] = [".", "/", "@/", "~/"];
    const RUST_INTERNAL: [&str; 6] = ["crate", "self", "super", "std", "core", "alloc"];
    if INTERNAL_PREFIXES.iter().any(|p| module.starts_with(p)) {
        return false;
    }
    let first = module.split('/').next().unwrap_or_default();
    if RUST_INTERNAL.contains(&first) {
        return false;
    }
    module_layer(module).is_none()
}

fn module_layer(module: &str) -> Option<Layer> {
    module
        .split('/')
        .filter(|segment| !matches!(*segment, "" | "." | ".." | "@" | "~" | "crate"))
        .find_map(Layer::parse)
}

/// Import rule violations for content living in `layer`.
pub fn import_violations(layer: Layer, content: &str) -> Vec<ImportViolation> {
    let mut violations = Vec::new();
    for module in imported_modules(content) {
        if let Some(target) = module_layer(&module) {
            if !layer.may_import(target) {
                violations.push(ImportViolation::CrossLayer {
                    from: layer,
                    to: target,
                    module,
                });
            }
            continue;
        }
        if layer == Layer::Domain && is_external_module(&module) {
            violations.push(ImportViolation::ExternalInDomain { module });
        }
    }
    violations
}
