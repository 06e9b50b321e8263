//! Prompt formatting backed by Tera templates.
//!
//! A formatter turns an arbitrary serializable value into a prompt string.
//! The value is serialized and bound as the template's root context, so a
//! `FlowContext` exposes `text`, `memory`, `variables`, `image_urls` and
//! `think` to the template, with nested map lookup
//! (`{{ variables.user.name }}`) working out of the box.

use std::error::Error as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tera::Tera;

/// Internal name under which the single template is registered in Tera.
const TEMPLATE_NAME: &str = "prompt";

/// A capability that renders a value into a prompt string.
pub trait PromptFormatter: Send + Sync {
    /// Render `value` as the template's root context.
    fn format(&self, value: &Value) -> Result<String, anyhow::Error>;
}

/// Tera-backed prompt formatter.
///
/// Compiled eagerly at construction; parse errors surface immediately.
/// File-based formatters keep the source path so render errors can point at
/// the offending file.
#[derive(Debug, Clone)]
pub struct TemplateFormatter {
    template: String,
    file: Option<PathBuf>,
    tera: Tera,
}

impl TemplateFormatter {
    /// Compile a formatter from a template string.
    pub fn from_string(template: &str) -> Result<Self, anyhow::Error> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, template)
            .map_err(|e| anyhow::anyhow!("template parse error: {}", e))?;
        Ok(Self {
            template: template.to_string(),
            file: None,
            tera,
        })
    }

    /// Read and compile a formatter from a template file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let template = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read template file '{}': {}", path.display(), e)
        })?;
        let mut formatter = Self::from_string(&template)
            .map_err(|e| anyhow::anyhow!("in template file '{}': {}", path.display(), e))?;
        formatter.file = Some(path.to_path_buf());
        Ok(formatter)
    }

    /// The raw template source.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The source file, when the formatter was built from one.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Render any serializable value through the template.
    pub fn format_serializable<T: Serialize>(&self, value: &T) -> Result<String, anyhow::Error> {
        let context = tera::Context::from_serialize(value).map_err(|e| {
            anyhow::anyhow!("template argument is not bindable as a context: {}", e)
        })?;
        self.render(&context)
    }

    fn render(&self, context: &tera::Context) -> Result<String, anyhow::Error> {
        self.tera.render(TEMPLATE_NAME, context).map_err(|e| {
            let location = self
                .file
                .as_ref()
                .map(|p| format!(" (from '{}')", p.display()))
                .unwrap_or_default();
            // Tera nests the useful message one level down.
            let detail = e
                .source()
                .map(|s| s.to_string())
                .unwrap_or_else(|| e.to_string());
            anyhow::anyhow!("template render error{}: {}", location, detail)
        })
    }
}

impl PromptFormatter for TemplateFormatter {
    fn format(&self, value: &Value) -> Result<String, anyhow::Error> {
        self.format_serializable(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_string_renders_fields() {
        let f = TemplateFormatter::from_string("Hello {{ name }}!").unwrap();
        let out = f.format(&json!({"name": "world"})).unwrap();
        assert_eq!(out, "Hello world!");
    }

    #[test]
    fn test_parse_error_at_construction() {
        let result = TemplateFormatter::from_string("{{ unclosed");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("parse"));
    }

    #[test]
    fn test_nested_map_lookup() {
        let f = TemplateFormatter::from_string("{{ variables.user.name }}").unwrap();
        let out = f
            .format(&json!({"variables": {"user": {"name": "alice"}}}))
            .unwrap();
        assert_eq!(out, "alice");
    }

    #[test]
    fn test_range_over_list() {
        let f =
            TemplateFormatter::from_string("{% for i in items %}{{ i }},{% endfor %}").unwrap();
        let out = f.format(&json!({"items": [1, 2, 3]})).unwrap();
        assert_eq!(out, "1,2,3,");
    }

    #[test]
    fn test_missing_field_is_render_error() {
        let f = TemplateFormatter::from_string("{{ nope }}").unwrap();
        let result = f.format(&json!({"name": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_scalar_argument_rejected() {
        let f = TemplateFormatter::from_string("hi").unwrap();
        assert!(f.format(&json!("just a string")).is_err());
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let f = TemplateFormatter::from_string("{{ a }}-{{ b }}").unwrap();
        let ctx = json!({"a": "x", "b": 2});
        let first = f.format(&ctx).unwrap();
        let second = f.format(&ctx).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "x-2");
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("anyi_formatter_test.txt");
        std::fs::write(&path, "File says: {{ text }}").unwrap();

        let f = TemplateFormatter::from_file(&path).unwrap();
        assert_eq!(f.file(), Some(path.as_path()));
        let out = f.format(&json!({"text": "hi"})).unwrap();
        assert_eq!(out, "File says: hi");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_from_file_missing() {
        let result = TemplateFormatter::from_file("/nonexistent/anyi.tpl");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("nonexistent"));
    }
}
