//! HTML template wrapping composed programs
//!
//! A template is an HTML document split on a single `{{inject}}` marker.
//! The process holds one current template in a [`TemplateStore`]; replacing
//! it is an admin operation that either fully succeeds or leaves the current
//! template untouched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

use crate::compose::ComposedProgram;

pub const INJECT_MARKER: &str = "{{inject}}";

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
  </head>
  <body>
    <script>
{{inject}}
    </script>
  </body>
</html>
"#;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template is missing the inject marker")]
    MissingMarker,

    #[error("Template contains {0} inject markers, expected exactly one")]
    DuplicateMarker(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub before: String,
    pub after: String,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let count = source.matches(INJECT_MARKER).count();
        match count {
            0 => Err(TemplateError::MissingMarker),
            1 => {
                let (before, after) = source
                    .split_once(INJECT_MARKER)
                    .ok_or(TemplateError::MissingMarker)?;
                Ok(Self {
                    before: before.to_string(),
                    after: after.to_string(),
                })
            }
            n => Err(TemplateError::DuplicateMarker(n)),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template: {}", path.as_ref().display()))?;
        Self::parse(&source)
            .with_context(|| format!("Invalid template: {}", path.as_ref().display()))
    }

    /// Produce the final renderable document
    pub fn wrap(&self, program: &ComposedProgram) -> String {
        let program = program.as_str();
        let mut out = String::with_capacity(self.before.len() + program.len() + self.after.len());
        out.push_str(&self.before);
        out.push_str(program);
        out.push_str(&self.after);
        out
    }
}

impl Default for Template {
    fn default() -> Self {
        let (before, after) = DEFAULT_TEMPLATE
            .split_once(INJECT_MARKER)
            .unwrap_or((DEFAULT_TEMPLATE, ""));
        Self {
            before: before.to_string(),
            after: after.to_string(),
        }
    }
}

/// Process-wide holder of the current template
#[derive(Debug, Default)]
pub struct TemplateStore {
    current: RwLock<Arc<Template>>,
}

impl TemplateStore {
    pub fn new(template: Template) -> Self {
        Self {
            current: RwLock::new(Arc::new(template)),
        }
    }

    pub fn current(&self) -> Arc<Template> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the template from source; no mutation on error
    pub fn replace(&self, source: &str) -> Result<Arc<Template>, TemplateError> {
        let template = Arc::new(Template::parse(source)?);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = template.clone();
        info!(
            before_bytes = template.before.len(),
            after_bytes = template.after.len(),
            "Template replaced"
        );
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_marker() {
        let template = Template::parse("<b>{{inject}}</b>").unwrap();
        assert_eq!(template.before, "<b>");
        assert_eq!(template.after, "</b>");
    }

    #[test]
    fn test_parse_multiline() {
        let template = Template::parse("<html>\n<script>\n{{inject}}\n</script>\n</html>").unwrap();
        assert_eq!(template.before, "<html>\n<script>\n");
        assert_eq!(template.after, "\n</script>\n</html>");
    }

    #[test]
    fn test_marker_count_errors() {
        assert_eq!(Template::parse("<html></html>"), Err(TemplateError::MissingMarker));
        assert_eq!(
            Template::parse("{{inject}}{{inject}}"),
            Err(TemplateError::DuplicateMarker(2))
        );
    }

    #[test]
    fn test_default_template_has_marker_position() {
        let template = Template::default();
        assert!(template.before.ends_with("<script>\n"));
        assert!(template.after.contains("</script>"));
    }

    #[test]
    fn test_failed_replace_keeps_current() {
        let store = TemplateStore::new(Template::parse("a{{inject}}b").unwrap());
        assert!(store.replace("no marker").is_err());
        assert_eq!(store.current().before, "a");

        store.replace("c{{inject}}d").unwrap();
        assert_eq!(store.current().before, "c");
        assert_eq!(store.current().after, "d");
    }

    #[test]
    fn test_wrap() {
        let template = Template::parse("<s>{{inject}}</s>").unwrap();
        let program = ComposedProgram::from_text("run();");
        assert_eq!(template.wrap(&program), "<s>run();</s>");
    }
}
