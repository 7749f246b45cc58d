//! Named notification templates and `{{ placeholder }}` substitution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{DispatchError, StoreError};

/// Named, versioned title/body text with `{{variable}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub version: u32,
    pub title_template: String,
    pub body_template: String,
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        title_template: impl Into<String>,
        body_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: 1,
            title_template: title_template.into(),
            body_template: body_template.into(),
        }
    }
}

/// Read-only lookup of templates by notification type.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_by_type(&self, name: &str) -> Result<Option<Template>, StoreError>;
}

/// Keeps the latest version of each template in memory.
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<String, Template>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a template; an older version never replaces a newer one.
    pub async fn insert(&self, template: Template) {
        let mut guard = self.templates.write().await;
        match guard.get(&template.name) {
            Some(existing) if existing.version > template.version => {}
            _ => {
                guard.insert(template.name.clone(), template);
            }
        }
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get_by_type(&self, name: &str) -> Result<Option<Template>, StoreError> {
        Ok(self.templates.read().await.get(name).cloned())
    }
}

/// Concrete title and body after substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContent {
    pub title: String,
    pub body: String,
}

pub struct TemplateResolver {
    store: Arc<dyn TemplateStore>,
}

impl TemplateResolver {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<ResolvedContent, DispatchError> {
        let template = self
            .store
            .get_by_type(name)
            .await?
            .ok_or_else(|| DispatchError::TemplateNotFound { name: name.to_string() })?;

        Ok(ResolvedContent {
            title: render(&template.title_template, variables),
            body: render(&template.body_template, variables),
        })
    }
}

/// Replace every `{{ key }}` whose key is in `variables`.
/// Unknown placeholders are left as written.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after_open[..end].trim();
        match variables.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let out = render(
            "Order {{order_id}} shipped to {{ city }}",
            &vars(&[("order_id", "A-17"), ("city", "Lyon")]),
        );
        assert_eq!(out, "Order A-17 shipped to Lyon");
    }

    #[test]
    fn leaves_unknown_and_unterminated_placeholders() {
        assert_eq!(render("Hi {{name}}", &HashMap::new()), "Hi {{name}}");
        assert_eq!(render("Hi {{name", &vars(&[("name", "x")])), "Hi {{name");
        assert_eq!(render("no placeholders", &HashMap::new()), "no placeholders");
    }

    #[tokio::test]
    async fn resolver_reports_missing_templates() {
        let store = Arc::new(InMemoryTemplateStore::new());
        store
            .insert(Template::new("welcome", "Hi {{name}}", "Welcome aboard, {{name}}!"))
            .await;
        let resolver = TemplateResolver::new(store);

        let resolved = resolver
            .resolve("welcome", &vars(&[("name", "Ada")]))
            .await
            .unwrap();
        assert_eq!(resolved.title, "Hi Ada");
        assert_eq!(resolved.body, "Welcome aboard, Ada!");

        let err = resolver.resolve("missing", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::TemplateNotFound { .. }));
    }

    #[tokio::test]
    async fn older_versions_do_not_replace_newer() {
        let store = InMemoryTemplateStore::new();
        let mut v2 = Template::new("t", "new", "new");
        v2.version = 2;
        store.insert(v2).await;
        store.insert(Template::new("t", "old", "old")).await;
        let got = store.get_by_type("t").await.unwrap().unwrap();
        assert_eq!(got.title_template, "new");
    }
}
