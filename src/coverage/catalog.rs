//! Static endpoint catalog: resource, templates, methods and the error
//! scenarios each endpoint is expected to have a test for.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    /// The API answers with an error status (e.g. 404 for a missing id).
    ErrorResponse,
    /// A create request with missing or invalid fields.
    ValidationError,
    /// A mutation with an edge-case payload, such as an empty body.
    MutationEdgeCase,
}

impl ScenarioKind {
    pub fn tier(self) -> u8 {
        match self {
            ScenarioKind::ErrorResponse => 1,
            ScenarioKind::ValidationError => 2,
            ScenarioKind::MutationEdgeCase => 3,
        }
    }

    /// Suffix used in canonical test names.
    pub fn slug(self) -> &'static str {
        match self {
            ScenarioKind::ErrorResponse => "not_found",
            ScenarioKind::ValidationError => "validation_error",
            ScenarioKind::MutationEdgeCase => "empty_payload",
        }
    }

    /// Name fragments that mark an existing test as exercising this scenario.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            ScenarioKind::ErrorResponse => &["not_found", "notfound", "nonexistent", "404"],
            ScenarioKind::ValidationError => {
                &["validation", "invalid", "missing_field", "bad_request", "400"]
            }
            ScenarioKind::MutationEdgeCase => &["empty_payload", "empty_body", "no_payload"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub method: String,
    pub template: String,
    pub kind: ScenarioKind,
    /// Expected response status.
    pub status: u16,
    #[serde(default)]
    pub precondition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub item_template: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub item_methods: Vec<String>,
    #[serde(default)]
    pub nested: Vec<String>,
    /// File name under the test root that new tests for this resource go into.
    pub target_file: String,
    #[serde(default, rename = "scenario")]
    pub scenarios: Vec<Scenario>,
}

impl EndpointDescriptor {
    pub fn singular(&self) -> &str {
        self.name.strip_suffix('s').unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(rename = "resource")]
    pub resources: Vec<EndpointDescriptor>,
}

impl Catalog {
    /// Load `path` when given, otherwise the built-in catalog.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let catalog: Catalog = toml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
        Ok(catalog)
    }

    /// The JSONPlaceholder resources.
    pub fn builtin() -> Self {
        let all_item = ["GET", "PUT", "PATCH", "DELETE"];
        let resources = vec![
            resource(
                "users",
                &["GET", "POST"],
                &all_item,
                &["/users/{id}/posts", "/users/{id}/todos", "/users/{id}/albums"],
                "test_users.py",
                &["GET", "PUT", "PATCH", "DELETE"],
            ),
            resource(
                "posts",
                &["GET", "POST"],
                &all_item,
                &["/posts/{id}/comments"],
                "test_auth.py",
                &["GET", "PUT", "DELETE"],
            ),
            resource("comments", &["GET"], &["GET"], &[], "test_resources.py", &["GET"]),
            resource(
                "albums",
                &["GET", "POST"],
                &all_item,
                &["/albums/{id}/photos"],
                "test_resources.py",
                &["GET"],
            ),
            resource("photos", &["GET", "POST"], &all_item, &[], "test_resources.py", &["GET"]),
            resource("todos", &["GET", "POST"], &all_item, &[], "test_resources.py", &["GET"]),
        ];
        Self { resources }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn resource(
    name: &str,
    methods: &[&str],
    item_methods: &[&str],
    nested: &[&str],
    target_file: &str,
    not_found_methods: &[&str],
) -> EndpointDescriptor {
    let template = format!("/{}", name);
    let item_template = format!("/{}/{{id}}", name);
    let singular = name.strip_suffix('s').unwrap_or(name);
    let mut scenarios = Vec::new();

    for method in not_found_methods {
        scenarios.push(Scenario {
            method: method.to_string(),
            template: item_template.clone(),
            kind: ScenarioKind::ErrorResponse,
            status: 404,
            precondition: format!("no {} exists with the requested id (e.g. 999)", singular),
        });
    }
    if methods.contains(&"POST") {
        scenarios.push(Scenario {
            method: "POST".to_string(),
            template: template.clone(),
            kind: ScenarioKind::ValidationError,
            status: 400,
            precondition: "request body is missing required fields or has invalid values"
                .to_string(),
        });
    }
    for method in ["PUT", "PATCH"] {
        if item_methods.contains(&method) {
            scenarios.push(Scenario {
                method: method.to_string(),
                template: item_template.clone(),
                kind: ScenarioKind::MutationEdgeCase,
                status: 200,
                precondition: "request body is an empty JSON object".to_string(),
            });
        }
    }

    EndpointDescriptor {
        name: name.to_string(),
        template,
        item_template: Some(item_template),
        methods: strings(methods),
        item_methods: strings(item_methods),
        nested: strings(nested),
        target_file: target_file.to_string(),
        scenarios,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builtin_catalog_shape() {
        let catalog = Catalog::builtin();
        let names: Vec<_> = catalog.resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["users", "posts", "comments", "albums", "photos", "todos"]
        );
        let users = &catalog.resources[0];
        assert_eq!(users.singular(), "user");
        assert_eq!(users.target_file, "test_users.py");
        assert_eq!(
            users.scenarios[0],
            Scenario {
                method: "GET".to_string(),
                template: "/users/{id}".to_string(),
                kind: ScenarioKind::ErrorResponse,
                status: 404,
                precondition: "no user exists with the requested id (e.g. 999)".to_string(),
            }
        );
        let comments = &catalog.resources[2];
        assert!(comments
            .scenarios
            .iter()
            .all(|s| s.kind == ScenarioKind::ErrorResponse));
    }

    #[test]
    fn test_load_toml_catalog() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        fs::write(
            &path,
            r#"
[[resource]]
name = "widgets"
template = "/widgets"
item_template = "/widgets/{id}"
methods = ["GET", "POST"]
target_file = "test_widgets.py"

[[resource.scenario]]
method = "GET"
template = "/widgets/{id}"
kind = "error_response"
status = 404
"#,
        )
        .unwrap();
        let catalog = Catalog::load(Some(&path)).unwrap();
        assert_eq!(catalog.resources.len(), 1);
        assert_eq!(catalog.resources[0].scenarios[0].kind.tier(), 1);
        assert!(Catalog::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
