//! Discipline templates and final formatting.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use coursegen_cache::{Computed, Fingerprint, ResultCache, namespaces, normalize_text};
use coursegen_core::{CurriculumMetadata, Topic};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identifier of the fallback template.
pub const DEFAULT_TEMPLATE: &str = "default";

/// A structural template for one discipline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisciplineTemplate {
    pub id: String,
    pub body: String,
}

const HEADER: &str = "# {{subject}}\n\
## Lecture: {{theme}}\n\n\
| Level | Programme | Hours | Department |\n\
|---|---|---|---|\n\
| {{degree}} | {{profession}} | {{hours}} | {{department}} |\n\n";

fn builtin_body(id: &str) -> String {
    let note = match id {
        "physics" => "> Quantities are given in SI units unless stated otherwise.\n\n",
        "mathematics" => "> Definitions and theorems are numbered within the lecture.\n\n",
        "computer_science" => "> Code fragments are given in fenced blocks.\n\n",
        "chemistry" => "> Reactions are written as balanced equations.\n\n",
        _ => "",
    };
    format!("{HEADER}{note}{{{{content}}}}\n")
}

/// Built-in templates and the discipline names that select them.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, DisciplineTemplate>,
    aliases: Vec<(String, String)>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            templates: HashMap::new(),
            aliases: Vec::new(),
        };
        for (id, aliases) in [
            ("physics", &["physics", "физика"][..]),
            ("mathematics", &["mathematics", "math", "математика", "математический анализ"][..]),
            (
                "computer_science",
                &["computer science", "informatics", "информатика", "программирование"][..],
            ),
            ("chemistry", &["chemistry", "химия"][..]),
            (DEFAULT_TEMPLATE, &[][..]),
        ] {
            registry.insert(
                DisciplineTemplate {
                    id: id.into(),
                    body: builtin_body(id),
                },
                aliases,
            );
        }
        registry
    }

    /// Add or replace a template and the names that select it.
    pub fn insert(&mut self, template: DisciplineTemplate, aliases: &[&str]) {
        for alias in aliases {
            self.aliases.push((normalize_text(alias), template.id.clone()));
        }
        self.templates.insert(template.id.clone(), template);
    }

    /// Template id for a discipline name. Exact alias matches win; otherwise
    /// the first alias contained in the name ("теоретическая физика"), then
    /// the default.
    pub fn resolve(&self, discipline: &str) -> &str {
        let name = normalize_text(discipline);
        self.aliases
            .iter()
            .find(|(alias, _)| *alias == name)
            .or_else(|| self.aliases.iter().find(|(alias, _)| name.contains(alias.as_str())))
            .map(|(_, id)| id.as_str())
            .filter(|id| self.templates.contains_key(*id))
            .unwrap_or(DEFAULT_TEMPLATE)
    }

    pub fn get(&self, id: &str) -> Option<&DisciplineTemplate> {
        self.templates.get(id)
    }

    fn lookup(&self, discipline: &str) -> DisciplineTemplate {
        let id = self.resolve(discipline);
        self.templates
            .get(id)
            .or_else(|| self.templates.get(DEFAULT_TEMPLATE))
            .cloned()
            .unwrap_or_else(|| DisciplineTemplate {
                id: DEFAULT_TEMPLATE.into(),
                body: builtin_body(DEFAULT_TEMPLATE),
            })
    }
}

/// Substitute `{{name}}` placeholders in one pass. Substituted values are
/// never rescanned; unknown placeholders are left as they are.
pub fn render(body: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let name = after[..close].trim();
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Maps validated content into the discipline's template. No inference.
pub struct TemplateFormatter {
    registry: Arc<TemplateRegistry>,
    cache: Arc<ResultCache>,
    ttl: Duration,
}

impl TemplateFormatter {
    pub fn new(registry: TemplateRegistry, cache: Arc<ResultCache>, ttl: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            cache,
            ttl,
        }
    }

    /// The template for a topic, through the cache.
    pub async fn template_for(&self, topic: &Topic) -> DisciplineTemplate {
        let key = Fingerprint::of(
            namespaces::TEMPLATE,
            &[
                ("discipline", &topic.discipline),
                ("degree", topic.degree.as_str()),
            ],
        );
        let registry = self.registry.clone();
        let discipline = topic.discipline.clone();
        let Ok(template) = self
            .cache
            .get_or_compute(&key, self.ttl, || async move {
                Ok::<_, Infallible>(Computed::Store(registry.lookup(&discipline)))
            })
            .await;
        template
    }

    pub async fn format(
        &self,
        validated_text: &str,
        topic: &Topic,
        metadata: &CurriculumMetadata,
    ) -> String {
        let template = self.template_for(topic).await;
        debug!(template = %template.id, discipline = %topic.discipline, "Formatting content");

        let subject = if metadata.subject_title.is_empty() {
            topic.discipline.clone()
        } else {
            metadata.subject_title.clone()
        };
        let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };

        let values: HashMap<&str, String> = HashMap::from([
            ("subject", subject),
            ("theme", topic.theme.clone()),
            ("degree", topic.degree.to_string()),
            ("profession", or_dash(&metadata.profession)),
            (
                "hours",
                if metadata.total_hours == 0 {
                    "-".to_string()
                } else {
                    metadata.total_hours.to_string()
                },
            ),
            (
                "department",
                or_dash(metadata.department.as_deref().unwrap_or_default()),
            ),
            ("content", validated_text.trim_end().to_string()),
        ]);
        render(&template.body, &values)
    }
}
