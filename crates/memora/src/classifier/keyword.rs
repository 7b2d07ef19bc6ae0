//! Deterministic keyword classifier
//!
//! Scores each memory type by how many of its cue phrases appear in the
//! content. Entities come from a small technology lexicon plus capitalized
//! words that do not open a sentence.

use async_trait::async_trait;

use crate::classifier::Classifier;
use crate::classifier::types::{Classification, ClassifierError};
use crate::memory::types::{Entity, MemoryType};

/// Confidence when no cue matched and the content defaults to `context`
const NO_CUE_CONFIDENCE: f32 = 0.4;
const BASE_CONFIDENCE: f32 = 0.5;
const PER_CUE_CONFIDENCE: f32 = 0.15;
const MAX_CONFIDENCE: f32 = 0.95;

const CUES: &[(MemoryType, &[&str])] = &[
    (
        MemoryType::Identity,
        &[
            "my name is",
            "call me",
            "i am a",
            "i'm a",
            "i am the",
            "i'm the",
            "i work as",
            "my role",
            "my pronouns",
        ],
    ),
    (
        MemoryType::Preference,
        &[
            "prefer",
            "prefers",
            "i like",
            "i love",
            "i hate",
            "dislike",
            "favorite",
            "favourite",
            "rather",
        ],
    ),
    (
        MemoryType::Decision,
        &[
            "decided",
            "we use",
            "we chose",
            "chose",
            "going with",
            "settled on",
            "standardize on",
            "switched to",
            "will use",
            "as the",
            "agreed",
        ],
    ),
    (
        MemoryType::Solution,
        &[
            "fixed",
            "fix",
            "solved",
            "resolved",
            "solution",
            "workaround",
            "the trick",
            "by running",
            "to fix",
        ],
    ),
    (
        MemoryType::Pattern,
        &[
            "always",
            "usually",
            "whenever",
            "every time",
            "convention",
            "typically",
            "never",
            "by default",
        ],
    ),
    (
        MemoryType::Status,
        &[
            "currently",
            "in progress",
            "blocked",
            "working on",
            "is down",
            "deploying",
            "right now",
            "waiting on",
        ],
    ),
];

const TECHNOLOGIES: &[(&str, &str)] = &[
    ("postgresql", "PostgreSQL"),
    ("postgres", "PostgreSQL"),
    ("mysql", "MySQL"),
    ("sqlite", "SQLite"),
    ("redis", "Redis"),
    ("mongodb", "MongoDB"),
    ("kafka", "Kafka"),
    ("rabbitmq", "RabbitMQ"),
    ("elasticsearch", "Elasticsearch"),
    ("docker", "Docker"),
    ("kubernetes", "Kubernetes"),
    ("terraform", "Terraform"),
    ("nginx", "nginx"),
    ("graphql", "GraphQL"),
    ("rust", "Rust"),
    ("python", "Python"),
    ("typescript", "TypeScript"),
    ("javascript", "JavaScript"),
    ("java", "Java"),
    ("react", "React"),
    ("tokio", "Tokio"),
    ("aws", "AWS"),
    ("gcp", "GCP"),
    ("azure", "Azure"),
    ("linux", "Linux"),
    ("github", "GitHub"),
    ("git", "Git"),
];

/// Lowercase, keep letters, digits and apostrophes, collapse everything
/// else into single spaces, padded so cues can match on word boundaries
fn normalize(content: &str) -> String {
    let words: Vec<String> = content
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

fn lookup_technology(word: &str) -> Option<&'static str> {
    let key = word.to_lowercase();
    TECHNOLOGIES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
}

/// Heuristic entity extraction shared by the keyword classifier and the
/// ingestion fallback
pub fn extract_entities(content: &str) -> Vec<Entity> {
    let mut entities: Vec<Entity> = Vec::new();
    let mut push = |entity: Entity| {
        if !entities
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case(&entity.name))
        {
            entities.push(entity);
        }
    };

    let mut sentence_start = true;
    for raw in content.split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        let ends_sentence = raw.ends_with(['.', '!', '?']);

        if !word.is_empty() {
            if let Some(canonical) = lookup_technology(word) {
                push(Entity::new(canonical, "technology"));
            } else if !sentence_start
                && word.chars().count() > 1
                && word.chars().next().is_some_and(char::is_uppercase)
            {
                push(Entity::new(word, "concept"));
            }
            sentence_start = false;
        }
        if ends_sentence {
            sentence_start = true;
        }
    }

    entities
}

/// Rule-based classifier with no external dependencies
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`Classifier::classify`]
    pub fn classify_text(&self, content: &str) -> Classification {
        let normalized = normalize(content);

        // Earlier (more durable) types win ties
        let mut best: Option<(MemoryType, usize)> = None;
        for (memory_type, cues) in CUES {
            let hits = cues
                .iter()
                .filter(|cue| normalized.contains(&format!(" {cue} ")))
                .count();
            if hits > 0 && best.is_none_or(|(_, top)| hits > top) {
                best = Some((*memory_type, hits));
            }
        }

        let entities = extract_entities(content);
        match best {
            Some((memory_type, hits)) => {
                let confidence =
                    (BASE_CONFIDENCE + PER_CUE_CONFIDENCE * hits as f32).min(MAX_CONFIDENCE);
                Classification::new(memory_type, confidence, entities)
            }
            None => Classification::new(MemoryType::Context, NO_CUE_CONFIDENCE, entities),
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, content: &str) -> Result<Classification, ClassifierError> {
        if content.trim().is_empty() {
            return Err(ClassifierError::Failed("empty content".to_string()));
        }
        Ok(self.classify_text(content))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}
