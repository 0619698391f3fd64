//! Hint content.
//!
//! A hint level selects what the agent gets back:
//!
//! | Level | Content |
//! |-------|---------|
//! | 0 | Contest strategy notes |
//! | 1 | Textbook excerpt matched to the problem statement |
//! | 2 | Textbook excerpt matched to a topic the agent names |
//! | 3 | The most similar problem outside the competition, with its solution |
//! | 4 | Example problems for a topic at the problem's level |
//!
//! Retrieval itself is external. [`HintComposer`] only builds queries and
//! shapes the results; a [`Retriever`] does the ranking.

use crate::model::Problem;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Corpus {
    Textbook,
    Problems,
    Strategies,
    Examples,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetrievedDoc {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub score: f64,
}

/// Ranked search over a hint corpus.
pub trait Retriever: Send + Sync {
    /// At most `limit` documents, best first.
    fn search(&self, corpus: Corpus, query: &str, limit: usize) -> Vec<RetrievedDoc>;
}

/// Finds nothing. Hints still carry the problem reference.
pub struct NoRetriever;

impl Retriever for NoRetriever {
    fn search(&self, _: Corpus, _: &str, _: usize) -> Vec<RetrievedDoc> {
        Vec::new()
    }
}

/// In-memory documents ranked by the number of distinct query terms they
/// contain.
#[derive(Default, Serialize, Deserialize, Debug, Clone)]
pub struct KeywordRetriever {
    #[serde(default)]
    pub textbook: Vec<RetrievedDoc>,
    #[serde(default)]
    pub problems: Vec<RetrievedDoc>,
    #[serde(default)]
    pub strategies: Vec<RetrievedDoc>,
    #[serde(default)]
    pub examples: Vec<RetrievedDoc>,
}

impl KeywordRetriever {
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read hint corpus '{}': {e}", path.display()))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse hint corpus '{}': {e}", path.display()))
    }

    fn corpus(&self, corpus: Corpus) -> &[RetrievedDoc] {
        match corpus {
            Corpus::Textbook => &self.textbook,
            Corpus::Problems => &self.problems,
            Corpus::Strategies => &self.strategies,
            Corpus::Examples => &self.examples,
        }
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

impl Retriever for KeywordRetriever {
    fn search(&self, corpus: Corpus, query: &str, limit: usize) -> Vec<RetrievedDoc> {
        let query = terms(query);
        let mut scored: Vec<RetrievedDoc> = self
            .corpus(corpus)
            .iter()
            .filter_map(|doc| {
                let doc_terms = terms(&format!("{} {}", doc.title, doc.content));
                let hits = query.intersection(&doc_terms).count();
                // An empty query lists the corpus as is.
                (query.is_empty() || hits > 0).then(|| RetrievedDoc {
                    score: hits as f64,
                    ..doc.clone()
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }
}

const TOPIC_KEYWORDS: &[&str] = &[
    "algorithm",
    "data structure",
    "sorting",
    "searching",
    "dynamic programming",
    "graph",
    "tree",
    "array",
    "string",
    "number",
    "sequence",
    "pattern",
    "optimization",
    "greedy",
    "backtracking",
    "recursion",
    "iteration",
    "binary",
    "matrix",
    "linked list",
    "stack",
    "queue",
    "heap",
    "hash",
    "set",
    "map",
    "dictionary",
    "union find",
    "segment tree",
];

/// Up to five topic terms found in a problem statement.
pub fn search_terms(description: &str) -> Vec<String> {
    let lower = description.to_lowercase();
    let mut found: Vec<String> = TOPIC_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .map(|k| k.to_string())
        .collect();
    let extra = [
        (&["sum", "add"][..], "sum"),
        (&["count", "number"][..], "counting"),
        (&["find", "search"][..], "searching"),
        (&["maximum", "minimum"][..], "optimization"),
    ];
    for (triggers, term) in extra {
        if triggers.iter().any(|t| lower.contains(t)) {
            found.push(term.to_string());
        }
    }
    found.truncate(5);
    found
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

pub struct HintComposer {
    retriever: Arc<dyn Retriever>,
    excerpt_chars: usize,
}

impl Default for HintComposer {
    fn default() -> Self {
        Self::new(Arc::new(NoRetriever))
    }
}

impl HintComposer {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            retriever,
            excerpt_chars: 1000,
        }
    }

    pub fn with_excerpt_chars(mut self, chars: usize) -> Self {
        self.excerpt_chars = chars;
        self
    }

    /// Hint content for `level`. `exclude` lists problem ids that must not
    /// be suggested as similar problems (the competition's own problems).
    pub fn compose(
        &self,
        problem: Option<&Problem>,
        level: u8,
        knowledge: Option<&str>,
        exclude: &[String],
    ) -> Value {
        let mut content = Map::new();
        if let Some(p) = problem {
            content.insert(
                "current_problem".into(),
                json!({"id": p.id, "title": p.title}),
            );
        }
        if let Some(k) = knowledge {
            content.insert("hint_knowledge".into(), Value::String(k.to_string()));
        }

        match level {
            0 => {
                let notes = self.retriever.search(Corpus::Strategies, "", 1);
                content.insert(
                    "strategy".into(),
                    notes
                        .first()
                        .map(|d| json!({"title": d.title, "content": d.content}))
                        .unwrap_or(Value::Null),
                );
            }
            1 => {
                let query = problem
                    .map(|p| search_terms(&p.description).join(" "))
                    .unwrap_or_default();
                content.insert("textbook_sections".into(), self.sections(&query));
            }
            2 => {
                content.insert(
                    "textbook_sections".into(),
                    self.sections(knowledge.unwrap_or_default()),
                );
            }
            3 => {
                let similar = problem
                    .map(|p| self.similar_problems(p, exclude))
                    .unwrap_or_default();
                content.insert("similar_problems".into(), Value::Array(similar));
            }
            4 => {
                let query = match (problem, knowledge) {
                    (Some(p), Some(k)) => format!("{} {k}", p.level),
                    (None, Some(k)) => k.to_string(),
                    _ => String::new(),
                };
                let examples = if query.is_empty() {
                    Vec::new()
                } else {
                    self.retriever
                        .search(Corpus::Examples, &query, 3)
                        .into_iter()
                        .map(|d| {
                            json!({
                                "title": d.title,
                                "description": excerpt(&d.content, self.excerpt_chars / 2),
                                "solution": d.solution,
                            })
                        })
                        .collect()
                };
                content.insert("example_problems".into(), Value::Array(examples));
            }
            _ => {}
        }
        Value::Object(content)
    }

    fn sections(&self, query: &str) -> Value {
        if query.trim().is_empty() {
            return Value::Array(Vec::new());
        }
        Value::Array(
            self.retriever
                .search(Corpus::Textbook, query, 1)
                .into_iter()
                .map(|d| {
                    json!({
                        "title": d.title,
                        "content": excerpt(&d.content, self.excerpt_chars),
                        "relevance_score": d.score,
                    })
                })
                .collect(),
        )
    }

    fn similar_problems(&self, problem: &Problem, exclude: &[String]) -> Vec<Value> {
        let mut query = problem.description.clone();
        for case in &problem.sample_cases {
            query.push_str(&format!(
                "\nSample Input: {}\nSample Output: {}",
                case.input, case.expected_output
            ));
        }
        self.retriever
            .search(Corpus::Problems, &query, exclude.len() + 2)
            .into_iter()
            .filter(|d| d.id != problem.id && !exclude.contains(&d.id))
            .take(1)
            .map(|d| {
                json!({
                    "title": d.title,
                    "description": excerpt(&d.content, self.excerpt_chars / 2),
                    "solution": d.solution,
                    "similarity_score": d.score,
                })
            })
            .collect()
    }
}
