//! Prompt templates for Hark.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Collection of all prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Prompts {
    pub answer: AnswerPrompts,
    pub rewrite: RewritePrompts,
    pub judge: JudgePrompts,
}

/// Prompts for answer generation over retrieved context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerPrompts {
    pub system: String,
    pub user: String,
}

impl Default for AnswerPrompts {
    fn default() -> Self {
        Self {
            system: "Answer using only the provided context from transcribed audio. \
                     If the context does not contain the answer, say you don't know. \
                     Be concise."
                .to_string(),
            user: "Question: {{question}}\n\nContext:\n{{context}}".to_string(),
        }
    }
}

/// Prompts for query rewriting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewritePrompts {
    pub system: String,
    pub user: String,
}

impl Default for RewritePrompts {
    fn default() -> Self {
        Self {
            system: "You are a query expansion expert for transcribed audio content. \
                     Rewrite the user's query to improve information retrieval. \
                     Generate {{count}} variants that preserve the original intent, use \
                     different keywords or phrasing, and add relevant specificity. \
                     Return only the rewritten queries, one per line, without numbering \
                     or extra text."
                .to_string(),
            user: "Original query: {{question}}\n\nGenerate {{count}} improved variants:"
                .to_string(),
        }
    }
}

/// Prompts for LLM-as-judge answer scoring during evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgePrompts {
    pub system: String,
    pub user: String,
}

impl Default for JudgePrompts {
    fn default() -> Self {
        Self {
            system: "You grade answers against a reference. Respond with a single number \
                     between 0.0 and 1.0 where 1.0 means the answer fully matches the \
                     reference in substance. Respond with the number only."
                .to_string(),
            user: "Question: {{question}}\n\nReference answer: {{reference}}\n\n\
                   Candidate answer: {{candidate}}\n\nScore:"
                .to_string(),
        }
    }
}

impl Prompts {
    /// Render a template, substituting `{{name}}` placeholders.
    pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
        let mut out = template.to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{{{}}}}}", name), value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let mut vars = HashMap::new();
        vars.insert("question".to_string(), "what is rust".to_string());
        vars.insert("context".to_string(), "1. Rust is a language".to_string());

        let rendered = Prompts::render(&AnswerPrompts::default().user, &vars);
        assert!(rendered.contains("what is rust"));
        assert!(rendered.contains("Rust is a language"));
        assert!(!rendered.contains("{{"));
    }
}
