//! Configuration module for Hark.
//!
//! Handles loading and managing application settings and prompt templates.

mod prompts;
mod settings;

pub use prompts::{AnswerPrompts, JudgePrompts, Prompts, RewritePrompts};
pub use settings::{
    AlertSettings, AsrSettings, BotSettings, ChunkingSettings, EmbeddingSettings,
    GeneralSettings, IngestionSettings, RetrievalSettings, SchedulerSettings, Settings,
};
