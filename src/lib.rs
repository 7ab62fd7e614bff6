pub mod answer_synthesizer;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod execution;
pub mod llm;
pub mod pipeline;
pub mod placeholder;
pub mod prompts;
pub mod query;
pub mod query_synthesizer;
pub mod schema;
pub mod security;
pub mod sql;

pub use config::AppConfig;
pub use error::{PipelineError, Result, Stage, StageFailure};
pub use pipeline::{AskRequest, Pipeline, GENERIC_FAILURE_MESSAGE};
pub use query::{BusinessId, ResolvedQuery, SynthesizedQuery};
