pub mod executor;
pub mod inflation;
pub mod orchestrator;
pub mod schema_inspector;
pub mod semantic_lexicon;
