// src/medcouncil/mod.rs

pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod consensus;
pub mod debate;
pub mod event;
pub mod intake;
pub mod llm_session;
pub mod patient;
pub mod repetition;
pub mod roster;
pub mod stagnation;

// Export LLMSession so it reads as medcouncil::LLMSession
pub use llm_session::LLMSession;
