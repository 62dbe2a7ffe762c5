//! Natural-language questions answered from a CRM database.
//!
//! A language model classifies the question, [`query::QueryBuilder`] turns
//! the classification into parameterized SQL over the schema registry, and
//! [`pipeline::AnswerPipeline`] runs retrieval, grounding and generation with
//! results cached by table volatility and turns logged per session.

pub mod cache;
pub mod config;
pub mod db;
pub mod intent;
pub mod llm;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod session;
pub mod util;
pub mod web;
