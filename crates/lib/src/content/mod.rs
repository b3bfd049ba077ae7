//! Upstream trivia content service: supplies game/question data and persists
//! session and answer records.
//!
//! The coordinator only talks to it through [`ContentService`], so tests can swap
//! the HTTP client for an in-process fake.

mod client;
mod types;

pub use client::{ContentError, ContentService, HttpContentClient};
pub use types::{
    Answer, AnswerRecord, GameData, GameInfo, Question, SessionCreateRequest, SessionCreateResponse,
};
