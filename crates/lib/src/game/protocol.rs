//! Session WebSocket protocol types.
//!
//! Every frame is a JSON envelope `{ "type", "data", "from" }`. Inbound frames are
//! decoded in two steps: the envelope first, then `data` against the shape the
//! declared `type` demands. Either step failing is a per-frame [`ProtocolError`];
//! nothing here panics on a malformed payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::content::{Answer, Question};

/// Serialized outbound frame, shared by every queue a fan-out reaches.
pub type Frame = Arc<str>;

/// Wire envelope: `{ "type": "...", "data": {...}, "from": "..." }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {typ} payload: {source}")]
    InvalidPayload {
        typ: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle of a session: waiting → active ⇄ scoring → completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Waiting,
    Active,
    Scoring,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Scoring => "scoring",
            SessionStatus::Completed => "completed",
        }
    }
}

// ---- inbound (participant -> session) ----

/// A decoded participant message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinTeam(JoinTeam),
    SubmitAnswer(SubmitAnswer),
    HostCommand(HostCommand),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTeam {
    pub team_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAnswer {
    pub team_name: String,
    pub question_number: u32,
    /// Older clients send this as `answer`.
    #[serde(alias = "answer")]
    pub answer_text: String,
}

/// Game-control commands; only honoured from the registered host connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    StartGame,
    ShowQuestion {
        question_number: u32,
    },
    NextQuestion,
    ShowAnswers,
    StartScoring,
    ScoreQuestion {
        question_number: u32,
        #[serde(default)]
        scores: BTreeMap<String, u32>,
    },
    FinishScoring,
    EndGame,
}

impl HostCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HostCommand::StartGame => "start_game",
            HostCommand::ShowQuestion { .. } => "show_question",
            HostCommand::NextQuestion => "next_question",
            HostCommand::ShowAnswers => "show_answers",
            HostCommand::StartScoring => "start_scoring",
            HostCommand::ScoreQuestion { .. } => "score_question",
            HostCommand::FinishScoring => "finish_scoring",
            HostCommand::EndGame => "end_game",
        }
    }
}

impl ClientMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    /// Resolve `data` against the shape required by `type`.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { typ, data, .. } = envelope;
        let parsed = match typ.as_str() {
            "join_team" => serde_json::from_value(data).map(ClientMessage::JoinTeam),
            "submit_answer" => serde_json::from_value(data).map(ClientMessage::SubmitAnswer),
            "host_command" => serde_json::from_value(data).map(ClientMessage::HostCommand),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        parsed.map_err(|source| ProtocolError::InvalidPayload { typ, source })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinTeam(_) => "join_team",
            ClientMessage::SubmitAnswer(_) => "submit_answer",
            ClientMessage::HostCommand(_) => "host_command",
        }
    }
}

// ---- outbound (session -> participants) ----

/// Team name and running score; leaderboards are lists of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamStanding {
    pub name: String,
    pub score: u32,
}

/// One team's answer to one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub team_name: String,
    pub answer_text: String,
    pub submitted_at: DateTime<Utc>,
}

/// A shown question with everything submitted for it, for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionForScoring {
    pub question_number: u32,
    pub question: Question,
    pub submissions: Vec<Submission>,
}

/// Team-facing projection of a [`Question`]. The answer type has no field for
/// canonical text, correctness rank or per-answer points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamQuestion {
    pub id: i64,
    pub text: String,
    pub question_number: u32,
    pub total_points: u32,
    pub question_image_url: Option<String>,
    pub answer_bank: Option<String>,
    pub question_type: String,
    pub answers: Vec<TeamAnswer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamAnswer {
    pub id: i64,
    pub text: String,
    pub question_image_url: Option<String>,
    pub answer_image_url: Option<String>,
    pub display_order: Option<u32>,
}

impl From<&Answer> for TeamAnswer {
    fn from(a: &Answer) -> Self {
        Self {
            id: a.id,
            text: a.text.clone(),
            question_image_url: a.question_image_url.clone(),
            answer_image_url: a.answer_image_url.clone(),
            display_order: a.display_order,
        }
    }
}

impl From<&Question> for TeamQuestion {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            text: q.text.clone(),
            question_number: q.question_number,
            total_points: q.total_points,
            question_image_url: q.question_image_url.clone(),
            answer_bank: q.answer_bank.clone(),
            question_type: q.question_type.clone(),
            answers: q.answers.iter().map(TeamAnswer::from).collect(),
        }
    }
}

/// Messages the session sends out. Serialized as `{ "type": <snake_case variant>, "data": {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Snapshot sent once to a connection when it joins.
    Connected {
        session_code: String,
        game_name: String,
        status: SessionStatus,
        current_question: u32,
        total_questions: u32,
        is_host: bool,
        teams: Vec<TeamStanding>,
    },
    TeamJoined {
        team_name: String,
        total_teams: u32,
        teams: Vec<TeamStanding>,
    },
    GameStarted {
        message: String,
        status: SessionStatus,
    },
    /// Sanitized question, teams only.
    QuestionDisplay {
        question_number: u32,
        total_questions: u32,
        question: TeamQuestion,
    },
    /// Full question plus current submissions, host only.
    QuestionDisplayedHost {
        question_number: u32,
        total_questions: u32,
        question: Question,
        submissions: Vec<Submission>,
    },
    AnswerSubmitted {
        team_name: String,
        question_number: u32,
        answer_text: String,
        submitted_at: DateTime<Utc>,
        submissions: Vec<Submission>,
    },
    AnswersRevealed {
        question_number: u32,
        total_questions: u32,
        question: Question,
    },
    RoundComplete {
        message: String,
        total_questions: u32,
    },
    ScoringStarted {
        message: String,
        questions_to_score: Vec<QuestionForScoring>,
        leaderboard: Vec<TeamStanding>,
    },
    ScoringPhase {
        message: String,
    },
    QuestionScored {
        question_number: u32,
        scores: BTreeMap<String, u32>,
        leaderboard: Vec<TeamStanding>,
    },
    ScoringComplete {
        message: String,
        status: SessionStatus,
        leaderboard: Vec<TeamStanding>,
    },
    GameCompleted {
        message: String,
        status: SessionStatus,
        leaderboard: Vec<TeamStanding>,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}
