//! Wire types of the content service API (snake_case JSON).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// GET /quiz/api/games/{id}/questions/ response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameData {
    pub game: GameInfo,
    #[serde(default)]
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A question exactly as the content service hands it out, host-only fields included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub text: String,
    #[serde(default)]
    pub question_number: u32,
    /// Point value of the question.
    #[serde(default)]
    pub total_points: u32,
    #[serde(default)]
    pub question_image_url: Option<String>,
    #[serde(default)]
    pub answer_bank: Option<String>,
    #[serde(default)]
    pub question_type: String,
    #[serde(default)]
    pub answers: Vec<Answer>,
}

/// Answer option. `answer_text`, `correct_rank` and `points` are for the host only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub text: String,
    #[serde(default)]
    pub answer_text: Option<String>,
    #[serde(default)]
    pub points: u32,
    #[serde(default)]
    pub correct_rank: Option<u32>,
    #[serde(default)]
    pub display_order: Option<u32>,
    #[serde(default)]
    pub question_image_url: Option<String>,
    #[serde(default)]
    pub answer_image_url: Option<String>,
}

/// POST /quiz/api/sessions/create/ body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    pub game: i64,
    pub host_name: String,
    pub max_teams: u32,
}

/// POST /quiz/api/sessions/create/ response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    pub session_id: i64,
    pub session_code: String,
    pub game_id: i64,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub max_teams: u32,
}

/// POST /quiz/api/answers/submit/ body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub session_id: i64,
    pub team_name: String,
    pub question_id: i64,
    pub answer: String,
    pub submitted_at: DateTime<Utc>,
}
