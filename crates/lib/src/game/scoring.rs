//! Scoring policies and leaderboard ordering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::protocol::TeamStanding;

/// How `score_question` turns into points. One policy per session, fixed at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScoringPolicy {
    /// The host reviews submissions and enters points per team.
    #[default]
    Manual,
    /// Every team that submitted anything gets the question's full point value, once.
    AutoAward,
}

impl ScoringPolicy {
    /// Points to add for one question.
    ///
    /// `entered` is what the host sent; `submitters` are the teams with an answer on
    /// record for the question. Manual keeps `entered` as is; auto-award ignores it.
    pub fn awards(
        &self,
        total_points: u32,
        submitters: &[String],
        entered: &BTreeMap<String, u32>,
    ) -> BTreeMap<String, u32> {
        match self {
            ScoringPolicy::Manual => entered.clone(),
            ScoringPolicy::AutoAward => submitters
                .iter()
                .map(|team| (team.clone(), total_points))
                .collect(),
        }
    }

    /// Whether the same question may be scored more than once.
    pub fn allows_rescoring(&self) -> bool {
        matches!(self, ScoringPolicy::Manual)
    }
}

/// Score descending, then name ascending.
pub fn rank(mut standings: Vec<TeamStanding>) -> Vec<TeamStanding> {
    standings.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    standings
}
