//! Game session: the per-session state machine, team/question registry and fan-out.
//!
//! A [`GameSession`] is owned by exactly one task. Everything else (connection
//! pumps, HTTP handlers, the reaper) talks to it through a cloneable
//! [`SessionHandle`], either by queueing a [`SessionEvent`] or by reading the
//! published [`SessionSnapshot`] under a read lock. No session field is ever
//! locked or mutated from outside the processing loop.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::{Connection, ConnectionId, Outbound, Role};
use super::protocol::{
    ClientMessage, HostCommand, QuestionForScoring, ServerMessage, SessionStatus, Submission,
    SubmitAnswer, TeamQuestion, TeamStanding,
};
use super::scoring::{self, ScoringPolicy};
use crate::config::Config;
use crate::content::{AnswerRecord, ContentService, Question};

/// A decoded message stamped with the connection it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: ConnectionId,
    /// Display identity of the sending connection.
    pub sender: String,
    pub message: ClientMessage,
}

/// Everything the processing loop consumes, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Join(Connection),
    Leave(ConnectionId),
    Message(Inbound),
    /// Close every connection and end the processing task.
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is no longer running")]
    Closed(String),
}

/// Point-in-time view of a session for out-of-band readers.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub code: String,
    pub game_name: String,
    pub status: SessionStatus,
    pub current_question: u32,
    pub total_questions: u32,
    /// Ranked leaderboard.
    pub teams: Vec<TeamStanding>,
    pub connections: usize,
    pub has_host: bool,
    pub last_activity: Instant,
    pub completed_at: Option<Instant>,
}

/// Identity of a session as registered with the content service.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: i64,
    pub code: String,
    pub game_id: i64,
    pub game_name: String,
}

/// Per-session knobs, taken from [`Config`] when the session is created.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scoring_policy: ScoringPolicy,
    pub inbound_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub persist_answers: bool,
    pub persist_status: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scoring_policy: config.sessions.scoring_policy,
            inbound_queue_capacity: config.sessions.inbound_queue_capacity.max(1),
            outbound_queue_capacity: config.sessions.outbound_queue_capacity.max(1),
            persist_answers: config.content.persist_answers,
            persist_status: config.content.persist_status,
        }
    }
}

/// Cloneable access to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    code: Arc<str>,
    events: mpsc::Sender<SessionEvent>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    outbound_capacity: usize,
}

impl SessionHandle {
    pub fn code(&self) -> &str {
        &self.code
    }

    /// New connection whose outbound queue uses this session's bound.
    pub fn connect(
        &self,
        identity: impl Into<String>,
        role: Role,
    ) -> (Connection, Outbound) {
        Connection::new(identity, role, self.outbound_capacity)
    }

    pub async fn register(&self, connection: Connection) -> Result<(), SessionError> {
        self.send(SessionEvent::Join(connection)).await
    }

    /// Best effort: a stopped session has nothing left to deregister from.
    pub async fn deregister(&self, id: ConnectionId) {
        let _ = self.send(SessionEvent::Leave(id)).await;
    }

    pub async fn submit(&self, inbound: Inbound) -> Result<(), SessionError> {
        self.send(SessionEvent::Message(inbound)).await
    }

    pub async fn shutdown(&self) {
        let _ = self.send(SessionEvent::Shutdown).await;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    /// Whether both handles point at the same session, not merely the same code.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.snapshot, &other.snapshot)
    }

    async fn send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::Closed(self.code.to_string()))
    }

    /// Handle with no processing task; the test drives the event receiver by hand.
    #[cfg(test)]
    pub(crate) fn detached(code: &str, capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(capacity);
        let snapshot = SessionSnapshot {
            code: code.to_string(),
            game_name: String::new(),
            status: SessionStatus::Waiting,
            current_question: 0,
            total_questions: 0,
            teams: Vec::new(),
            connections: 0,
            has_host: false,
            last_activity: Instant::now(),
            completed_at: None,
        };
        let handle = Self {
            code: Arc::from(code),
            events,
            snapshot: Arc::new(RwLock::new(snapshot)),
            outbound_capacity: capacity,
        };
        (handle, rx)
    }
}

#[derive(Debug, Clone)]
pub struct Team {
    pub name: String,
    pub score: u32,
    pub answers: HashMap<u32, String>,
    pub submitted_at: HashMap<u32, DateTime<Utc>>,
}

impl Team {
    fn new(name: String) -> Self {
        Self {
            name,
            score: 0,
            answers: HashMap::new(),
            submitted_at: HashMap::new(),
        }
    }
}

/// Who a fan-out reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    Everyone,
    Teams,
    Host,
}

struct Persistence {
    content: Arc<dyn ContentService>,
    answers: bool,
    status: bool,
}

/// State of one running game. Owned by its processing task.
pub struct GameSession {
    info: SessionInfo,
    status: SessionStatus,
    /// Highest question number shown so far; 0 before the first.
    current_question: u32,
    questions: Vec<Question>,
    teams: HashMap<String, Team>,
    host: Option<ConnectionId>,
    connections: HashMap<ConnectionId, Connection>,
    scoring: ScoringPolicy,
    scored: BTreeSet<u32>,
    persistence: Option<Persistence>,
    last_activity: Instant,
    completed_at: Option<Instant>,
}

impl GameSession {
    pub fn new(
        info: SessionInfo,
        questions: Vec<Question>,
        settings: &SessionSettings,
        content: Option<Arc<dyn ContentService>>,
    ) -> Self {
        let persistence = content
            .filter(|_| settings.persist_answers || settings.persist_status)
            .map(|content| Persistence {
                content,
                answers: settings.persist_answers,
                status: settings.persist_status,
            });
        Self {
            info,
            status: SessionStatus::Waiting,
            current_question: 0,
            questions,
            teams: HashMap::new(),
            host: None,
            connections: HashMap::new(),
            scoring: settings.scoring_policy,
            scored: BTreeSet::new(),
            persistence,
            last_activity: Instant::now(),
            completed_at: None,
        }
    }

    /// Start the processing task. The returned handle is the only way in.
    pub fn spawn(self, settings: &SessionSettings) -> (SessionHandle, JoinHandle<()>) {
        let (events, rx) = mpsc::channel(settings.inbound_queue_capacity.max(1));
        let snapshot = Arc::new(RwLock::new(self.snapshot()));
        let handle = SessionHandle {
            code: Arc::from(self.info.code.as_str()),
            events,
            snapshot: snapshot.clone(),
            outbound_capacity: settings.outbound_queue_capacity.max(1),
        };
        let task = tokio::spawn(self.run(rx, snapshot));
        (handle, task)
    }

    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>, snapshot: Arc<RwLock<SessionSnapshot>>) {
        log::info!("session {} processing loop started", self.info.code);
        while let Some(event) = events.recv().await {
            let keep_running = self.handle_event(event);
            *snapshot.write().await = self.snapshot();
            if !keep_running {
                break;
            }
        }
        let dropped = self.connections.len();
        self.connections.clear();
        self.host = None;
        *snapshot.write().await = self.snapshot();
        log::info!(
            "session {} processing loop stopped ({} connection(s) closed)",
            self.info.code,
            dropped
        );
    }

    /// Apply one event. Returns false when the loop should stop.
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Join(connection) => {
                self.last_activity = Instant::now();
                self.join(connection);
            }
            SessionEvent::Leave(id) => {
                self.last_activity = Instant::now();
                self.leave(id);
            }
            SessionEvent::Message(inbound) => {
                self.last_activity = Instant::now();
                self.dispatch(inbound);
            }
            SessionEvent::Shutdown => return false,
        }
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            code: self.info.code.clone(),
            game_name: self.info.game_name.clone(),
            status: self.status,
            current_question: self.current_question,
            total_questions: self.total_questions(),
            teams: self.leaderboard(),
            connections: self.connections.len(),
            has_host: self.host.is_some(),
            last_activity: self.last_activity,
            completed_at: self.completed_at,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn current_question(&self) -> u32 {
        self.current_question
    }

    pub fn team(&self, name: &str) -> Option<&Team> {
        self.teams.get(name)
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn total_questions(&self) -> u32 {
        self.questions.len() as u32
    }

    fn question(&self, number: u32) -> Option<&Question> {
        number
            .checked_sub(1)
            .and_then(|i| self.questions.get(i as usize))
    }

    fn leaderboard(&self) -> Vec<TeamStanding> {
        scoring::rank(
            self.teams
                .values()
                .map(|t| TeamStanding {
                    name: t.name.clone(),
                    score: t.score,
                })
                .collect(),
        )
    }

    fn submissions_for(&self, number: u32) -> Vec<Submission> {
        let mut subs: Vec<Submission> = self
            .teams
            .values()
            .filter_map(|t| {
                let answer = t.answers.get(&number)?;
                Some(Submission {
                    team_name: t.name.clone(),
                    answer_text: answer.clone(),
                    submitted_at: t.submitted_at.get(&number).copied().unwrap_or_else(Utc::now),
                })
            })
            .collect();
        subs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.team_name.cmp(&b.team_name)));
        subs
    }

    // ---- connection set ----

    fn join(&mut self, connection: Connection) {
        let id = connection.id();
        let role = connection.role();
        if role == Role::Host {
            if let Some(previous) = self.host.replace(id) {
                log::info!("session {}: host {} replaced by {}", self.info.code, previous, id);
            }
        }
        log::debug!(
            "session {}: {} '{}' registered ({})",
            self.info.code,
            role,
            connection.identity(),
            id
        );
        self.connections.insert(id, connection);
        let welcome = ServerMessage::Connected {
            session_code: self.info.code.clone(),
            game_name: self.info.game_name.clone(),
            status: self.status,
            current_question: self.current_question,
            total_questions: self.total_questions(),
            is_host: role == Role::Host,
            teams: self.leaderboard(),
        };
        self.send(&[id], &welcome);
    }

    fn leave(&mut self, id: ConnectionId) {
        self.remove_connection(id);
    }

    fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if self.host == Some(id) {
            self.host = None;
            log::info!("session {}: host disconnected", self.info.code);
        }
        Some(conn)
    }

    // ---- fan-out ----

    fn fan_out(&mut self, audience: Audience, message: &ServerMessage) {
        let recipients: Vec<ConnectionId> = match audience {
            Audience::Everyone => self.connections.keys().copied().collect(),
            Audience::Teams => self
                .connections
                .values()
                .filter(|c| c.role() == Role::Team)
                .map(|c| c.id())
                .collect(),
            Audience::Host => self.host.into_iter().collect(),
        };
        self.send(&recipients, message);
    }

    /// Deliver to a fixed recipient list. A connection whose queue is full or
    /// closed is disconnected; the others still get the frame.
    fn send(&mut self, recipients: &[ConnectionId], message: &ServerMessage) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("session {}: failed to encode outbound message: {}", self.info.code, e);
                return;
            }
        };
        let mut unresponsive = Vec::new();
        for id in recipients {
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            if let Err(e) = conn.deliver(frame.clone()) {
                log::warn!(
                    "session {}: dropping {} '{}': {}",
                    self.info.code,
                    conn.role(),
                    conn.identity(),
                    e
                );
                unresponsive.push(*id);
            }
        }
        for id in unresponsive {
            if let Some(conn) = self.remove_connection(id) {
                conn.disconnect();
            }
        }
    }

    // ---- inbound ----

    fn dispatch(&mut self, inbound: Inbound) {
        if !self.connections.contains_key(&inbound.from) {
            log::debug!(
                "session {}: ignoring {} from unregistered connection '{}'",
                self.info.code,
                inbound.message.type_name(),
                inbound.sender
            );
            return;
        }
        match inbound.message {
            ClientMessage::JoinTeam(join) => self.join_team(join.team_name),
            ClientMessage::SubmitAnswer(submit) => self.submit_answer(submit),
            ClientMessage::HostCommand(command) => {
                if self.host != Some(inbound.from) {
                    log::warn!(
                        "session {}: ignoring {} from non-host '{}'",
                        self.info.code,
                        command.name(),
                        inbound.sender
                    );
                    return;
                }
                self.host_command(command);
            }
        }
    }

    fn join_team(&mut self, team_name: String) {
        let name = team_key(&team_name).to_string();
        if name.is_empty() {
            log::debug!("session {}: ignoring join with empty team name", self.info.code);
            return;
        }
        if self.teams.contains_key(&name) {
            return;
        }
        self.teams.insert(name.clone(), Team::new(name.clone()));
        log::info!(
            "session {}: team '{}' joined ({} teams total)",
            self.info.code,
            name,
            self.teams.len()
        );
        let message = ServerMessage::TeamJoined {
            team_name: name,
            total_teams: self.teams.len() as u32,
            teams: self.leaderboard(),
        };
        self.fan_out(Audience::Everyone, &message);
    }

    fn submit_answer(&mut self, submit: SubmitAnswer) {
        let SubmitAnswer {
            team_name,
            question_number,
            answer_text,
        } = submit;
        let team_name = team_key(&team_name).to_string();
        if self.status != SessionStatus::Active {
            log::debug!(
                "session {}: answer from '{}' rejected while {}",
                self.info.code,
                team_name,
                self.status.as_str()
            );
            return;
        }
        if question_number == 0 || question_number > self.current_question {
            log::debug!(
                "session {}: answer from '{}' for unshown question {}",
                self.info.code,
                team_name,
                question_number
            );
            return;
        }
        let Some(team) = self.teams.get_mut(&team_name) else {
            log::debug!("session {}: answer from unknown team '{}'", self.info.code, team_name);
            return;
        };
        let now = Utc::now();
        team.answers.insert(question_number, answer_text.clone());
        team.submitted_at.insert(question_number, now);
        log::info!(
            "session {}: '{}' answered Q{}",
            self.info.code,
            team_name,
            question_number
        );

        if let Some(question_id) = self.question(question_number).map(|q| q.id) {
            self.persist_answer(AnswerRecord {
                session_id: self.info.session_id,
                team_name: team_name.clone(),
                question_id,
                answer: answer_text.clone(),
                submitted_at: now,
            });
        }

        let message = ServerMessage::AnswerSubmitted {
            team_name,
            question_number,
            answer_text,
            submitted_at: now,
            submissions: self.submissions_for(question_number),
        };
        self.fan_out(Audience::Host, &message);
    }

    // ---- host commands ----

    fn host_command(&mut self, command: HostCommand) {
        let permitted = permitted_states(&command);
        if !permitted.contains(&self.status) {
            log::debug!(
                "session {}: {} rejected while {}",
                self.info.code,
                command.name(),
                self.status.as_str()
            );
            return;
        }
        log::debug!("session {}: host command {}", self.info.code, command.name());
        match command {
            HostCommand::StartGame => self.start_game(),
            HostCommand::ShowQuestion { question_number } => self.show_question(question_number),
            HostCommand::NextQuestion => self.next_question(),
            HostCommand::ShowAnswers => self.show_answers(),
            HostCommand::StartScoring => self.start_scoring(),
            HostCommand::ScoreQuestion {
                question_number,
                scores,
            } => self.score_question(question_number, &scores),
            HostCommand::FinishScoring => self.finish_scoring(),
            HostCommand::EndGame => self.end_game(),
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        log::info!(
            "session {}: {} -> {}",
            self.info.code,
            self.status.as_str(),
            status.as_str()
        );
        self.status = status;
        if status == SessionStatus::Completed {
            self.completed_at = Some(Instant::now());
        }
        self.persist_status();
    }

    fn start_game(&mut self) {
        self.set_status(SessionStatus::Active);
        let message = ServerMessage::GameStarted {
            message: "Game is starting! Get ready!".to_string(),
            status: self.status,
        };
        self.fan_out(Audience::Everyone, &message);
    }

    fn show_question(&mut self, number: u32) {
        let Some(question) = self.question(number).cloned() else {
            log::debug!(
                "session {}: show_question {} out of range 1..={}",
                self.info.code,
                number,
                self.total_questions()
            );
            return;
        };
        // Re-showing an earlier question never moves the index backwards.
        self.current_question = self.current_question.max(number);
        let total_questions = self.total_questions();

        let host_view = ServerMessage::QuestionDisplayedHost {
            question_number: number,
            total_questions,
            submissions: self.submissions_for(number),
            question: question.clone(),
        };
        self.fan_out(Audience::Host, &host_view);

        let team_view = ServerMessage::QuestionDisplay {
            question_number: number,
            total_questions,
            question: TeamQuestion::from(&question),
        };
        self.fan_out(Audience::Teams, &team_view);
    }

    fn next_question(&mut self) {
        if self.current_question < self.total_questions() {
            self.show_question(self.current_question + 1);
            return;
        }
        let message = ServerMessage::RoundComplete {
            message: "Round complete! Ready for scoring.".to_string(),
            total_questions: self.total_questions(),
        };
        self.fan_out(Audience::Everyone, &message);
    }

    fn show_answers(&mut self) {
        let Some(question) = self.question(self.current_question).cloned() else {
            log::debug!("session {}: show_answers before any question", self.info.code);
            return;
        };
        let message = ServerMessage::AnswersRevealed {
            question_number: self.current_question,
            total_questions: self.total_questions(),
            question,
        };
        self.fan_out(Audience::Everyone, &message);
    }

    fn start_scoring(&mut self) {
        self.set_status(SessionStatus::Scoring);
        let questions_to_score = (1..=self.current_question)
            .filter_map(|n| {
                self.question(n).map(|q| QuestionForScoring {
                    question_number: n,
                    question: q.clone(),
                    submissions: self.submissions_for(n),
                })
            })
            .collect();
        let host_view = ServerMessage::ScoringStarted {
            message: "Scoring phase started".to_string(),
            questions_to_score,
            leaderboard: self.leaderboard(),
        };
        self.fan_out(Audience::Host, &host_view);
        let team_view = ServerMessage::ScoringPhase {
            message: "Round complete! Host is scoring answers...".to_string(),
        };
        self.fan_out(Audience::Teams, &team_view);
    }

    fn score_question(&mut self, number: u32, entered: &BTreeMap<String, u32>) {
        let Some(total_points) = self.question(number).map(|q| q.total_points) else {
            log::debug!(
                "session {}: score_question {} out of range",
                self.info.code,
                number
            );
            return;
        };
        if !self.scoring.allows_rescoring() && self.scored.contains(&number) {
            log::debug!("session {}: Q{} already scored", self.info.code, number);
            return;
        }
        let mut submitters: Vec<String> = self
            .teams
            .values()
            .filter(|t| t.answers.contains_key(&number))
            .map(|t| t.name.clone())
            .collect();
        submitters.sort();

        let entered: BTreeMap<String, u32> = entered
            .iter()
            .map(|(name, points)| (team_key(name).to_string(), *points))
            .collect();
        let mut applied = BTreeMap::new();
        for (name, points) in self.scoring.awards(total_points, &submitters, &entered) {
            match self.teams.get_mut(&name) {
                Some(team) => {
                    team.score = team.score.saturating_add(points);
                    applied.insert(name, points);
                }
                None => log::debug!(
                    "session {}: ignoring points for unknown team '{}'",
                    self.info.code,
                    name
                ),
            }
        }
        self.scored.insert(number);
        log::info!("session {}: scored Q{} for {} team(s)", self.info.code, number, applied.len());

        let message = ServerMessage::QuestionScored {
            question_number: number,
            scores: applied,
            leaderboard: self.leaderboard(),
        };
        self.fan_out(Audience::Host, &message);
    }

    fn finish_scoring(&mut self) {
        self.set_status(SessionStatus::Active);
        let message = ServerMessage::ScoringComplete {
            message: "Scoring complete!".to_string(),
            status: self.status,
            leaderboard: self.leaderboard(),
        };
        self.fan_out(Audience::Everyone, &message);
    }

    fn end_game(&mut self) {
        self.set_status(SessionStatus::Completed);
        let message = ServerMessage::GameCompleted {
            message: "Game completed!".to_string(),
            status: self.status,
            leaderboard: self.leaderboard(),
        };
        self.fan_out(Audience::Everyone, &message);
    }

    // ---- persistence (fire and forget) ----

    fn persist_answer(&self, record: AnswerRecord) {
        let Some(p) = self.persistence.as_ref().filter(|p| p.answers) else {
            return;
        };
        let content = p.content.clone();
        let code = self.info.code.clone();
        tokio::spawn(async move {
            if let Err(e) = content.submit_answer(&record).await {
                log::warn!("session {}: persisting answer failed: {}", code, e);
            }
        });
    }

    fn persist_status(&self) {
        let Some(p) = self.persistence.as_ref().filter(|p| p.status) else {
            return;
        };
        let content = p.content.clone();
        let code = self.info.code.clone();
        let session_id = self.info.session_id;
        let status = self.status.as_str();
        tokio::spawn(async move {
            if let Err(e) = content.update_session_status(session_id, status).await {
                log::warn!("session {}: persisting status {} failed: {}", code, status, e);
            }
        });
    }
}

/// Team names are keyed by their trimmed form everywhere a client names a team.
fn team_key(name: &str) -> &str {
    name.trim()
}

/// States in which a host command is honoured. Nothing is accepted once completed.
fn permitted_states(command: &HostCommand) -> &'static [SessionStatus] {
    use SessionStatus::{Active, Scoring, Waiting};
    match command {
        HostCommand::StartGame => &[Waiting],
        HostCommand::ShowQuestion { .. } | HostCommand::NextQuestion | HostCommand::StartScoring => {
            &[Active]
        }
        HostCommand::ShowAnswers | HostCommand::EndGame => &[Active, Scoring],
        HostCommand::ScoreQuestion { .. } | HostCommand::FinishScoring => &[Scoring],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Answer, ContentError, GameData, SessionCreateRequest, SessionCreateResponse};
    use crate::game::protocol::{JoinTeam, SubmitAnswer};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    fn question(n: u32) -> Question {
        Question {
            id: 100 + n as i64,
            text: format!("Question {}", n),
            question_number: n,
            total_points: 5,
            question_image_url: None,
            answer_bank: None,
            question_type: "text".into(),
            answers: vec![Answer {
                id: 1000 + n as i64,
                text: format!("Option {}", n),
                answer_text: Some(format!("Secret {}", n)),
                points: 5,
                correct_rank: Some(1),
                display_order: Some(1),
                question_image_url: None,
                answer_image_url: None,
            }],
        }
    }

    fn info() -> SessionInfo {
        SessionInfo {
            session_id: 1,
            code: "QUIZ".into(),
            game_id: 9,
            game_name: "Pub Night".into(),
        }
    }

    fn session_with(policy: ScoringPolicy) -> GameSession {
        let settings = SessionSettings {
            scoring_policy: policy,
            ..SessionSettings::default()
        };
        GameSession::new(info(), (1..=3).map(question).collect(), &settings, None)
    }

    fn session() -> GameSession {
        session_with(ScoringPolicy::Manual)
    }

    struct Peer {
        id: ConnectionId,
        rx: Outbound,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }

        fn types(&mut self) -> Vec<String> {
            self.drain()
                .into_iter()
                .map(|v| v["type"].as_str().unwrap().to_string())
                .collect()
        }
    }

    fn connect(s: &mut GameSession, name: &str, role: Role) -> Peer {
        connect_with_capacity(s, name, role, 64)
    }

    fn connect_with_capacity(s: &mut GameSession, name: &str, role: Role, capacity: usize) -> Peer {
        let (conn, rx) = Connection::new(name, role, capacity);
        let id = conn.id();
        assert!(s.handle_event(SessionEvent::Join(conn)));
        Peer { id, rx }
    }

    fn send(s: &mut GameSession, from: &Peer, message: ClientMessage) {
        s.handle_event(SessionEvent::Message(Inbound {
            from: from.id,
            sender: "peer".into(),
            message,
        }));
    }

    fn command(s: &mut GameSession, host: &Peer, command: HostCommand) {
        send(s, host, ClientMessage::HostCommand(command));
    }

    fn join(s: &mut GameSession, from: &Peer, team: &str) {
        send(
            s,
            from,
            ClientMessage::JoinTeam(JoinTeam {
                team_name: team.into(),
            }),
        );
    }

    fn answer(s: &mut GameSession, from: &Peer, team: &str, n: u32, text: &str) {
        send(
            s,
            from,
            ClientMessage::SubmitAnswer(SubmitAnswer {
                team_name: team.into(),
                question_number: n,
                answer_text: text.into(),
            }),
        );
    }

    /// Host plus teams Alpha and Beta, each on its own connection, inboxes drained.
    fn lobby(s: &mut GameSession) -> (Peer, Peer, Peer) {
        let mut host = connect(s, "Quizmaster", Role::Host);
        let mut alpha = connect(s, "Alpha", Role::Team);
        let mut beta = connect(s, "Beta", Role::Team);
        join(s, &alpha, "Alpha");
        join(s, &beta, "Beta");
        host.drain();
        alpha.drain();
        beta.drain();
        (host, alpha, beta)
    }

    #[test]
    fn connected_snapshot_is_sent_once_on_join() {
        let mut s = session();
        let mut host = connect(&mut s, "Quizmaster", Role::Host);
        let frames = host.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "connected");
        assert_eq!(frames[0]["data"]["session_code"], "QUIZ");
        assert_eq!(frames[0]["data"]["is_host"], true);
        assert_eq!(frames[0]["data"]["total_questions"], 3);
        assert_eq!(frames[0]["data"]["status"], "waiting");
    }

    #[test]
    fn team_set_size_equals_distinct_names() {
        let mut s = session();
        let peer = connect(&mut s, "Alpha", Role::Team);
        for name in ["Alpha", "Beta", "Alpha", "Gamma", "Beta", "Alpha"] {
            join(&mut s, &peer, name);
        }
        assert_eq!(s.team_count(), 3);
    }

    #[test]
    fn duplicate_join_is_a_silent_no_op() {
        let mut s = session();
        let mut peer = connect(&mut s, "Alpha", Role::Team);
        join(&mut s, &peer, "Alpha");
        peer.drain();
        join(&mut s, &peer, "Alpha");
        assert!(peer.drain().is_empty());
        assert_eq!(s.team_count(), 1);
    }

    #[test]
    fn team_joined_lists_exactly_the_current_teams() {
        let mut s = session();
        let mut host = connect(&mut s, "Quizmaster", Role::Host);
        let alpha = connect(&mut s, "Alpha", Role::Team);
        join(&mut s, &alpha, "Alpha");
        join(&mut s, &alpha, "Beta");
        join(&mut s, &alpha, "Alpha");
        let frames = host.drain();
        let last = frames.iter().rev().find(|f| f["type"] == "team_joined").unwrap();
        let mut names: Vec<&str> = last["data"]["teams"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["Alpha", "Beta"]);
        assert_eq!(last["data"]["total_teams"], 2);
    }

    #[test]
    fn scenario_a_start_game_reaches_everyone() {
        let mut s = session();
        let (mut host, mut alpha, mut beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        assert_eq!(s.status(), SessionStatus::Active);
        for peer in [&mut host, &mut alpha, &mut beta] {
            assert_eq!(peer.types(), ["game_started"]);
        }
    }

    #[test]
    fn commands_from_non_host_are_ignored() {
        let mut s = session();
        let (mut host, alpha, _beta) = lobby(&mut s);
        command(&mut s, &alpha, HostCommand::StartGame);
        assert_eq!(s.status(), SessionStatus::Waiting);
        assert!(host.drain().is_empty());
    }

    #[test]
    fn show_question_while_waiting_changes_nothing() {
        let mut s = session();
        let (mut host, mut alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        assert_eq!(s.current_question(), 0);
        assert!(host.drain().is_empty());
        assert!(alpha.drain().is_empty());
    }

    #[test]
    fn show_question_out_of_range_is_rejected() {
        let mut s = session();
        let (mut host, mut alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        host.drain();
        alpha.drain();
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 0 });
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 4 });
        assert_eq!(s.current_question(), 0);
        assert!(host.drain().is_empty());
        assert!(alpha.drain().is_empty());
    }

    #[test]
    fn team_view_never_carries_host_only_fields() {
        let mut s = session();
        let (mut host, mut alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        host.drain();
        alpha.drain();
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 2 });

        let host_frames = host.drain();
        assert_eq!(host_frames.len(), 1);
        assert_eq!(host_frames[0]["type"], "question_displayed_host");
        let host_answer = &host_frames[0]["data"]["question"]["answers"][0];
        assert_eq!(host_answer["answer_text"], "Secret 2");
        assert_eq!(host_answer["correct_rank"], 1);
        assert_eq!(host_answer["points"], 5);

        let team_frames = alpha.drain();
        assert_eq!(team_frames.len(), 1);
        assert_eq!(team_frames[0]["type"], "question_display");
        let team_answer = &team_frames[0]["data"]["question"]["answers"][0];
        assert_eq!(team_answer["text"], "Option 2");
        for field in ["answer_text", "correct_rank", "points"] {
            assert!(team_answer.get(field).is_none(), "{} leaked", field);
        }
        assert!(!team_frames[0].to_string().contains("Secret"));
        assert_eq!(s.current_question(), 2);
    }

    #[test]
    fn scenario_b_answer_is_reported_to_host_only() {
        let mut s = session();
        let (mut host, mut alpha, mut beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        host.drain();
        alpha.drain();
        beta.drain();

        answer(&mut s, &alpha, "Alpha", 1, "42");
        let frames = host.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "answer_submitted");
        assert_eq!(frames[0]["data"]["team_name"], "Alpha");
        assert_eq!(frames[0]["data"]["answer_text"], "42");
        assert_eq!(frames[0]["data"]["question_number"], 1);
        assert_eq!(frames[0]["data"]["submissions"].as_array().unwrap().len(), 1);
        assert!(alpha.drain().is_empty());
        assert!(beta.drain().is_empty());
        assert_eq!(s.team("Alpha").unwrap().answers.get(&1).map(String::as_str), Some("42"));
    }

    #[test]
    fn answers_for_unshown_questions_or_unknown_teams_are_dropped() {
        let mut s = session();
        let (mut host, alpha, _beta) = lobby(&mut s);
        answer(&mut s, &alpha, "Alpha", 1, "early");
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        host.drain();
        answer(&mut s, &alpha, "Alpha", 2, "ahead");
        answer(&mut s, &alpha, "Nobody", 1, "who");
        assert!(host.drain().is_empty());
        assert!(s.team("Alpha").unwrap().answers.is_empty());
    }

    #[test]
    fn resubmission_overwrites_previous_answer() {
        let mut s = session();
        let (host, alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        answer(&mut s, &alpha, "Alpha", 1, "first");
        answer(&mut s, &alpha, "Alpha", 1, "second");
        let team = s.team("Alpha").unwrap();
        assert_eq!(team.answers.get(&1).map(String::as_str), Some("second"));
        assert_eq!(team.answers.len(), 1);
    }

    #[test]
    fn padded_team_name_is_the_same_team_when_answering_and_scoring() {
        let mut s = session();
        let mut host = connect(&mut s, "Quizmaster", Role::Host);
        let peer = connect(&mut s, "Alpha", Role::Team);
        join(&mut s, &peer, " Alpha ");
        assert!(s.team("Alpha").is_some());
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        host.drain();

        answer(&mut s, &peer, " Alpha ", 1, "42");
        assert_eq!(s.team("Alpha").unwrap().answers.get(&1).map(String::as_str), Some("42"));
        let frames = host.drain();
        assert_eq!(frames[0]["type"], "answer_submitted");
        assert_eq!(frames[0]["data"]["team_name"], "Alpha");

        command(&mut s, &host, HostCommand::StartScoring);
        command(
            &mut s,
            &host,
            HostCommand::ScoreQuestion {
                question_number: 1,
                scores: BTreeMap::from([("Alpha  ".into(), 4)]),
            },
        );
        assert_eq!(s.team("Alpha").unwrap().score, 4);
    }

    #[test]
    fn host_view_includes_existing_submissions() {
        let mut s = session();
        let (mut host, alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        answer(&mut s, &alpha, "Alpha", 1, "42");
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 2 });
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        let frames = host.drain();
        let last = frames.last().unwrap();
        assert_eq!(last["type"], "question_displayed_host");
        assert_eq!(last["data"]["submissions"][0]["team_name"], "Alpha");
        // Going back does not move the index backwards.
        assert_eq!(s.current_question(), 2);
    }

    #[test]
    fn next_question_advances_then_reports_round_complete_without_changing_status() {
        let mut s = session();
        let (mut host, mut alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        for _ in 0..3 {
            command(&mut s, &host, HostCommand::NextQuestion);
        }
        assert_eq!(s.current_question(), 3);
        host.drain();
        alpha.drain();
        command(&mut s, &host, HostCommand::NextQuestion);
        assert_eq!(s.status(), SessionStatus::Active);
        assert_eq!(s.current_question(), 3);
        assert_eq!(host.types(), ["round_complete"]);
        assert_eq!(alpha.types(), ["round_complete"]);
    }

    #[test]
    fn manual_scoring_round_trip() {
        let mut s = session();
        let (mut host, mut alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        answer(&mut s, &alpha, "Alpha", 1, "42");
        host.drain();
        alpha.drain();

        command(&mut s, &host, HostCommand::StartScoring);
        assert_eq!(s.status(), SessionStatus::Scoring);
        let frames = host.drain();
        assert_eq!(frames[0]["type"], "scoring_started");
        let to_score = frames[0]["data"]["questions_to_score"].as_array().unwrap();
        assert_eq!(to_score.len(), 1);
        assert_eq!(to_score[0]["submissions"][0]["answer_text"], "42");
        assert_eq!(alpha.types(), ["scoring_phase"]);

        command(
            &mut s,
            &host,
            HostCommand::ScoreQuestion {
                question_number: 1,
                scores: BTreeMap::from([("Alpha".into(), 3), ("Ghost".into(), 9)]),
            },
        );
        assert_eq!(s.team("Alpha").unwrap().score, 3);
        let frames = host.drain();
        assert_eq!(frames[0]["type"], "question_scored");
        assert_eq!(frames[0]["data"]["leaderboard"][0]["name"], "Alpha");
        assert!(frames[0]["data"]["scores"].get("Ghost").is_none());
        assert!(alpha.drain().is_empty());

        command(&mut s, &host, HostCommand::FinishScoring);
        assert_eq!(s.status(), SessionStatus::Active);
        assert_eq!(host.types(), ["scoring_complete"]);
        assert_eq!(alpha.types(), ["scoring_complete"]);
    }

    #[test]
    fn auto_award_gives_submitters_full_points_once() {
        let mut s = session_with(ScoringPolicy::AutoAward);
        let (host, alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        answer(&mut s, &alpha, "Alpha", 1, "anything");
        command(&mut s, &host, HostCommand::StartScoring);
        let score = HostCommand::ScoreQuestion {
            question_number: 1,
            scores: BTreeMap::from([("Beta".into(), 4)]),
        };
        command(&mut s, &host, score.clone());
        command(&mut s, &host, score);
        assert_eq!(s.team("Alpha").unwrap().score, 5);
        assert_eq!(s.team("Beta").unwrap().score, 0);
    }

    #[test]
    fn scoring_commands_outside_scoring_are_ignored() {
        let mut s = session();
        let (host, _alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(
            &mut s,
            &host,
            HostCommand::ScoreQuestion {
                question_number: 1,
                scores: BTreeMap::from([("Alpha".into(), 3)]),
            },
        );
        command(&mut s, &host, HostCommand::FinishScoring);
        assert_eq!(s.team("Alpha").unwrap().score, 0);
        assert_eq!(s.status(), SessionStatus::Active);
    }

    #[test]
    fn scenario_c_end_game_broadcasts_final_leaderboard() {
        let mut s = session();
        let (mut host, mut alpha, mut beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        for _ in 0..4 {
            command(&mut s, &host, HostCommand::NextQuestion);
        }
        host.drain();
        alpha.drain();
        beta.drain();
        command(&mut s, &host, HostCommand::EndGame);
        assert_eq!(s.status(), SessionStatus::Completed);
        for peer in [&mut host, &mut alpha, &mut beta] {
            let frames = peer.drain();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "game_completed");
            let board = frames[0]["data"]["leaderboard"].as_array().unwrap();
            assert_eq!(board.len(), 2);
            assert!(board.iter().all(|t| t["score"] == 0));
        }
        assert!(s.snapshot().completed_at.is_some());
    }

    #[test]
    fn commands_after_completion_are_no_ops() {
        let mut s = session();
        let (mut host, _alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::EndGame);
        host.drain();
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        command(&mut s, &host, HostCommand::StartScoring);
        assert_eq!(s.status(), SessionStatus::Completed);
        assert!(host.drain().is_empty());
    }

    #[test]
    fn end_game_not_allowed_while_waiting() {
        let mut s = session();
        let (host, _alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::EndGame);
        assert_eq!(s.status(), SessionStatus::Waiting);
    }

    #[test]
    fn show_answers_reveals_full_question_to_everyone() {
        let mut s = session();
        let (mut host, mut alpha, _beta) = lobby(&mut s);
        command(&mut s, &host, HostCommand::StartGame);
        command(&mut s, &host, HostCommand::ShowAnswers);
        assert!(alpha.types().iter().all(|t| t != "answers_revealed"));
        command(&mut s, &host, HostCommand::ShowQuestion { question_number: 1 });
        host.drain();
        alpha.drain();
        command(&mut s, &host, HostCommand::ShowAnswers);
        let frames = alpha.drain();
        assert_eq!(frames[0]["type"], "answers_revealed");
        assert_eq!(frames[0]["data"]["question"]["answers"][0]["answer_text"], "Secret 1");
        assert_eq!(host.types(), ["answers_revealed"]);
    }

    #[test]
    fn saturated_connection_is_dropped_and_others_still_receive() {
        let mut s = session();
        let mut host = connect(&mut s, "Quizmaster", Role::Host);
        let mut fast = connect(&mut s, "Fast", Role::Team);
        // Capacity 1: the `connected` frame fills the queue.
        let mut slow = connect_with_capacity(&mut s, "Slow", Role::Team, 1);
        assert_eq!(s.connection_count(), 3);
        host.drain();
        fast.drain();

        command(&mut s, &host, HostCommand::StartGame);
        assert_eq!(s.connection_count(), 2);
        assert_eq!(host.types(), ["game_started"]);
        assert_eq!(fast.types(), ["game_started"]);
        assert!(slow.rx.is_disconnected());
        assert!(!fast.rx.is_disconnected());

        // Messages from the dropped connection are no longer processed.
        join(&mut s, &slow, "Slow");
        assert_eq!(s.team_count(), 0);
    }

    #[test]
    fn leave_clears_host_and_later_commands_are_ignored() {
        let mut s = session();
        let (mut host, _alpha, _beta) = lobby(&mut s);
        s.handle_event(SessionEvent::Leave(host.id));
        assert!(!s.snapshot().has_host);
        // An ordinary leave closes the queue but does not abort the transport.
        assert!(!host.rx.is_disconnected());
        assert_eq!(s.connection_count(), 2);
        command(&mut s, &host, HostCommand::StartGame);
        assert_eq!(s.status(), SessionStatus::Waiting);
    }

    #[test]
    fn newest_host_connection_takes_over() {
        let mut s = session();
        let first = connect(&mut s, "Host A", Role::Host);
        let second = connect(&mut s, "Host B", Role::Host);
        command(&mut s, &first, HostCommand::StartGame);
        assert_eq!(s.status(), SessionStatus::Waiting);
        command(&mut s, &second, HostCommand::StartGame);
        assert_eq!(s.status(), SessionStatus::Active);
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let mut s = session();
        assert!(!s.handle_event(SessionEvent::Shutdown));
    }

    #[derive(Default)]
    struct RecordingContent {
        statuses: Mutex<Vec<String>>,
        answers: Mutex<Vec<AnswerRecord>>,
    }

    #[async_trait]
    impl ContentService for RecordingContent {
        async fn fetch_game(&self, _game_id: i64) -> Result<GameData, ContentError> {
            Err(ContentError::Api("unused".into()))
        }

        async fn create_session(
            &self,
            _request: &SessionCreateRequest,
        ) -> Result<SessionCreateResponse, ContentError> {
            Err(ContentError::Api("unused".into()))
        }

        async fn submit_answer(&self, record: &AnswerRecord) -> Result<(), ContentError> {
            self.answers.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn update_session_status(&self, _session_id: i64, status: &str) -> Result<(), ContentError> {
            self.statuses.lock().unwrap().push(status.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn spawned_session_publishes_snapshots_and_persists() {
        let content = Arc::new(RecordingContent::default());
        let settings = SessionSettings {
            persist_answers: true,
            persist_status: true,
            ..SessionSettings::default()
        };
        let session = GameSession::new(
            info(),
            (1..=3).map(question).collect(),
            &settings,
            Some(content.clone() as Arc<dyn ContentService>),
        );
        let (handle, task) = session.spawn(&settings);

        let (host, mut host_rx) = handle.connect("Quizmaster", Role::Host);
        let host_id = host.id();
        handle.register(host).await.unwrap();
        let (team, mut team_rx) = handle.connect("Alpha", Role::Team);
        let team_id = team.id();
        handle.register(team).await.unwrap();

        let inbound = |from, message| Inbound {
            from,
            sender: "x".into(),
            message,
        };
        handle
            .submit(inbound(
                team_id,
                ClientMessage::JoinTeam(JoinTeam {
                    team_name: "Alpha".into(),
                }),
            ))
            .await
            .unwrap();
        handle
            .submit(inbound(host_id, ClientMessage::HostCommand(HostCommand::StartGame)))
            .await
            .unwrap();
        handle
            .submit(inbound(
                host_id,
                ClientMessage::HostCommand(HostCommand::ShowQuestion { question_number: 1 }),
            ))
            .await
            .unwrap();
        handle
            .submit(inbound(
                team_id,
                ClientMessage::SubmitAnswer(SubmitAnswer {
                    team_name: "Alpha".into(),
                    question_number: 1,
                    answer_text: "42".into(),
                }),
            ))
            .await
            .unwrap();

        // The answer notice is the last thing the host receives; once it arrives
        // every earlier event has been applied.
        loop {
            let frame = host_rx.recv().await.unwrap();
            if frame.contains("answer_submitted") {
                break;
            }
        }
        let snap = handle.snapshot().await;
        assert_eq!(snap.status, SessionStatus::Active);
        assert_eq!(snap.current_question, 1);
        assert_eq!(snap.connections, 2);
        assert_eq!(snap.teams.len(), 1);

        handle.shutdown().await;
        task.await.unwrap();
        assert!(!handle.is_running());
        // Queues closed by shutdown: receivers drain then end.
        while team_rx.recv().await.is_some() {}

        for _ in 0..100 {
            if !content.answers.lock().unwrap().is_empty() && !content.statuses.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(content.statuses.lock().unwrap().as_slice(), ["active"]);
        let answers = content.answers.lock().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].question_id, 101);
        assert_eq!(answers[0].answer, "42");
    }
}
