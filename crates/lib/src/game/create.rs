//! Session creation: register upstream, load the game, spawn, publish.

use std::sync::Arc;

use super::registry::{RegistryError, SessionRegistry};
use super::session::{GameSession, SessionHandle, SessionInfo, SessionSettings};
use crate::content::{ContentError, ContentService, SessionCreateRequest};

#[derive(Debug, thiserror::Error)]
pub enum CreateSessionError {
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("no unused session code after {attempts} attempt(s)")]
    CodeCollision { attempts: u32 },
}

/// What the caller gets back for a freshly created session.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub handle: SessionHandle,
    pub session_id: i64,
    pub game_name: String,
    pub questions: u32,
}

/// Create a session for `request` and make it reachable through `registry`.
///
/// Upstream failures abort creation with nothing registered. A code that is
/// already live is retried up to `max_code_attempts` times.
pub async fn create_session(
    registry: &SessionRegistry,
    content: Arc<dyn ContentService>,
    settings: &SessionSettings,
    request: &SessionCreateRequest,
    max_code_attempts: u32,
) -> Result<CreatedSession, CreateSessionError> {
    let attempts = max_code_attempts.max(1);
    for attempt in 1..=attempts {
        let created = content.create_session(request).await?;
        let code = created.session_code.trim().to_string();
        if registry.contains(&code).await {
            log::warn!(
                "session code {} already live (attempt {}/{})",
                code,
                attempt,
                attempts
            );
            continue;
        }

        let game = content.fetch_game(created.game_id).await?;
        let game_name = if created.game_name.is_empty() {
            game.game.name.clone()
        } else {
            created.game_name.clone()
        };
        let questions = game.questions.len() as u32;
        let info = SessionInfo {
            session_id: created.session_id,
            code: code.clone(),
            game_id: created.game_id,
            game_name: game_name.clone(),
        };
        let session = GameSession::new(info, game.questions, settings, Some(content.clone()));
        let (handle, _task) = session.spawn(settings);

        match registry.insert(handle.clone()).await {
            Ok(()) => {
                log::info!(
                    "created session {} for game {} ({} questions)",
                    code,
                    created.game_id,
                    questions
                );
                return Ok(CreatedSession {
                    handle,
                    session_id: created.session_id,
                    game_name,
                    questions,
                });
            }
            Err(RegistryError::CodeInUse(_)) => {
                log::warn!("session code {} claimed concurrently (attempt {}/{})", code, attempt, attempts);
                handle.shutdown().await;
            }
        }
    }
    Err(CreateSessionError::CodeCollision { attempts })
}
