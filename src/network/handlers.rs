//! Message Handlers
//!
//! One handler per inbound frame type, dispatched by [`route`]. Handlers
//! validate, mutate through the DataStore, reply to the sender and trigger
//! broadcasts. Every error is caught here and turned into a single `error`
//! frame; nothing crashes the connection.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::player::is_bot;
use crate::game::round::PlayerAction;
use crate::game::session::GameSession;
use crate::game::GameError;
use crate::network::connection::ConnectionId;
use crate::network::protocol::{self, ClientMessage, ServerMessage, ValidationIssue};
use crate::network::server::Ctx;
use crate::store::{Lobby, StoreError};

/// A request refused at the handler boundary. Becomes one `error` frame.
#[derive(Debug)]
pub(crate) struct Reject {
    message: String,
    details: Option<Vec<ValidationIssue>>,
}

impl Reject {
    fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    fn invalid(details: Vec<ValidationIssue>) -> Self {
        Self {
            message: "Invalid message".to_string(),
            details: Some(details),
        }
    }
}

impl From<StoreError> for Reject {
    fn from(err: StoreError) -> Self {
        Reject::msg(err.to_string())
    }
}

impl From<GameError> for Reject {
    fn from(err: GameError) -> Self {
        Reject::msg(err.to_string())
    }
}

/// Dispatch one validated inbound message. All handler failures surface as
/// a single error frame to the originating socket.
pub(crate) async fn route(ctx: &Arc<Ctx>, conn_id: ConnectionId, msg: ClientMessage) {
    if let Err(issues) = protocol::validate(&msg) {
        debug!(connection_id = %conn_id, ?issues, "message failed validation");
        send_error(ctx, conn_id, Reject::invalid(issues)).await;
        return;
    }

    let result = match msg {
        ClientMessage::CreateLobby {
            nick,
            lobby_name,
            max_players,
            use_bots,
        } => create_lobby(ctx, conn_id, nick, lobby_name, max_players, use_bots).await,
        ClientMessage::JoinLobby { nick, lobby_id } => {
            join_lobby(ctx, conn_id, nick, &lobby_id).await
        }
        ClientMessage::LeaveLobby { nick, lobby_id } => {
            leave_lobby(ctx, conn_id, nick, &lobby_id).await
        }
        ClientMessage::PingLobbies => {
            ctx.broadcaster.send_lobby_list_to(conn_id).await;
            Ok(())
        }
        ClientMessage::StartGame { nick, lobby_id } => {
            start_game(ctx, conn_id, nick, &lobby_id).await
        }
        ClientMessage::SubscribeToGame { nick, lobby_id } => {
            subscribe_to_game(ctx, conn_id, nick, &lobby_id).await
        }
        ClientMessage::PlayerReady { nick, lobby_id } => {
            player_ready(ctx, nick, &lobby_id).await
        }
        ClientMessage::RestartGame { nick, lobby_id } => {
            restart_game(ctx, nick, &lobby_id).await
        }
        ClientMessage::PlayerAction {
            nick,
            lobby_id,
            action,
        } => player_action(ctx, conn_id, nick, &lobby_id, action).await,
        ClientMessage::LeaveGame { nick, lobby_id } => {
            leave_game(ctx, conn_id, nick, &lobby_id).await
        }
    };

    if let Err(reject) = result {
        send_error(ctx, conn_id, reject).await;
    }
}

async fn send_error(ctx: &Arc<Ctx>, conn_id: ConnectionId, reject: Reject) {
    let frame = ServerMessage::Error {
        message: reject.message,
        details: reject.details,
    };
    send_to(ctx, conn_id, frame).await;
}

async fn send_to(ctx: &Arc<Ctx>, conn_id: ConnectionId, frame: ServerMessage) {
    if let Some(sender) = ctx.connections.sender_for(conn_id).await {
        if sender.try_send(frame).is_err() {
            ctx.connections.record_error(conn_id).await;
        }
    }
}

/// Validated lobby ids still need parsing; a failure here means the lobby
/// can only be stale, which is benign.
fn lobby_uuid(lobby_id: &str) -> Result<Uuid, Reject> {
    Uuid::parse_str(lobby_id).map_err(|_| Reject::msg("Lobby not found"))
}

// =============================================================================
// LOBBY HANDLERS
// =============================================================================

async fn create_lobby(
    ctx: &Arc<Ctx>,
    conn_id: ConnectionId,
    nick: String,
    lobby_name: String,
    max_players: usize,
    use_bots: bool,
) -> Result<(), Reject> {
    let record = ctx
        .connections
        .get(conn_id)
        .await
        .ok_or_else(|| Reject::msg("Connection not registered"))?;

    if ctx.store.find_lobby_with_player(&nick).await.is_some() {
        return Err(Reject::msg("You are already in a lobby"));
    }

    let lobby = Lobby {
        id: Uuid::new_v4(),
        name: lobby_name,
        players: vec![nick.clone()],
        max_players,
        use_bots,
        started: false,
        host: Some(nick.clone()),
    };

    match ctx.store.create_lobby(lobby.clone(), &record.ip).await {
        Ok(()) => {}
        Err(StoreError::RateLimited) => {
            return Err(Reject::msg("Too many lobbies created, slow down"))
        }
        Err(StoreError::CapacityExceeded) => return Err(Reject::msg("Server is full of lobbies")),
        Err(e) => return Err(e.into()),
    }

    info!(lobby_id = %lobby.id, %nick, "lobby created");
    ctx.connections.bind_player(conn_id, &nick, lobby.id).await;
    send_to(ctx, conn_id, ServerMessage::JoinedLobby { nick, lobby }).await;
    ctx.broadcaster.broadcast_lobby_list(true).await;
    Ok(())
}

async fn join_lobby(
    ctx: &Arc<Ctx>,
    conn_id: ConnectionId,
    nick: String,
    lobby_id: &str,
) -> Result<(), Reject> {
    let id = lobby_uuid(lobby_id)?;

    let joined = ctx
        .store
        .update_lobby_with_retry(id, |lobby| {
            if lobby.players.iter().any(|p| p == &nick) {
                return Err("You are already in this lobby");
            }
            if lobby.players.len() >= lobby.max_players {
                return Err("Lobby is full");
            }
            lobby.players.push(nick.clone());
            Ok(lobby.clone())
        })
        .await;

    let lobby = match joined {
        Ok((Ok(lobby), _)) => lobby,
        Ok((Err(msg), _)) => return Err(Reject::msg(msg)),
        Err(StoreError::NotFound) => return Err(Reject::msg("Lobby not found")),
        Err(e) => return Err(e.into()),
    };

    info!(lobby_id = %id, %nick, "player joined lobby");
    ctx.connections.bind_player(conn_id, &nick, id).await;
    send_to(ctx, conn_id, ServerMessage::JoinedLobby { nick, lobby: lobby.clone() }).await;
    ctx.broadcaster.broadcast_lobby_update(&lobby).await;
    ctx.broadcaster.broadcast_lobby_list(true).await;
    Ok(())
}

async fn leave_lobby(
    ctx: &Arc<Ctx>,
    conn_id: ConnectionId,
    nick: String,
    lobby_id: &str,
) -> Result<(), Reject> {
    let id = lobby_uuid(lobby_id)?;

    // A stale lobby id still gets a confirmation; there is nothing to
    // leave, which is what the client wanted anyway.
    finalize_departure(ctx, id, &nick).await;
    ctx.connections.clear_binding(conn_id).await;
    send_to(ctx, conn_id, ServerMessage::LeftLobby { lobby_id: id, nick }).await;
    Ok(())
}

// =============================================================================
// GAME HANDLERS
// =============================================================================

async fn start_game(
    ctx: &Arc<Ctx>,
    conn_id: ConnectionId,
    nick: String,
    lobby_id: &str,
) -> Result<(), Reject> {
    let id = lobby_uuid(lobby_id)?;
    let record = ctx
        .connections
        .get(conn_id)
        .await
        .ok_or_else(|| Reject::msg("Connection not registered"))?;

    let updated = ctx
        .store
        .update_lobby_with_retry(id, |lobby| {
            if lobby.host.as_deref() != Some(nick.as_str()) {
                return Err("Only host can start the game");
            }
            if lobby.use_bots {
                let mut bot_index = 1;
                while lobby.players.len() < lobby.max_players {
                    lobby.players.push(format!("Bot{bot_index}"));
                    bot_index += 1;
                }
            }
            lobby.started = true;
            Ok(lobby.clone())
        })
        .await;

    let lobby = match updated {
        Ok((Ok(lobby), _)) => lobby,
        Ok((Err(msg), _)) => return Err(Reject::msg(msg)),
        Err(StoreError::NotFound) => return Err(Reject::msg("Lobby not found")),
        Err(e) => return Err(e.into()),
    };

    let session = GameSession::new(id, &lobby.players);
    match ctx.store.create_game(session, &record.ip).await {
        Ok(()) => {}
        Err(StoreError::AlreadyExists) => {
            return Err(Reject::msg("Game already started for this lobby"))
        }
        Err(StoreError::RateLimited) => {
            return Err(Reject::msg("Too many games created, slow down"))
        }
        Err(StoreError::CapacityExceeded) => {
            return Err(Reject::msg("Server is full of games"))
        }
        Err(e) => return Err(e.into()),
    }

    info!(lobby_id = %id, players = lobby.players.len(), "game started");
    ctx.connections.set_lobby_in_game(id, true).await;
    ctx.broadcaster
        .broadcast_to_lobby(id, ServerMessage::GameStarted { lobby_id: id })
        .await;
    ctx.broadcaster.broadcast_game_state(id, true).await;
    ctx.broadcaster.broadcast_lobby_list(true).await;
    Ok(())
}

async fn subscribe_to_game(
    ctx: &Arc<Ctx>,
    conn_id: ConnectionId,
    nick: String,
    lobby_id: &str,
) -> Result<(), Reject> {
    let id = lobby_uuid(lobby_id)?;

    ctx.connections.bind_player(conn_id, &nick, id).await;
    ctx.connections.set_in_game(conn_id, true).await;
    send_to(ctx, conn_id, ServerMessage::SubscribedToGame { lobby_id: id }).await;
    debug!(lobby_id = %id, %nick, "subscribed to game");

    // Catch the subscriber up if the game already exists.
    ctx.broadcaster.send_game_state_to(conn_id, id).await;
    Ok(())
}

async fn player_ready(ctx: &Arc<Ctx>, nick: String, lobby_id: &str) -> Result<(), Reject> {
    let id = lobby_uuid(lobby_id)?;

    let (all_ready, _) = ctx
        .store
        .update_game(id, None, |game| game.player_ready(&nick))
        .await
        .map_err(|e| match e {
            StoreError::NotFound => Reject::msg("Game not found"),
            other => other.into(),
        })?;

    debug!(lobby_id = %id, %nick, all_ready, "player ready");
    ctx.broadcaster.broadcast_game_state(id, false).await;

    if !all_ready {
        return Ok(());
    }

    let (armed, _) = ctx
        .store
        .update_game(id, None, |game| game.begin_countdown())
        .await
        .unwrap_or((false, 0));
    if !armed {
        return Ok(());
    }

    info!(lobby_id = %id, "all players ready, starting countdown");
    ctx.broadcaster.broadcast_game_state(id, true).await;

    let ctx = ctx.clone();
    let countdown = ctx.config.countdown_secs;
    tokio::spawn(async move {
        for seconds in (1..=countdown).rev() {
            ctx.broadcaster
                .broadcast_to_lobby(
                    id,
                    ServerMessage::CountdownUpdate {
                        lobby_id: id,
                        seconds,
                    },
                )
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        match ctx
            .store
            .update_game(id, None, |game| game.start_next_round())
            .await
        {
            Ok(_) => {
                ctx.broadcaster.broadcast_game_state(id, true).await;
            }
            Err(e) => {
                // Game evicted or deleted during the countdown.
                warn!(lobby_id = %id, error = %e, "countdown finished but round not started");
            }
        }
    });
    Ok(())
}

async fn restart_game(ctx: &Arc<Ctx>, nick: String, lobby_id: &str) -> Result<(), Reject> {
    let id = lobby_uuid(lobby_id)?;

    let lobby = ctx
        .store
        .lobby(id)
        .await
        .ok_or_else(|| Reject::msg("Lobby not found"))?;
    if lobby.host.as_deref() != Some(nick.as_str()) {
        warn!(lobby_id = %id, %nick, "non-host restart attempt");
        return Err(Reject::msg("Only host can restart the game"));
    }

    ctx.store
        .update_game(id, None, |game| game.reset_round())
        .await
        .map_err(|e| match e {
            StoreError::NotFound => Reject::msg("Game not found"),
            other => other.into(),
        })?;

    info!(lobby_id = %id, "game restarted by host");
    ctx.broadcaster.broadcast_game_state(id, true).await;
    Ok(())
}

async fn player_action(
    ctx: &Arc<Ctx>,
    conn_id: ConnectionId,
    nick: String,
    lobby_id: &str,
    action: PlayerAction,
) -> Result<(), Reject> {
    if !ctx.action_limiter.try_consume(&conn_id.to_string()) {
        return Err(Reject::msg("Rate limit exceeded. Please slow down."));
    }
    let id = lobby_uuid(lobby_id)?;

    let (applied, _) = ctx
        .store
        .update_game(id, None, |game| game.player_action(&nick, action))
        .await
        .map_err(|e| match e {
            StoreError::NotFound => Reject::msg("Game not found"),
            other => other.into(),
        })?;
    applied?;

    ctx.broadcaster.broadcast_game_state(id, false).await;
    Ok(())
}

async fn leave_game(
    ctx: &Arc<Ctx>,
    conn_id: ConnectionId,
    nick: String,
    lobby_id: &str,
) -> Result<(), Reject> {
    let id = lobby_uuid(lobby_id)?;

    finalize_departure(ctx, id, &nick).await;
    ctx.connections.clear_binding(conn_id).await;
    send_to(ctx, conn_id, ServerMessage::LeftGame { lobby_id: id }).await;
    Ok(())
}

// =============================================================================
// DEPARTURE
// =============================================================================

/// Remove a player from their lobby (and game, if one is running),
/// reassigning the host and deleting lobby and game once no humans
/// remain. Used by leave_lobby, leave_game and the disconnect grace
/// timer. Returns the updated lobby if it survived.
pub(crate) async fn finalize_departure(
    ctx: &Arc<Ctx>,
    lobby_id: Uuid,
    nick: &str,
) -> Option<Lobby> {
    let updated = ctx
        .store
        .update_lobby_with_retry(lobby_id, |lobby| {
            lobby.players.retain(|p| p != nick);
            if lobby.host.as_deref() == Some(nick) {
                lobby.host = lobby
                    .players
                    .iter()
                    .find(|p| !is_bot(p))
                    .cloned()
                    .or_else(|| lobby.players.first().cloned());
            }
            lobby.clone()
        })
        .await;

    let lobby = match updated {
        Ok((lobby, _)) => lobby,
        Err(e) => {
            debug!(%lobby_id, nick, error = %e, "departure from missing lobby");
            return None;
        }
    };

    let humans_left = lobby.players.iter().filter(|p| !is_bot(p)).count();
    let has_game = ctx.store.game_exists(lobby_id).await;

    if humans_left == 0 {
        // Bot nicks alone do not keep a lobby alive.
        if has_game {
            ctx.store.delete_game(lobby_id).await;
            ctx.broadcaster.invalidate_game(lobby_id).await;
        }
        ctx.store.delete_lobby(lobby_id).await;
        info!(%lobby_id, "lobby removed, no human players left");
        ctx.broadcaster.broadcast_lobby_list(true).await;
        return None;
    }

    if has_game {
        let _ = ctx
            .store
            .update_game(lobby_id, None, |game| game.remove_player(nick))
            .await;
        ctx.broadcaster.broadcast_game_state(lobby_id, true).await;
    }

    info!(%lobby_id, nick, new_host = ?lobby.host, "player left");
    ctx.broadcaster.broadcast_lobby_update(&lobby).await;
    ctx.broadcaster.broadcast_lobby_list(true).await;
    Some(lobby)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::cards::{Card, CardValue, Suit};
    use crate::game::player::PlayerStatus;
    use crate::game::session::GameStatus;
    use crate::network::connection::ConnectionConfig;
    use crate::network::server::ServerConfig;
    use crate::store::StoreConfig;
    use tokio::sync::mpsc;

    fn card(value: CardValue) -> Card {
        Card {
            suit: Suit::Hearts,
            value,
        }
    }

    fn test_ctx() -> Arc<Ctx> {
        Ctx::new(
            ServerConfig::default(),
            StoreConfig::default(),
            ConnectionConfig::default(),
        )
    }

    async fn connect(ctx: &Arc<Ctx>) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        ctx.connections
            .register(id, "127.0.0.1".to_string(), None, tx)
            .await;
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn find_joined_lobby(frames: &[ServerMessage]) -> Option<Lobby> {
        frames.iter().find_map(|f| match f {
            ServerMessage::JoinedLobby { lobby, .. } => Some(lobby.clone()),
            _ => None,
        })
    }

    fn last_public_state(frames: &[ServerMessage]) -> Option<crate::game::session::PublicGameState> {
        frames.iter().rev().find_map(|f| match f {
            ServerMessage::GameStatePublic { game_state } => Some(game_state.clone()),
            _ => None,
        })
    }

    async fn create_two_player_lobby(
        ctx: &Arc<Ctx>,
        a: ConnectionId,
        a_rx: &mut mpsc::Receiver<ServerMessage>,
        b: ConnectionId,
    ) -> Uuid {
        route(
            ctx,
            a,
            ClientMessage::CreateLobby {
                nick: "A_player".to_string(),
                lobby_name: "table".to_string(),
                max_players: 2,
                use_bots: false,
            },
        )
        .await;
        let lobby = find_joined_lobby(&drain(a_rx)).expect("A joined");

        route(
            ctx,
            b,
            ClientMessage::JoinLobby {
                nick: "B_player".to_string(),
                lobby_id: lobby.id.to_string(),
            },
        )
        .await;
        lobby.id
    }

    /// Overwrite the freshly dealt game with a fixed table: both players
    /// on 19 (10+9), dealer on 18 (10+8), deck top stacked with `extra`.
    async fn rig_game(ctx: &Arc<Ctx>, id: Uuid, extra: &[CardValue]) {
        let extra: Vec<Card> = extra.iter().rev().map(|v| card(*v)).collect();
        ctx.store
            .update_game(id, None, move |game| {
                game.round.in_progress = true;
                game.players.reset_for_round();
                game.dealer.reset();
                game.winner = None;
                let order: Vec<String> = game.players.order().to_vec();
                for nick in &order {
                    game.players.deal(nick, card(CardValue::Ten));
                    game.players.deal(nick, card(CardValue::Nine));
                }
                game.dealer.deal(card(CardValue::Ten));
                game.dealer.deal(card(CardValue::Eight));
                game.deck = extra.clone();
                game.status = GameStatus::PlayerTurn;
                game.current_player = None;
                game.advance_turn();
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validation_failure_returns_issue_list() {
        let ctx = test_ctx();
        let (conn, mut rx) = connect(&ctx).await;

        route(
            &ctx,
            conn,
            ClientMessage::CreateLobby {
                nick: "x".to_string(),
                lobby_name: String::new(),
                max_players: 99,
                use_bots: false,
            },
        )
        .await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerMessage::Error { message, details } => {
                assert_eq!(message, "Invalid message");
                assert_eq!(details.as_ref().unwrap().len(), 3);
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        // No mutation happened.
        assert_eq!(ctx.store.stats().await.lobbies_count, 0);
    }

    #[tokio::test]
    async fn test_create_lobby_binds_and_confirms() {
        let ctx = test_ctx();
        let (conn, mut rx) = connect(&ctx).await;

        route(
            &ctx,
            conn,
            ClientMessage::CreateLobby {
                nick: "amy".to_string(),
                lobby_name: "table".to_string(),
                max_players: 4,
                use_bots: true,
            },
        )
        .await;

        let frames = drain(&mut rx);
        let lobby = find_joined_lobby(&frames).expect("joined_lobby frame");
        assert_eq!(lobby.host.as_deref(), Some("amy"));
        assert_eq!(lobby.players, vec!["amy"]);
        assert!(lobby.use_bots);

        // The creator, not being in a game, also got the list push.
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::LobbyListUpdate { .. })));

        let record = ctx.connections.get(conn).await.unwrap();
        assert_eq!(record.nick.as_deref(), Some("amy"));
        assert_eq!(record.lobby_id, Some(lobby.id));
    }

    #[tokio::test]
    async fn test_duplicate_nick_cannot_create_twice() {
        let ctx = test_ctx();
        let (conn, mut rx) = connect(&ctx).await;

        for _ in 0..2 {
            route(
                &ctx,
                conn,
                ClientMessage::CreateLobby {
                    nick: "amy".to_string(),
                    lobby_name: "table".to_string(),
                    max_players: 4,
                    use_bots: false,
                },
            )
            .await;
        }

        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Error { message, .. } if message == "You are already in a lobby"
        )));
        assert_eq!(ctx.store.stats().await.lobbies_count, 1);
    }

    #[tokio::test]
    async fn test_join_full_lobby_rejected() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, _b_rx) = connect(&ctx).await;
        let (c, mut c_rx) = connect(&ctx).await;

        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;

        route(
            &ctx,
            c,
            ClientMessage::JoinLobby {
                nick: "C_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;

        let frames = drain(&mut c_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Error { message, .. } if message == "Lobby is full"
        )));
        assert_eq!(ctx.store.lobby(lobby_id).await.unwrap().players.len(), 2);
    }

    #[tokio::test]
    async fn test_join_unknown_lobby_is_benign_error() {
        let ctx = test_ctx();
        let (conn, mut rx) = connect(&ctx).await;

        route(
            &ctx,
            conn,
            ClientMessage::JoinLobby {
                nick: "amy".to_string(),
                lobby_id: Uuid::new_v4().to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Error { message, .. } if message == "Lobby not found"
        )));
    }

    #[tokio::test]
    async fn test_leave_lobby_reassigns_host_and_confirms() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, mut b_rx) = connect(&ctx).await;

        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        route(
            &ctx,
            a,
            ClientMessage::LeaveLobby {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;

        let frames = drain(&mut a_rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::LeftLobby { nick, .. } if nick == "A_player")));

        let lobby = ctx.store.lobby(lobby_id).await.unwrap();
        assert_eq!(lobby.players, vec!["B_player"]);
        assert_eq!(lobby.host.as_deref(), Some("B_player"));
    }

    #[tokio::test]
    async fn test_leave_stale_lobby_still_confirms() {
        let ctx = test_ctx();
        let (conn, mut rx) = connect(&ctx).await;

        route(
            &ctx,
            conn,
            ClientMessage::LeaveLobby {
                nick: "amy".to_string(),
                lobby_id: Uuid::new_v4().to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::LeftLobby { .. })));
    }

    #[tokio::test]
    async fn test_last_human_leaving_removes_lobby_and_game() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;

        route(
            &ctx,
            a,
            ClientMessage::CreateLobby {
                nick: "amy".to_string(),
                lobby_name: "solo".to_string(),
                max_players: 2,
                use_bots: true,
            },
        )
        .await;
        let lobby = find_joined_lobby(&drain(&mut a_rx)).unwrap();

        route(
            &ctx,
            a,
            ClientMessage::StartGame {
                nick: "amy".to_string(),
                lobby_id: lobby.id.to_string(),
            },
        )
        .await;
        assert!(ctx.store.game_exists(lobby.id).await);

        // One human plus one bot: the human leaving kills both records.
        route(
            &ctx,
            a,
            ClientMessage::LeaveGame {
                nick: "amy".to_string(),
                lobby_id: lobby.id.to_string(),
            },
        )
        .await;

        assert!(ctx.store.lobby(lobby.id).await.is_none());
        assert!(!ctx.store.game_exists(lobby.id).await);
        let frames = drain(&mut a_rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::LeftGame { .. })));
    }

    #[tokio::test]
    async fn test_only_host_starts_game() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, mut b_rx) = connect(&ctx).await;

        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;
        drain(&mut b_rx);

        route(
            &ctx,
            b,
            ClientMessage::StartGame {
                nick: "B_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;

        let frames = drain(&mut b_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Error { message, .. } if message == "Only host can start the game"
        )));
        assert!(!ctx.store.game_exists(lobby_id).await);
    }

    #[tokio::test]
    async fn test_start_game_fills_bots() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;

        route(
            &ctx,
            a,
            ClientMessage::CreateLobby {
                nick: "amy".to_string(),
                lobby_name: "bots".to_string(),
                max_players: 3,
                use_bots: true,
            },
        )
        .await;
        let lobby = find_joined_lobby(&drain(&mut a_rx)).unwrap();

        route(
            &ctx,
            a,
            ClientMessage::StartGame {
                nick: "amy".to_string(),
                lobby_id: lobby.id.to_string(),
            },
        )
        .await;

        let updated = ctx.store.lobby(lobby.id).await.unwrap();
        assert_eq!(updated.players, vec!["amy", "Bot1", "Bot2"]);
        assert!(updated.started);
        assert!(ctx.store.game_exists(lobby.id).await);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, _b_rx) = connect(&ctx).await;
        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;

        for _ in 0..2 {
            route(
                &ctx,
                a,
                ClientMessage::StartGame {
                    nick: "A_player".to_string(),
                    lobby_id: lobby_id.to_string(),
                },
            )
            .await;
        }

        let frames = drain(&mut a_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Error { message, .. } if message == "Game already started for this lobby"
        )));
    }

    #[tokio::test]
    async fn test_action_rate_limit_rejects_flood() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, _b_rx) = connect(&ctx).await;
        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;

        let limit = ctx.config.action_points;
        for _ in 0..=limit {
            route(
                &ctx,
                a,
                ClientMessage::PlayerAction {
                    nick: "A_player".to_string(),
                    lobby_id: lobby_id.to_string(),
                    action: PlayerAction::Stand,
                },
            )
            .await;
        }

        let frames = drain(&mut a_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Error { message, .. } if message == "Rate limit exceeded. Please slow down."
        )));
    }

    /// Full round end to end: create a two-seat lobby, second player
    /// joins, host starts, both receive game_started and the state pair,
    /// every hand has two cards, A hits until bust and the turn passes to
    /// B automatically.
    #[tokio::test]
    async fn test_end_to_end_round() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, mut b_rx) = connect(&ctx).await;

        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        route(
            &ctx,
            a,
            ClientMessage::StartGame {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;

        for rx in [&mut a_rx, &mut b_rx] {
            let frames = drain(rx);
            assert!(frames
                .iter()
                .any(|f| matches!(f, ServerMessage::GameStarted { .. })));
            assert!(frames
                .iter()
                .any(|f| matches!(f, ServerMessage::GameStatePrivate { .. })));
            let public = last_public_state(&frames).expect("public state");
            for player in public.players.values() {
                assert_eq!(player.hand.len(), 2);
            }
        }

        // Fix the table so the rest is deterministic: both on 19, dealer
        // on 18, and A's next draws are 2 then 5 (21, then bust at 26).
        rig_game(&ctx, lobby_id, &[CardValue::Two, CardValue::Five, CardValue::Six]).await;

        // First hit: 21, A keeps the turn.
        route(
            &ctx,
            a,
            ClientMessage::PlayerAction {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
                action: PlayerAction::Hit,
            },
        )
        .await;
        let public = last_public_state(&drain(&mut a_rx)).expect("state after hit");
        assert_eq!(public.current_player_nick.as_deref(), Some("A_player"));
        assert_eq!(public.players["A_player"].score, 21);

        // Second hit busts; the turn passes to B automatically.
        route(
            &ctx,
            a,
            ClientMessage::PlayerAction {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
                action: PlayerAction::Hit,
            },
        )
        .await;
        let public = last_public_state(&drain(&mut a_rx)).expect("state after bust");
        assert_eq!(public.players["A_player"].status, PlayerStatus::Bust);
        assert_eq!(public.current_player_nick.as_deref(), Some("B_player"));

        // B stands: dealer (18) plays, B's 19 wins, round finished.
        route(
            &ctx,
            b,
            ClientMessage::PlayerAction {
                nick: "B_player".to_string(),
                lobby_id: lobby_id.to_string(),
                action: PlayerAction::Stand,
            },
        )
        .await;
        let public = last_public_state(&drain(&mut b_rx)).expect("final state");
        assert_eq!(public.game_status, GameStatus::Finished);
        assert_eq!(public.winner.as_deref(), Some("B_player"));
        // Dealer hole card revealed at the end.
        assert!(public.dealer.hand.iter().all(|c| !c.is_hidden()));
        assert_eq!(public.dealer.score, 18);
    }

    #[tokio::test]
    async fn test_out_of_turn_action_rejected_end_to_end() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, mut b_rx) = connect(&ctx).await;
        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;

        route(
            &ctx,
            a,
            ClientMessage::StartGame {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;
        rig_game(&ctx, lobby_id, &[CardValue::Two]).await;
        drain(&mut b_rx);

        route(
            &ctx,
            b,
            ClientMessage::PlayerAction {
                nick: "B_player".to_string(),
                lobby_id: lobby_id.to_string(),
                action: PlayerAction::Hit,
            },
        )
        .await;

        let frames = drain(&mut b_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Error { message, .. } if message == "Not your turn"
        )));
    }

    #[tokio::test]
    async fn test_subscribe_catches_up() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, _b_rx) = connect(&ctx).await;
        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;

        route(
            &ctx,
            a,
            ClientMessage::StartGame {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;

        // A fresh socket (reconnect) subscribes and gets the state pair.
        let (c, mut c_rx) = connect(&ctx).await;
        route(
            &ctx,
            c,
            ClientMessage::SubscribeToGame {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;

        let frames = drain(&mut c_rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::SubscribedToGame { .. })));
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::GameStatePublic { .. })));
        match frames
            .iter()
            .find(|f| matches!(f, ServerMessage::GameStatePrivate { .. }))
        {
            Some(ServerMessage::GameStatePrivate { player_state }) => {
                assert_eq!(player_state.nick, "A_player");
            }
            _ => panic!("expected private state for subscriber"),
        }

        let record = ctx.connections.get(c).await.unwrap();
        assert!(record.in_game);
    }

    #[tokio::test]
    async fn test_ready_flow_arms_countdown_once() {
        let ctx = test_ctx();
        let (a, mut a_rx) = connect(&ctx).await;
        let (b, mut b_rx) = connect(&ctx).await;
        let lobby_id = create_two_player_lobby(&ctx, a, &mut a_rx, b).await;

        route(
            &ctx,
            a,
            ClientMessage::StartGame {
                nick: "A_player".to_string(),
                lobby_id: lobby_id.to_string(),
            },
        )
        .await;
        rig_game(&ctx, lobby_id, &[]).await;

        // Finish the round quickly: both stand.
        for (conn, nick) in [(a, "A_player"), (b, "B_player")] {
            route(
                &ctx,
                conn,
                ClientMessage::PlayerAction {
                    nick: nick.to_string(),
                    lobby_id: lobby_id.to_string(),
                    action: PlayerAction::Stand,
                },
            )
            .await;
        }
        let finished = ctx
            .store
            .with_game(lobby_id, |g| g.status())
            .await
            .unwrap();
        assert_eq!(finished, GameStatus::Finished);
        drain(&mut a_rx);
        drain(&mut b_rx);

        // Both ready up; duplicates must not double-arm.
        for nick in ["A_player", "A_player", "B_player", "B_player"] {
            let conn = if nick == "A_player" { a } else { b };
            route(
                &ctx,
                conn,
                ClientMessage::PlayerReady {
                    nick: nick.to_string(),
                    lobby_id: lobby_id.to_string(),
                },
            )
            .await;
        }

        let status = ctx
            .store
            .with_game(lobby_id, |g| g.status())
            .await
            .unwrap();
        assert_eq!(status, GameStatus::WaitingForReady);

        // Give the spawned countdown task a chance to emit its first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Countdown frames reached the table.
        let frames = drain(&mut a_rx);
        let countdowns = frames
            .iter()
            .filter(|f| matches!(f, ServerMessage::CountdownUpdate { .. }))
            .count();
        assert_eq!(countdowns, 1, "one tick so far, no duplicate countdowns");
    }
}
