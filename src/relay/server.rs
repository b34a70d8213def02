/// Relay server core — session registry, command dispatch, cleanup.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::codec::{CodecError, Frame, Outbound, RelayCodec};
use super::command::{Command, ParseError};
use super::files::{self, FileOffer, TargetKind};
use super::game::{self, pair_key, GameSession, MoveOutcome};

/// Shared server state — the single consistency boundary for every
/// connection handler.
#[derive(Debug, Default)]
pub struct ServerState {
    /// Registered clients: username → handle.
    pub clients: HashMap<String, ClientHandle>,
    /// Active groups: name → membership and admin.
    pub groups: HashMap<String, Group>,
    /// Active games, keyed by the sorted username pair.
    pub games: HashMap<(String, String), GameSession>,
}

impl ServerState {
    /// Usernames of every connected client except `sender`.
    pub fn usernames_except(&self, sender: &str) -> Vec<String> {
        self.clients
            .keys()
            .filter(|name| name.as_str() != sender)
            .cloned()
            .collect()
    }
}

/// Handle for delivering to a connected client from any handler task.
#[derive(Debug)]
pub struct ClientHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::UnboundedSender<Outbound>,
    /// File payloads awaiting this client's READY_TO_RECEIVE ack.
    pub pending_files: VecDeque<FileOffer>,
}

/// A private group: shared-secret membership with a single admin.
#[derive(Debug)]
pub struct Group {
    pub password: String,
    /// Invariant: always a current member.
    pub admin: String,
    /// Members in join order; the oldest remaining member inherits admin.
    pub members: Vec<String>,
}

/// Shared, thread-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

/// Queue a notice line to each named client.
pub fn broadcast(st: &ServerState, usernames: &[String], text: &str) {
    for name in usernames {
        send_to(st, name, text);
    }
}

/// Queue a notice line to one client. A closed queue means the peer is
/// already tearing down; its own handler performs the cleanup.
pub fn send_to(st: &ServerState, username: &str, text: &str) {
    if let Some(handle) = st.clients.get(username) {
        let _ = handle.tx.send(Outbound::Line(text.to_owned()));
    }
}

/// Run the relay server on the given address.
pub async fn run(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("estuary listening on {}", listener.local_addr()?);
    let state: SharedState = Arc::new(RwLock::new(ServerState::default()));
    accept_loop(listener, state).await;
    Ok(())
}

/// Accept loop. A failed accept is logged and the loop continues; the
/// server only stops with the process.
pub async fn accept_loop(listener: TcpListener, state: SharedState) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                info!(%addr, "new connection");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, addr, state).await {
                        warn!(%addr, "client error: {e}");
                    }
                    info!(%addr, "disconnected");
                });
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

/// Handle a single client connection: register a username, then loop over
/// inbound commands and the outbound queue until the stream ends.
async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    state: SharedState,
) -> Result<(), CodecError> {
    let mut framed = Framed::new(socket, RelayCodec::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let username = match register(&mut framed, &tx, addr, &state).await? {
        Some(name) => name,
        None => return Ok(()), // closed before registering
    };
    info!(%addr, %username, "registered");

    {
        let st = state.read().await;
        let others = st.usernames_except(&username);
        broadcast(&st, &others, &format!("{username} has joined the chat."));
    }

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(Frame::Line(line))) => {
                    if line.is_empty() {
                        continue;
                    }
                    match dispatch(&mut framed, &username, &line, &state).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Quit) => break,
                        Err(e) => {
                            warn!(%username, "connection error: {e}");
                            break;
                        }
                    }
                }
                // Chunks only appear while dispatch drives a transfer.
                Some(Ok(Frame::Chunk(_))) => {}
                Some(Err(e)) => {
                    warn!(%username, "stream error: {e}");
                    break;
                }
                None => break,
            },

            // Deliveries queued by other handlers.
            Some(out) = rx.recv() => {
                if let Err(e) = framed.send(out).await {
                    warn!(%username, "write failed: {e}");
                    break;
                }
            }
        }
    }

    cleanup_client(&username, &state).await;
    Ok(())
}

/// Read username lines until a free one arrives; names already in use are
/// rejected and the client may retry on the same connection.
async fn register(
    framed: &mut Framed<TcpStream, RelayCodec>,
    tx: &mpsc::UnboundedSender<Outbound>,
    addr: SocketAddr,
    state: &SharedState,
) -> Result<Option<String>, CodecError> {
    loop {
        let name = match framed.next().await {
            Some(Ok(Frame::Line(line))) => line.trim().to_owned(),
            Some(Ok(Frame::Chunk(_))) => continue,
            Some(Err(e)) => return Err(e),
            None => return Ok(None),
        };
        if name.is_empty() {
            continue;
        }

        let taken = {
            let mut st = state.write().await;
            if st.clients.contains_key(&name) {
                true
            } else {
                st.clients.insert(
                    name.clone(),
                    ClientHandle {
                        addr,
                        tx: tx.clone(),
                        pending_files: VecDeque::new(),
                    },
                );
                false
            }
        };

        if taken {
            framed
                .send(Outbound::Line(format!("Username '{name}' is already taken.")))
                .await?;
            continue;
        }
        return Ok(Some(name));
    }
}

/// Result of handling one command.
enum Flow {
    Continue,
    Quit,
}

/// Parse and execute one command line from `username`. Replies to the
/// issuer go out directly on its stream; everything else is queued on the
/// recipients' handles. The registry lock is never held across a send.
async fn dispatch(
    framed: &mut Framed<TcpStream, RelayCodec>,
    username: &str,
    line: &str,
    state: &SharedState,
) -> Result<Flow, CodecError> {
    let cmd = match Command::parse(line) {
        Ok(cmd) => cmd,
        Err(ParseError::UnknownTargetKind { target, .. }) => {
            framed
                .send(Outbound::Line(format!("Invalid target: {target}")))
                .await?;
            return Ok(Flow::Continue);
        }
        Err(e) => {
            warn!(username, "bad command: {e}");
            framed
                .send(Outbound::Line(format!("Invalid command: {e}")))
                .await?;
            return Ok(Flow::Continue);
        }
    };

    match cmd {
        Command::Public(text) => {
            let st = state.read().await;
            let others = st.usernames_except(username);
            broadcast(&st, &others, &format!("{username}: {text}"));
        }

        Command::Private { to, text } => {
            let st = state.read().await;
            if st.clients.contains_key(&to) {
                send_to(&st, &to, &format!("[Private] {username}: {text}"));
                drop(st);
                framed
                    .send(Outbound::Line(format!("[Private to {to}]: {text}")))
                    .await?;
            } else {
                drop(st);
                framed
                    .send(Outbound::Line(format!("User {to} not found.")))
                    .await?;
            }
        }

        Command::GroupMsg { group, text } => {
            let st = state.read().await;
            let others: Option<Vec<String>> = match st.groups.get(&group) {
                Some(g) if g.members.iter().any(|m| m.as_str() == username) => Some(
                    g.members
                        .iter()
                        .filter(|m| m.as_str() != username)
                        .cloned()
                        .collect(),
                ),
                _ => None,
            };
            match others {
                Some(list) => broadcast(&st, &list, &format!("[{group}] {username}: {text}")),
                None => {
                    drop(st);
                    framed
                        .send(Outbound::Line(format!("You are not in group '{group}'.")))
                        .await?;
                }
            }
        }

        Command::Create { group, password } => {
            let mut st = state.write().await;
            let reply = if st.groups.contains_key(&group) {
                format!("Group '{group}' already exists.")
            } else {
                st.groups.insert(
                    group.clone(),
                    Group {
                        password,
                        admin: username.to_owned(),
                        members: vec![username.to_owned()],
                    },
                );
                format!("Private group '{group}' created.")
            };
            drop(st);
            framed.send(Outbound::Line(reply)).await?;
        }

        Command::Join { group, password } => {
            let mut st = state.write().await;
            let joined: Option<Vec<String>> = match st.groups.get_mut(&group) {
                Some(g) if g.password == password => {
                    if !g.members.iter().any(|m| m.as_str() == username) {
                        g.members.push(username.to_owned());
                    }
                    Some(
                        g.members
                            .iter()
                            .filter(|m| m.as_str() != username)
                            .cloned()
                            .collect(),
                    )
                }
                _ => None,
            };
            match joined {
                Some(others) => {
                    broadcast(&st, &others, &format!("{username} has joined the group {group}."));
                    drop(st);
                    framed
                        .send(Outbound::Line(format!("Joined private group '{group}'.")))
                        .await?;
                }
                None => {
                    drop(st);
                    framed
                        .send(Outbound::Line("Invalid group name or password.".to_owned()))
                        .await?;
                }
            }
        }

        Command::Leave { group } => {
            let mut st = state.write().await;
            match remove_from_group(&mut st, &group, username) {
                GroupRemoval::NotAMember => {
                    drop(st);
                    framed
                        .send(Outbound::Line(format!("You are not in group '{group}'.")))
                        .await?;
                }
                GroupRemoval::Removed { remaining, promoted } => {
                    if let Some(new_admin) = promoted {
                        send_to(&st, &new_admin, &format!("You are now the admin of {group}"));
                    }
                    broadcast(&st, &remaining, &format!("{username} has left the group {group}."));
                    drop(st);
                    framed
                        .send(Outbound::Line(format!("You left group '{group}'.")))
                        .await?;
                }
            }
        }

        Command::Kick { group, user } => {
            let mut st = state.write().await;
            let is_admin = st
                .groups
                .get(&group)
                .is_some_and(|g| g.admin == username);
            if !is_admin {
                drop(st);
                framed
                    .send(Outbound::Line(format!("You are not the admin of '{group}'.")))
                    .await?;
                return Ok(Flow::Continue);
            }
            // The admin cannot be the target (only the admin kicks), so no
            // promotion can follow a kick.
            let is_member = user != username
                && st
                    .groups
                    .get(&group)
                    .is_some_and(|g| g.members.iter().any(|m| *m == user));
            if !is_member {
                drop(st);
                framed
                    .send(Outbound::Line(format!("User {user} not found in group {group}.")))
                    .await?;
                return Ok(Flow::Continue);
            }
            if let Some(g) = st.groups.get_mut(&group) {
                g.members.retain(|m| *m != user);
            }
            send_to(&st, &user, &format!("You were kicked from group '{group}'."));
            let remaining: Vec<String> = st
                .groups
                .get(&group)
                .map(|g| g.members.clone())
                .unwrap_or_default();
            broadcast(&st, &remaining, &format!("{user} was kicked from group {group}."));
        }

        Command::FileOffer { kind, target, filename, size } => {
            // Acknowledge, then consume exactly `size` bytes from this stream.
            framed.send(Outbound::Line("READY".to_owned())).await?;
            let Some(data) = files::read_payload(framed, size).await? else {
                return Ok(Flow::Quit); // sender vanished mid-payload
            };

            let mut st = state.write().await;
            let resolved: Option<Vec<String>> = match kind {
                TargetKind::Group => st.groups.get(&target).map(|g| {
                    g.members
                        .iter()
                        .filter(|m| m.as_str() != username)
                        .cloned()
                        .collect()
                }),
                TargetKind::Private => {
                    if target != username && st.clients.contains_key(&target) {
                        Some(vec![target.clone()])
                    } else {
                        None
                    }
                }
            };
            match resolved {
                None => {
                    drop(st);
                    framed
                        .send(Outbound::Line(format!("Invalid target: {target}")))
                        .await?;
                }
                Some(recipients) => {
                    for name in &recipients {
                        if let Some(handle) = st.clients.get_mut(name) {
                            handle.pending_files.push_back(FileOffer {
                                filename: filename.clone(),
                                data: data.clone(),
                            });
                            let _ = handle
                                .tx
                                .send(Outbound::Line(files::offer_header(&filename, data.len())));
                        }
                    }
                    info!(
                        username,
                        filename = %filename,
                        recipients = recipients.len(),
                        "file relayed"
                    );
                }
            }
        }

        Command::ReadyToReceive => {
            let offer = {
                let mut st = state.write().await;
                st.clients
                    .get_mut(username)
                    .and_then(|h| h.pending_files.pop_front())
            };
            match offer {
                Some(offer) => framed.send(Outbound::Raw(offer.data)).await?,
                None => warn!(username, "READY_TO_RECEIVE with no pending file"),
            }
        }

        Command::GameRequest { opponent } => {
            let st = state.read().await;
            if st.clients.contains_key(&opponent) {
                send_to(&st, &opponent, &format!("/tictactoe_request {username} {opponent}"));
            } else {
                drop(st);
                framed
                    .send(Outbound::Line(format!("User {opponent} not found.")))
                    .await?;
            }
        }

        Command::GameAccept { initiator } => {
            let mut st = state.write().await;
            if initiator == username || !st.clients.contains_key(&initiator) {
                drop(st);
                framed
                    .send(Outbound::Line(format!("User {initiator} not available.")))
                    .await?;
                return Ok(Flow::Continue);
            }
            let key = pair_key(&initiator, username);
            if st.games.contains_key(&key) {
                // One session per pair; the running game is untouched.
                send_to(&st, &initiator, &format!("Failed to start game with {username}."));
                drop(st);
                framed
                    .send(Outbound::Line(format!("Failed to start game with {initiator}.")))
                    .await?;
                return Ok(Flow::Continue);
            }
            st.games.insert(key, GameSession::new(&initiator, username));
            send_to(&st, &initiator, &format!("/tictactoe_start {username} {initiator}"));
            info!(username, initiator = %initiator, "tic-tac-toe started");
            drop(st);
            framed
                .send(Outbound::Line(format!("/tictactoe_start {initiator} {initiator}")))
                .await?;
        }

        Command::GameDecline { initiator } => {
            let st = state.read().await;
            send_to(
                &st,
                &initiator,
                &format!("{username} declined your Tic Tac Toe request."),
            );
        }

        Command::GameMove { opponent, index, mark } => {
            let key = pair_key(username, &opponent);
            let mut st = state.write().await;
            let applied = st
                .games
                .get_mut(&key)
                .map(|session| session.apply(username, index, mark));
            match applied {
                None => {
                    drop(st);
                    framed
                        .send(Outbound::Line(format!("No active game with {opponent}.")))
                        .await?;
                }
                Some(Err(reason)) => {
                    drop(st);
                    framed
                        .send(Outbound::Line(format!("Move rejected: {reason}")))
                        .await?;
                }
                Some(Ok(outcome)) => {
                    send_to(&st, &opponent, &game::move_notice(index, mark));
                    match outcome {
                        MoveOutcome::Continue => {}
                        MoveOutcome::Win(_) => {
                            st.games.remove(&key);
                            let result = format!("Tic Tac Toe: {username} wins.");
                            send_to(&st, &opponent, &result);
                            drop(st);
                            framed.send(Outbound::Line(result)).await?;
                        }
                        MoveOutcome::Draw => {
                            st.games.remove(&key);
                            let result = "Tic Tac Toe: it's a draw.".to_owned();
                            send_to(&st, &opponent, &result);
                            drop(st);
                            framed.send(Outbound::Line(result)).await?;
                        }
                    }
                }
            }
        }

        Command::GameEnd { opponent } => {
            let mut st = state.write().await;
            if st.games.remove(&pair_key(username, &opponent)).is_some() {
                send_to(&st, &opponent, "/tictactoe_end");
            }
        }

        Command::Quit => return Ok(Flow::Quit),
    }

    Ok(Flow::Continue)
}

/// Outcome of removing a member from one group.
#[derive(Debug)]
enum GroupRemoval {
    NotAMember,
    Removed {
        remaining: Vec<String>,
        promoted: Option<String>,
    },
}

/// Remove `username` from `group`: promote the oldest remaining member if
/// the admin left, delete the group when it empties.
fn remove_from_group(st: &mut ServerState, group: &str, username: &str) -> GroupRemoval {
    let (now_empty, promoted, remaining) = {
        let Some(g) = st.groups.get_mut(group) else {
            return GroupRemoval::NotAMember;
        };
        let Some(pos) = g.members.iter().position(|m| m.as_str() == username) else {
            return GroupRemoval::NotAMember;
        };
        g.members.remove(pos);

        let mut promoted = None;
        if g.admin == username {
            if let Some(oldest) = g.members.first() {
                g.admin = oldest.clone();
                promoted = Some(oldest.clone());
            }
        }
        (g.members.is_empty(), promoted, g.members.clone())
    };

    if now_empty {
        st.groups.remove(group);
    }
    GroupRemoval::Removed { remaining, promoted }
}

/// Clean up after a disconnected client: every group it belonged to, every
/// game it was playing, its pending offers and registry entry. Runs once,
/// when the handler loop exits.
async fn cleanup_client(username: &str, state: &SharedState) {
    let mut st = state.write().await;

    let Some(handle) = st.clients.remove(username) else {
        return; // never registered or already cleaned up
    };

    // Equivalent to `leave` on every group the client belonged to.
    let group_names: Vec<String> = st.groups.keys().cloned().collect();
    for group in group_names {
        if let GroupRemoval::Removed { remaining, promoted } =
            remove_from_group(&mut st, &group, username)
        {
            if let Some(new_admin) = promoted {
                send_to(&st, &new_admin, &format!("You are now the admin of {group}"));
            }
            broadcast(&st, &remaining, &format!("{username} has left the group {group}."));
        }
    }

    // End every game the client was part of; the opponent gets the signal.
    let keys: Vec<(String, String)> = st
        .games
        .keys()
        .filter(|(a, b)| a.as_str() == username || b.as_str() == username)
        .cloned()
        .collect();
    for key in keys {
        st.games.remove(&key);
        let opponent = if key.0 == username { &key.1 } else { &key.0 };
        send_to(&st, opponent, "/tictactoe_end");
    }

    let others = st.usernames_except(username);
    broadcast(&st, &others, &format!("{username} has left the chat."));
    info!(addr = %handle.addr, username, "cleaned up");
}
