/// Client command parsing.
///
/// The protocol is line-oriented: the first whitespace token selects the
/// command, `@name` addresses a private message, `/file:` headers are
/// colon-separated, and anything that matches no command form is a public
/// message. Matching is on the whole first token, so `/tictactoe_end` can
/// never be mistaken for a `/tictactoe` move.
use super::files::TargetKind;
use super::game::Mark;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Free text, broadcast to everyone but the sender.
    Public(String),
    /// `/groupmsg <group> <text>`
    GroupMsg { group: String, text: String },
    /// `@<user> <text>`
    Private { to: String, text: String },
    /// `/create <group> <password>`
    Create { group: String, password: String },
    /// `/join <group> <password>`
    Join { group: String, password: String },
    /// `/leave <group>`
    Leave { group: String },
    /// `/kick <group> <user>`
    Kick { group: String, user: String },
    /// `/file:<kind>:<target>:<filename>:<size>`
    FileOffer {
        kind: TargetKind,
        target: String,
        filename: String,
        size: u64,
    },
    /// The recipient side of the file handshake.
    ReadyToReceive,
    /// `/tictactoe_request <opponent> <initiator>`
    GameRequest { opponent: String },
    /// `/tictactoe_accept <initiator>`
    GameAccept { initiator: String },
    /// `/tictactoe_decline <initiator>`
    GameDecline { initiator: String },
    /// `/tictactoe <opponent> <idx> <mark>`
    GameMove {
        opponent: String,
        index: usize,
        mark: Mark,
    },
    /// `/tictactoe_end <opponent>`
    GameEnd { opponent: String },
    /// `/quit`
    Quit,
}

/// Errors describing a malformed command line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("{command} requires {expected}")]
    MissingArgument {
        command: &'static str,
        expected: &'static str,
    },
    #[error("unknown file target kind '{kind}'")]
    UnknownTargetKind { kind: String, target: String },
    #[error("malformed file transfer header")]
    MalformedFileHeader,
    #[error("'{0}' is not a valid file size")]
    InvalidSize(String),
    #[error("'{0}' is not a valid cell index")]
    InvalidIndex(String),
    #[error("'{0}' is not a valid mark")]
    InvalidMark(String),
}

fn missing(command: &'static str, expected: &'static str) -> ParseError {
    ParseError::MissingArgument { command, expected }
}

/// One non-empty argument; surrounding whitespace trimmed.
fn one_arg(rest: Option<&str>) -> Option<&str> {
    rest.map(str::trim).filter(|s| !s.is_empty())
}

/// A token followed by a non-empty remainder (which may contain spaces).
fn two_args(rest: Option<&str>) -> Option<(&str, &str)> {
    let (a, b) = rest?.split_once(' ')?;
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a, b))
}

impl Command {
    /// Parse one inbound line (terminator already stripped by the codec).
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        if let Some(rest) = line.strip_prefix('@') {
            let (to, text) =
                two_args(Some(rest)).ok_or_else(|| missing("@<user>", "a user name and a message"))?;
            return Ok(Command::Private {
                to: to.to_owned(),
                text: text.to_owned(),
            });
        }

        if let Some(rest) = line.strip_prefix("/file:") {
            return parse_file_header(rest);
        }

        if line == "READY_TO_RECEIVE" {
            return Ok(Command::ReadyToReceive);
        }

        if !line.starts_with('/') {
            return Ok(Command::Public(line.to_owned()));
        }

        let (head, rest) = match line.split_once(' ') {
            Some((head, rest)) => (head, Some(rest)),
            None => (line, None),
        };

        match head {
            "/create" => {
                let (group, password) = two_args(rest)
                    .ok_or_else(|| missing("/create", "a group name and a password"))?;
                Ok(Command::Create {
                    group: group.to_owned(),
                    password: password.to_owned(),
                })
            }
            "/join" => {
                let (group, password) =
                    two_args(rest).ok_or_else(|| missing("/join", "a group name and a password"))?;
                Ok(Command::Join {
                    group: group.to_owned(),
                    password: password.to_owned(),
                })
            }
            "/leave" => {
                let group = one_arg(rest).ok_or_else(|| missing("/leave", "a group name"))?;
                Ok(Command::Leave {
                    group: group.to_owned(),
                })
            }
            "/kick" => {
                let (group, user) =
                    two_args(rest).ok_or_else(|| missing("/kick", "a group name and a user name"))?;
                Ok(Command::Kick {
                    group: group.to_owned(),
                    user: user.trim().to_owned(),
                })
            }
            "/groupmsg" => {
                let (group, text) =
                    two_args(rest).ok_or_else(|| missing("/groupmsg", "a group name and a message"))?;
                Ok(Command::GroupMsg {
                    group: group.to_owned(),
                    text: text.to_owned(),
                })
            }
            "/tictactoe_request" => {
                // The trailing initiator token is the sender's own name; the
                // server trusts the registry for identity, not the wire.
                let args = one_arg(rest)
                    .ok_or_else(|| missing("/tictactoe_request", "an opponent name"))?;
                let opponent = args.split(' ').next().unwrap_or(args);
                Ok(Command::GameRequest {
                    opponent: opponent.to_owned(),
                })
            }
            "/tictactoe_accept" => {
                let initiator =
                    one_arg(rest).ok_or_else(|| missing("/tictactoe_accept", "an opponent name"))?;
                Ok(Command::GameAccept {
                    initiator: initiator.to_owned(),
                })
            }
            "/tictactoe_decline" => {
                let initiator =
                    one_arg(rest).ok_or_else(|| missing("/tictactoe_decline", "an opponent name"))?;
                Ok(Command::GameDecline {
                    initiator: initiator.to_owned(),
                })
            }
            "/tictactoe_end" => {
                let opponent =
                    one_arg(rest).ok_or_else(|| missing("/tictactoe_end", "an opponent name"))?;
                Ok(Command::GameEnd {
                    opponent: opponent.to_owned(),
                })
            }
            "/tictactoe" => {
                let args = rest
                    .ok_or_else(|| missing("/tictactoe", "an opponent, a cell index and a mark"))?;
                let mut parts = args.splitn(3, ' ');
                let (Some(opponent), Some(idx), Some(mark)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(missing("/tictactoe", "an opponent, a cell index and a mark"));
                };
                if opponent.is_empty() {
                    return Err(missing("/tictactoe", "an opponent, a cell index and a mark"));
                }
                let index = idx
                    .parse::<usize>()
                    .map_err(|_| ParseError::InvalidIndex(idx.to_owned()))?;
                let mark = Mark::parse(mark.trim())
                    .ok_or_else(|| ParseError::InvalidMark(mark.trim().to_owned()))?;
                Ok(Command::GameMove {
                    opponent: opponent.to_owned(),
                    index,
                    mark,
                })
            }
            "/quit" => Ok(Command::Quit),
            // Unknown slash commands fall through to the public broadcast,
            // the protocol's default row.
            _ => Ok(Command::Public(line.to_owned())),
        }
    }
}

/// `<kind>:<target>:<filename>:<size>` — the part after `/file:`.
fn parse_file_header(rest: &str) -> Result<Command, ParseError> {
    let mut parts = rest.splitn(4, ':');
    let (Some(kind), Some(target), Some(filename), Some(size)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::MalformedFileHeader);
    };
    if target.is_empty() || filename.is_empty() {
        return Err(ParseError::MalformedFileHeader);
    }
    let kind = TargetKind::parse(kind).ok_or_else(|| ParseError::UnknownTargetKind {
        kind: kind.to_owned(),
        target: target.to_owned(),
    })?;
    let size = size
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidSize(size.to_owned()))?;
    Ok(Command::FileOffer {
        kind,
        target: target.to_owned(),
        filename: filename.to_owned(),
        size,
    })
}
