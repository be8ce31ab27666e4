use std::str::FromStr;

use reel_types::models::SignalTag;

/// One line typed at the demo prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Foreground,
    Background,
    Online,
    Offline,
    Reconnect,
    Peer,
    /// The peer sends us a message
    Say(String),
    Open,
    Reply(String),
    Signals(Option<SignalTag>),
    Post { movie_id: i64, tag: SignalTag, title: String },
    /// Inject a channel error into every open channel
    Drop,
    SignOut,
    SignIn,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  fg | bg                      foreground / background the app
  online | offline             toggle the network
  reconnect                    force every channel to resubscribe
  peer                         show the demo counterpart
  say <text>                   the peer sends you a message
  open                         open the chat with the peer
  reply <text>                 answer the peer
  signals [tag]                list signals, optionally by tag
  post <movie_id> <tag> <title...>
  drop                         inject a channel error
  signout | signin             drop or restore the session
  status                       connection summary
  quit";

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let text = |what: &str| {
            if rest.is_empty() {
                Err(format!("{what} needs some text"))
            } else {
                Ok(rest.to_string())
            }
        };

        match word {
            "fg" => Ok(Self::Foreground),
            "bg" => Ok(Self::Background),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "reconnect" => Ok(Self::Reconnect),
            "peer" => Ok(Self::Peer),
            "say" => text("say").map(Self::Say),
            "open" => Ok(Self::Open),
            "reply" => text("reply").map(Self::Reply),
            "signals" if rest.is_empty() => Ok(Self::Signals(None)),
            "signals" => rest.parse().map(|tag| Self::Signals(Some(tag))),
            "post" => parse_post(rest),
            "drop" => Ok(Self::Drop),
            "signout" => Ok(Self::SignOut),
            "signin" => Ok(Self::SignIn),
            "status" => Ok(Self::Status),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            "" => Err("empty command".into()),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

fn parse_post(rest: &str) -> Result<Command, String> {
    let mut parts = rest.splitn(3, char::is_whitespace);
    let movie_id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or("usage: post <movie_id> <tag> <title...>")?
        .parse::<i64>()
        .map_err(|e| format!("bad movie id: {e}"))?;
    let tag = parts.next().ok_or("missing tag")?.parse::<SignalTag>()?;
    let title = parts.next().map(str::trim).unwrap_or_default();
    if title.is_empty() {
        return Err("missing title".into());
    }

    Ok(Command::Post {
        movie_id,
        tag,
        title: title.to_string(),
    })
}
