mod command;

use std::path::PathBuf;
use std::sync::Arc;

use reel_db::cleanup::run_cleanup_loop;
use reel_db::{Database, Dispatcher, LocalBackend};
use reel_realtime::{ChatWindowSync, ConversationListSync, Datastore, RealtimeClient, RealtimeConfig, Visibility};
use reel_types::api::{CreateSignalRequest, SignalFilter};
use reel_types::models::Profile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::{Command, HELP};

struct Shell {
    backend: Arc<LocalBackend>,
    client: RealtimeClient<Dispatcher, LocalBackend>,
    session: watch::Sender<Option<Uuid>>,
    me: Profile,
    peer: Profile,
    chat: Option<ChatWindowSync<LocalBackend>>,
    inbox: ConversationListSync<LocalBackend>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reel=debug,reel_realtime=debug,reel_db=info".into()),
        )
        .init();

    // Config
    let config = RealtimeConfig::from_env()?;
    let db_path = std::env::var("REEL_DB_PATH").unwrap_or_else(|_| "reel.db".into());
    let cleanup_secs: u64 = std::env::var("REEL_CLEANUP_INTERVAL_SECS")
        .unwrap_or_else(|_| "300".into())
        .parse()?;
    let display_name = std::env::var("REEL_DISPLAY_NAME").ok();

    // Init database and the local backend
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);
    let backend = Arc::new(LocalBackend::new(db));

    let cancel = CancellationToken::new();
    let cleanup = tokio::spawn(run_cleanup_loop(backend.clone(), cleanup_secs, cancel.clone()));

    let me = backend.sign_in_anonymously(display_name).await?;
    let peer = backend.sign_in_anonymously(Some("peer".into())).await?;
    info!("Signed in as {} ({})", me.display_name, me.id);

    let (session, identity) = watch::channel(Some(me.id));
    let client = RealtimeClient::new(Arc::new(backend.dispatcher().clone()), backend.clone(), config, identity);

    spawn_reporters(&client);
    let inbox = client.conversation_list();
    client.signal_watcher();
    info!(
        "Listening on {} and {}",
        client.config().messages_channel(me.id),
        client.config().signals_channel
    );

    let mut shell = Shell {
        backend,
        client,
        session,
        me,
        peer,
        chat: None,
        inbox,
    };

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = shell.run(command).await {
            warn!("Command failed: {}", e);
        }
    }

    info!("Shutting down");
    cancel.cancel();
    let _ = cleanup.await;
    Ok(())
}

/// Log badge and arrival changes as they happen.
fn spawn_reporters(client: &RealtimeClient<Dispatcher, LocalBackend>) {
    let mut badge = client.unread_badge();
    tokio::spawn(async move {
        while let Ok(label) = badge.changed().await {
            info!(badge = label.as_deref().unwrap_or("-"), "unread badge");
        }
    });

    let mut latest = client.hub().watch_latest();
    tokio::spawn(async move {
        while latest.changed().await.is_ok() {
            if let Some(incoming) = latest.borrow_and_update().clone() {
                info!(seq = incoming.seq, from = %incoming.message.sender_id, "new message");
            }
        }
    });
}

impl Shell {
    async fn run(&mut self, command: Command) -> anyhow::Result<()> {
        let connectivity = self.client.connectivity();

        match command {
            Command::Foreground => connectivity.set_visibility(Visibility::Foreground),
            Command::Background => connectivity.set_visibility(Visibility::Background),
            Command::Online => connectivity.set_online(true),
            Command::Offline => {
                self.inject_failure("network lost");
                connectivity.set_online(false);
            }
            Command::Reconnect => {
                self.client.hub().reconnect();
                self.client.signal_watcher().reconnect();
            }
            Command::Peer => println!("peer: {} ({})", self.peer.display_name, self.peer.id),
            Command::Say(text) => {
                self.backend.send_message(self.peer.id, self.me.id, text).await?;
            }
            Command::Open => {
                let chat = self.client.chat(self.peer.id)?;
                let mut view = chat.watch_view();
                view.wait_for(|v| !v.loading).await?;
                for entry in &view.borrow().messages {
                    let who = if entry.message.sender_id == self.me.id { "me" } else { "peer" };
                    println!("[{}] {}: {}", entry.message.created_at.format("%H:%M"), who, entry.message.content);
                }
                self.chat = Some(chat);
            }
            Command::Reply(text) => match &self.chat {
                Some(chat) => {
                    chat.send(text).await?;
                }
                None => {
                    self.backend.send_message(self.me.id, self.peer.id, text).await?;
                }
            },
            Command::Signals(tag) => {
                let watcher = self.client.signal_watcher();
                let count = watcher
                    .set_filter(SignalFilter {
                        tag,
                        ..SignalFilter::default()
                    })
                    .await?;
                println!("{count} signal(s)");
                for entry in watcher.listing().signals {
                    let name = entry.profile.as_ref().map(|p| p.display_name.as_str()).unwrap_or("?");
                    println!("  {} [{}] {} by {}", entry.signal.movie_id, entry.signal.tag, entry.signal.movie_title, name);
                }
            }
            Command::Post { movie_id, tag, title } => {
                let posted = self
                    .backend
                    .create_signal(self.me.id, CreateSignalRequest::new(movie_id, title, tag))
                    .await?;
                println!("posted signal {}", posted.signal.id);
            }
            Command::Drop => {
                let failed = self.inject_failure("injected fault");
                println!("failed {failed} channel(s)");
            }
            Command::SignOut => {
                self.chat = None;
                self.session.send_replace(None);
            }
            Command::SignIn => {
                self.session.send_replace(Some(self.me.id));
            }
            Command::Status => self.print_status(),
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }

        Ok(())
    }

    fn inject_failure(&self, reason: &str) -> usize {
        let dispatcher = self.backend.dispatcher();
        dispatcher.inject_failure("messages", reason) + dispatcher.inject_failure("signals", reason)
    }

    fn print_status(&self) {
        let hub = self.client.hub();
        let inbox = self.inbox.view();
        println!("identity:  {}", hub.identity().map(|id| id.to_string()).unwrap_or_else(|| "-".into()));
        println!("messages:  {} ({})", hub.connection_status(), hub.connection_status().label());
        println!("polling:   {}", hub.is_polling());
        println!("unread:    {}", hub.unread_count());
        println!("signals:   {}", self.client.signal_watcher().connection_status());
        println!("channels:  {}", self.backend.dispatcher().channel_count());
        println!("inbox:     {} conversation(s)", inbox.conversations.len());
        if let Some(advisory) = inbox.advisory {
            println!("           {advisory}");
        }
    }
}
