use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

use social_realtime::client::services::api_client::ApiClient;
use social_realtime::client::services::notification_actions::{NotificationAction, NotificationActions};
use social_realtime::client::services::outbound::OutgoingChat;
use social_realtime::common::models::{GroupId, UserId, VoteChoice};
use social_realtime::utils::logger::StreamLogger;
use social_realtime::{ClientConfig, ConnectionManager, InboundMessage};

#[derive(Parser, Debug)]
#[command(name = "social-realtime")]
#[command(about = "Terminal client for the social network message stream")]
struct Args {
    /// Identity to connect as; asked to the session endpoint when omitted
    #[arg(short, long)]
    user_id: Option<UserId>,
    #[arg(long)]
    stream_url: Option<String>,
    #[arg(long)]
    backend_url: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Private(UserId, String),
    Group(GroupId, String),
    Online,
    Messages,
    Notifications,
    Act(usize, NotificationAction),
    Clear,
    History(UserId),
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();
    let number = |i: usize| -> Result<u64, String> {
        args.get(i)
            .ok_or_else(|| format!("{} needs more arguments", command))?
            .parse::<u64>()
            .map_err(|_| format!("'{}' is not a number", args[i]))
    };
    let index = |i: usize| -> Result<usize, String> {
        let n = number(i)?;
        if n == 0 {
            return Err("notifications are numbered from 1".to_string());
        }
        Ok(n as usize - 1)
    };

    match command {
        "/pm" if args.len() >= 2 => Ok(Command::Private(number(0)?, args[1..].join(" "))),
        "/gm" if args.len() >= 2 => Ok(Command::Group(number(0)?, args[1..].join(" "))),
        "/online" => Ok(Command::Online),
        "/messages" => Ok(Command::Messages),
        "/notifications" => Ok(Command::Notifications),
        "/accept" => Ok(Command::Act(index(0)?, NotificationAction::Accept)),
        "/decline" => Ok(Command::Act(index(0)?, NotificationAction::Decline)),
        "/vote" if args.len() == 2 => {
            let choice = VoteChoice::parse(args[1]).ok_or("vote must be yes or no")?;
            Ok(Command::Act(index(0)?, NotificationAction::Vote(choice)))
        }
        "/clear" => Ok(Command::Clear),
        "/history" => Ok(Command::History(number(0)?)),
        "/status" => Ok(Command::Status),
        "/help" => Ok(Command::Help),
        "/quit" => Ok(Command::Quit),
        _ => Err("Invalid command syntax, try /help".to_string()),
    }
}

const HELP: &str = "/pm <user> <text>  /gm <group> <text>  /online  /messages  /notifications\n\
/accept <n>  /decline <n>  /vote <n> yes|no  /clear  /history <user>  /status  /quit";

fn describe(message: &InboundMessage) -> String {
    let who = message
        .username
        .clone()
        .or_else(|| message.from.map(|id| format!("user {}", id)))
        .unwrap_or_else(|| "server".to_string());
    match message.group_id {
        Some(group) => format!("[{}] [group {}] {}: {}", message.kind, group, who, message.content),
        None => format!("[{}] {}: {}", message.kind, who, message.content),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ClientConfig::from_env();
    if let Some(url) = args.stream_url {
        config.stream_url = url;
    }
    if let Some(url) = args.backend_url {
        config.backend_url = url;
    }
    StreamLogger::init(&config.log_level);

    let api = Arc::new(ApiClient::new(&config).context("invalid backend configuration")?);
    let identity = match args.user_id {
        Some(id) => id,
        None => {
            let session = api
                .check_session()
                .await
                .context("session check failed")?
                .context("not logged in: pass --user-id or set SESSION_COOKIE")?;
            info!("Logged in as {} ({})", session.username, session.user_id);
            session.user_id
        }
    };

    let manager = ConnectionManager::with_websocket(config).context("invalid stream endpoint")?;
    let actions = NotificationActions::new(manager.clone(), api.clone());

    let _printer = manager.subscribe(|message: &InboundMessage| -> anyhow::Result<()> {
        println!("{}", describe(message));
        Ok(())
    });

    let mut status = manager.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("[STATUS] {}", current);
        }
    });

    manager.connect(Some(identity));
    println!("[CLIENT] Connected as user {}. Type /help for commands.", identity);

    let mut input = BufReader::new(stdin());
    let mut line = String::new();
    loop {
        line.clear();
        print!("> ");
        std::io::stdout().flush()?;
        if input.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let command = match parse_command(trimmed) {
            Ok(command) => command,
            Err(e) => {
                println!("[CLIENT] {}", e);
                continue;
            }
        };

        match command {
            Command::Private(to, text) => {
                if !manager.send_chat(OutgoingChat::private(to, text)) {
                    println!("[CLIENT] Not sent: {}", manager.current_status());
                }
            }
            Command::Group(group, text) => {
                if !manager.send_chat(OutgoingChat::group(group, text)) {
                    println!("[CLIENT] Not sent: {}", manager.current_status());
                }
            }
            Command::Online => {
                let lines = manager.with_state(|state| {
                    state
                        .presence
                        .users()
                        .iter()
                        .map(|user| format!("  {} {}", user.id, user.username))
                        .collect::<Vec<_>>()
                });
                println!("[CLIENT] {} user(s) online", lines.len());
                for line in lines {
                    println!("{}", line);
                }
            }
            Command::Messages => {
                let lines = manager.with_state(|state| {
                    state
                        .messages
                        .entries()
                        .iter()
                        .map(|entry| {
                            let marker = if entry.local_echo { "*" } else { " " };
                            format!("{} {} {}", marker, entry.at.format("%H:%M:%S"), describe(&entry.message))
                        })
                        .collect::<Vec<_>>()
                });
                for line in lines {
                    println!("{}", line);
                }
            }
            Command::Notifications => {
                for (i, n) in manager.notifications().iter().enumerate() {
                    println!("  {}. {}", i + 1, describe(n));
                }
            }
            Command::Act(index, action) => {
                let Some(notification) = manager.notifications().get(index).cloned() else {
                    println!("[CLIENT] No notification #{}", index + 1);
                    continue;
                };
                match actions.perform(&notification, action).await {
                    Ok(_) => println!("[CLIENT] Done: {}", action),
                    Err(e) => println!("[CLIENT][ERROR] {}", e),
                }
            }
            Command::Clear => manager.clear_notifications(),
            Command::History(peer) => match api.fetch_chat_history(peer).await {
                Ok(history) => {
                    let added = manager.merge_history(history);
                    println!("[CLIENT] {} message(s) loaded", added);
                    for message in manager.conversation(peer) {
                        println!("  {}", describe(&message));
                    }
                }
                Err(e) => {
                    warn!("History for user {} unavailable: {}", peer, e);
                    println!("[CLIENT][ERROR] {}", e);
                }
            },
            Command::Status => {
                println!(
                    "[CLIENT] {} (state {:?}, retries {}, last error {})",
                    manager.current_status(),
                    manager.state(),
                    manager.retry_attempts(),
                    manager.last_error().unwrap_or_else(|| "none".to_string())
                );
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
        }
    }

    manager.disconnect();
    println!("[CLIENT] Bye.");
    Ok(())
}
