//! Line-oriented console driving a [`SessionController`].
//!
//! Commands start with `/`; any other non-empty line is sent as a text turn.

use oracle_core::{ConnectionState, SessionController, SessionError, TurnMode, conversation::ConversationItem};
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

pub const HELP: &str = "\
/connect            open the session
/disconnect         close the session
/mode manual|vad    switch turn taking
/talk               start or stop push-to-talk (manual mode)
/status             show connection, turn mode and recording time
/delete <item id>   delete a conversation item
/memory             show remembered facts
/items              show the conversation
/log                show the event log
/quit               exit
anything else       send as a text message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Mode(TurnMode),
    Talk,
    Status,
    Delete(String),
    Memory,
    Items,
    Log,
    Help,
    Quit,
    Say(String),
    Empty,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            return Ok(if line.is_empty() {
                ConsoleCommand::Empty
            } else {
                ConsoleCommand::Say(line.to_string())
            });
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match name {
            "connect" => Ok(ConsoleCommand::Connect),
            "disconnect" => Ok(ConsoleCommand::Disconnect),
            "mode" => arg.parse().map(ConsoleCommand::Mode),
            "talk" | "ptt" => Ok(ConsoleCommand::Talk),
            "status" => Ok(ConsoleCommand::Status),
            "delete" if !arg.is_empty() => Ok(ConsoleCommand::Delete(arg.to_string())),
            "delete" => Err("usage: /delete <item id>".to_string()),
            "memory" => Ok(ConsoleCommand::Memory),
            "items" => Ok(ConsoleCommand::Items),
            "log" => Ok(ConsoleCommand::Log),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => Err(format!("unknown command '/{other}', try /help")),
        }
    }
}

fn describe_item(item: &ConversationItem) -> String {
    let role = item
        .role
        .map(|role| format!("{role:?}").to_lowercase())
        .unwrap_or_else(|| "-".to_string());
    let body = if let Some(tool) = &item.formatted.tool {
        format!("{}({})", tool.name, tool.arguments)
    } else if let Some(output) = &item.formatted.output {
        format!("-> {output:?}")
    } else if !item.formatted.transcript.is_empty() {
        item.formatted.transcript.clone()
    } else if !item.formatted.text.is_empty() {
        item.formatted.text.clone()
    } else if !item.formatted.audio.is_empty() {
        "(audio)".to_string()
    } else {
        "(awaiting content)".to_string()
    };
    let audio = item
        .formatted
        .file
        .as_ref()
        .map(|file| format!(" [{:.1}s]", file.duration().as_secs_f32()))
        .unwrap_or_default();
    format!("{} {:<9} {}{}", item.id, role, body, audio)
}

fn describe_status(state: ConnectionState, mode: TurnMode, recording_secs: Option<u64>) -> String {
    let state = format!("{state:?}").to_lowercase();
    match recording_secs {
        Some(secs) => format!("{state}, {mode} mode, recording for {secs}s"),
        None => format!("{state}, {mode} mode"),
    }
}

/// Executes one command. Returns `false` when the console should exit.
pub async fn execute(session: &SessionController, command: ConsoleCommand) -> Result<bool, SessionError> {
    match command {
        ConsoleCommand::Connect => {
            session.connect().await?;
            println!("connected ({} mode)", session.turn_mode());
        }
        ConsoleCommand::Disconnect => {
            session.disconnect().await;
            println!("disconnected");
        }
        ConsoleCommand::Mode(mode) => {
            session.set_turn_mode(mode).await?;
            println!("turn mode: {mode}");
        }
        ConsoleCommand::Talk => match session.toggle_recording().await? {
            oracle_core::PushToTalk::Started => println!("recording... /talk again to send"),
            oracle_core::PushToTalk::Stopped { elapsed_secs } => println!("sent {elapsed_secs}s of audio"),
        },
        ConsoleCommand::Status => println!(
            "{}",
            describe_status(session.state(), session.turn_mode(), session.recording_secs())
        ),
        ConsoleCommand::Delete(item_id) => session.delete_item(&item_id).await?,
        ConsoleCommand::Memory => {
            let memory = session.memory().snapshot();
            if memory.is_empty() {
                println!("(nothing remembered)");
            }
            for (key, facts) in &memory {
                println!("{key}: {}", facts.join(", "));
            }
        }
        ConsoleCommand::Items => {
            for item in session.items() {
                println!("{}", describe_item(&item));
            }
        }
        ConsoleCommand::Log => {
            for line in session.log_lines() {
                println!("{line}");
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => return Ok(false),
        ConsoleCommand::Say(text) => session.send_text(&text).await?,
        ConsoleCommand::Empty => {}
    }
    Ok(true)
}

/// Reads commands from `input` until it closes, `/quit` or Ctrl+C.
pub async fn run<R>(session: &SessionController, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    println!("{HELP}");
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
        };
        let Some(line) = line else {
            info!("stdin closed, shutting down");
            break;
        };
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        match execute(session, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(error = %e, "Command failed");
                println!("error: {e}");
            }
        }
    }
    session.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("/connect".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Connect));
        assert_eq!(" /mode manual ".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Mode(TurnMode::Manual)));
        assert_eq!("/mode vad".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Mode(TurnMode::Automatic)));
        assert_eq!("/delete item_42".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Delete("item_42".to_string())));
        assert_eq!("/quit".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Quit));
        assert_eq!("/status".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Status));
    }

    #[test]
    fn test_describe_status_shows_recording_time() {
        assert_eq!(
            describe_status(ConnectionState::Connected, TurnMode::Manual, Some(3)),
            "connected, manual mode, recording for 3s"
        );
        assert_eq!(
            describe_status(ConnectionState::Disconnected, TurnMode::Automatic, None),
            "disconnected, vad mode"
        );
    }

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(
            "what should I focus on today?".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Say("what should I focus on today?".to_string()))
        );
        assert_eq!("   ".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Empty));
    }

    #[test]
    fn test_parse_errors() {
        assert!("/delete".parse::<ConsoleCommand>().is_err());
        assert!("/mode sometimes".parse::<ConsoleCommand>().is_err());
        assert!("/dance".parse::<ConsoleCommand>().unwrap_err().contains("/dance"));
    }

    #[test]
    fn test_describe_function_call_item() {
        let mut item = ConversationItem::new("fc_1");
        item.formatted.tool = Some(oracle_core::FunctionCall {
            call_id: "call_1".to_string(),
            name: "set_memory".to_string(),
            arguments: r#"{"key":"name","value":"Alex"}"#.to_string(),
        });
        let line = describe_item(&item);
        assert!(line.starts_with("fc_1"));
        assert!(line.contains(r#"set_memory({"key":"name","value":"Alex"})"#));
    }
}
