//! Line commands for the terminal client.
//!
//! Anything that does not start with `/` is a broadcast chat line. Commands
//! are case-insensitive and most have a one-letter alias.

use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::message::Recipient;

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Say { text: String },
    Msg { to: String, text: String },
    Buzz { to: Recipient },
    Typing { to: String, active: bool },
    Send { to: Recipient, path: PathBuf },
    Decline,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one line of input. Blank lines are an error so the caller can
    /// skip them.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty input"));
        }

        let Some(command_line) = trimmed.strip_prefix('/') else {
            return Ok(ConsoleCommand::Say {
                text: trimmed.to_string(),
            });
        };

        let (command, rest) = match command_line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (command_line, ""),
        };

        let command = command.to_lowercase();
        let normalized = match command.as_str() {
            "m" => "msg",
            "b" => "buzz",
            "t" => "typing",
            "s" => "send",
            "d" => "decline",
            "h" | "?" => "help",
            "q" | "exit" => "quit",
            other => other,
        };

        match normalized {
            "quit" => Ok(ConsoleCommand::Quit),
            "help" => Ok(ConsoleCommand::Help),
            "decline" => Ok(ConsoleCommand::Decline),
            "buzz" if rest.is_empty() => Ok(ConsoleCommand::Buzz { to: Recipient::All }),
            "buzz" => Ok(ConsoleCommand::Buzz {
                to: Recipient::parse_loose(rest),
            }),
            "msg" => match rest.split_once(char::is_whitespace) {
                Some((to, text)) if !text.trim().is_empty() => Ok(ConsoleCommand::Msg {
                    to: to.to_string(),
                    text: text.trim().to_string(),
                }),
                _ => Err(anyhow!("usage: /msg <user> <text>")),
            },
            "typing" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
                [to, state] => {
                    let active = match state.to_lowercase().as_str() {
                        "on" | "start" => true,
                        "off" | "stop" => false,
                        _ => return Err(anyhow!("usage: /typing <user> on|off")),
                    };
                    Ok(ConsoleCommand::Typing {
                        to: to.to_string(),
                        active,
                    })
                }
                _ => Err(anyhow!("usage: /typing <user> on|off")),
            },
            "send" => match rest.split_once(char::is_whitespace) {
                Some((to, path)) if !path.trim().is_empty() => Ok(ConsoleCommand::Send {
                    to: Recipient::parse_loose(to),
                    path: PathBuf::from(path.trim()),
                }),
                _ => Err(anyhow!("usage: /send <user|ALL> <path>")),
            },
            other => Err(anyhow!("unknown command '/{other}', try /help")),
        }
    }
}

pub const HELP: &[&str] = &[
    "<text>                     broadcast to everyone",
    "/msg <user> <text>         (alias /m) private message",
    "/buzz [user]               (alias /b) buzz one user or everyone",
    "/typing <user> on|off      (alias /t) typing indicator",
    "/send <user|ALL> <path>    (alias /s) send a file",
    "/decline                   (alias /d) decline the incoming file",
    "/quit                      (alias /q) leave",
];
