//! Interactive control shell for server mode.
//!
//! Reads one command per line from stdin and drives connected agents:
//!
//! ```text
//! ls                                    list active agents
//! isactive <name>                       check one agent
//! execute <name> <cmd...>               run a shell command on an agent
//! download <name> <url> <dir> <file>    make an agent fetch a file
//! help                                  show this list
//! quit                                  stop the server
//! ```

use crate::services::{DOWNLOAD, EXECUTE};
use anyhow::Result;
use pylon_core::{Payload, RpcServer};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

pub const HELP: &str = "\
commands:
  ls                                    list active agents
  isactive <name>                       check whether an agent is active
  execute <name> <cmd...>               run a shell command on an agent
  download <name> <url> <dir> <file>    make an agent download a file
  help                                  show this help
  quit                                  stop the server";

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    List,
    IsActive {
        name: String,
    },
    Execute {
        name: String,
        cmd: String,
    },
    Download {
        name: String,
        url: String,
        dir: String,
        file_name: String,
    },
    Help,
    Quit,
    Empty,
    /// A known command with the wrong arguments; carries its usage line.
    Usage(&'static str),
    Unknown(String),
}

impl ShellCommand {
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return ShellCommand::Empty;
        };
        let args: Vec<&str> = words.collect();

        match command {
            "ls" => ShellCommand::List,
            "help" => ShellCommand::Help,
            "quit" | "exit" => ShellCommand::Quit,
            "isactive" => match args.as_slice() {
                [name] => ShellCommand::IsActive {
                    name: name.to_string(),
                },
                _ => ShellCommand::Usage("isactive <name>"),
            },
            "execute" => match args.as_slice() {
                [name, cmd @ ..] if !cmd.is_empty() => ShellCommand::Execute {
                    name: name.to_string(),
                    cmd: cmd.join(" "),
                },
                _ => ShellCommand::Usage("execute <name> <cmd...>"),
            },
            "download" => match args.as_slice() {
                [name, url, dir, file_name] => ShellCommand::Download {
                    name: name.to_string(),
                    url: url.to_string(),
                    dir: dir.to_string(),
                    file_name: file_name.to_string(),
                },
                _ => ShellCommand::Usage("download <name> <url> <dir> <file>"),
            },
            other => ShellCommand::Unknown(other.to_string()),
        }
    }
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Run one command against `server` and render what to print.
///
/// Returns `None` for [`ShellCommand::Quit`].
pub async fn run_command(server: &RpcServer, command: ShellCommand) -> Option<String> {
    let output = match command {
        ShellCommand::Quit => return None,
        ShellCommand::Empty => String::new(),
        ShellCommand::Help => HELP.to_string(),
        ShellCommand::Usage(usage) => format!("usage: {}", usage),
        ShellCommand::Unknown(command) => format!("no command [{}]", command),
        ShellCommand::List => {
            let clients = server.active_clients();
            if clients.is_empty() {
                "no active clients".to_string()
            } else {
                clients.join("\n")
            }
        }
        ShellCommand::IsActive { name } => server.is_active(&name).to_string(),
        ShellCommand::Execute { name, cmd } => {
            call(server, &name, EXECUTE, payload(json!({ "cmd": cmd }))).await
        }
        ShellCommand::Download {
            name,
            url,
            dir,
            file_name,
        } => {
            let params = payload(json!({ "url": url, "dir": dir, "fileName": file_name }));
            call(server, &name, DOWNLOAD, params).await
        }
    };
    Some(output)
}

async fn call(server: &RpcServer, name: &str, kind: &str, params: Payload) -> String {
    let result = match server.send_to_client(name, kind, params).await {
        Ok(response) => response.into_result(),
        Err(e) => Err(e),
    };
    match result {
        Ok(Some(Value::String(text))) => text,
        Ok(Some(data)) => data.to_string(),
        Ok(None) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    }
}

/// Read commands from stdin until `quit` or end of input.
pub async fn run(server: &RpcServer) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    while let Some(line) = lines.next_line().await? {
        let command = ShellCommand::parse(&line);
        debug!(?command, "Shell command");
        match run_command(server, command).await {
            Some(output) if output.is_empty() => {}
            Some(output) => println!("{}", output),
            None => break,
        }
    }
    Ok(())
}
