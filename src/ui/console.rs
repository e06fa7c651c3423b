use std::io::Write;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::dashboard;
use crate::persistence::{KeyValueStore, AUTO_DISCOVERY_KEY};
use crate::session::camera::CameraEndpoint;
use crate::session::error::SessionError;
use crate::session::{Connected, MqttSession};

const DEFAULT_LOG_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Toggle,
    Refresh,
    Send(String),
    Discover,
    Log(usize),
    Camera(Option<String>),
    ForgetCamera,
    AutoDiscovery(Option<bool>),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one input line. `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "status" | "s" => Self::Status,
            "toggle" | "t" => Self::Toggle,
            "refresh" => Self::Refresh,
            "send" => {
                if rest.is_empty() {
                    return Err("send needs a message".to_string());
                }
                Self::Send(rest.to_string())
            }
            "discover" | "d" => Self::Discover,
            "log" | "l" => {
                if rest.is_empty() {
                    Self::Log(DEFAULT_LOG_LINES)
                } else {
                    let n = rest
                        .parse()
                        .map_err(|_| format!("not a number: {}", rest))?;
                    Self::Log(n)
                }
            }
            "camera" | "c" => match rest {
                "" => Self::Camera(None),
                "clear" => Self::ForgetCamera,
                url => Self::Camera(Some(url.to_string())),
            },
            "auto" => match rest.to_ascii_lowercase().as_str() {
                "" => Self::AutoDiscovery(None),
                "on" | "true" => Self::AutoDiscovery(Some(true)),
                "off" | "false" => Self::AutoDiscovery(Some(false)),
                other => return Err(format!("expected on or off, got {}", other)),
            },
            "help" | "h" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("unknown command '{}'", other)),
        };
        Ok(Some(command))
    }
}

fn prompt() {
    print!("{} ", "esteira>".bold().cyan());
    std::io::stdout().flush().ok();
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

fn report(error: &SessionError) {
    println!("{} {}", "Erro:".red().bold(), error);
}

/// Interactive loop. Returns on `quit`, end of input, or Ctrl-C.
pub async fn run_console(
    session: &MqttSession<Connected>,
    store: Option<Arc<KeyValueStore>>,
) -> Result<()> {
    print_lines(dashboard::status_lines(&session.snapshot()));
    println!("Digite {} para ver os comandos.", "help".bold());

    if let Some(store) = &store {
        auto_discover(session, store).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("Ctrl-C received, leaving console");
                break;
            }
            line = lines.next_line() => line.map_err(|e| eyre!("Failed to read input: {}", e))?,
        };
        let Some(line) = line else {
            debug!("Console input closed");
            break;
        };

        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{} ({} lista os comandos)", message.yellow(), "help".bold());
                continue;
            }
        };

        if command == ConsoleCommand::Quit {
            break;
        }
        execute(session, store.as_deref(), command).await;
    }
    Ok(())
}

async fn execute(
    session: &MqttSession<Connected>,
    store: Option<&KeyValueStore>,
    command: ConsoleCommand,
) {
    match command {
        ConsoleCommand::Status => print_lines(dashboard::status_lines(&session.snapshot())),
        ConsoleCommand::Toggle => match session.toggle_actuator().await {
            Ok(state) => println!("{}", dashboard::actuator_button(state)),
            Err(e) => report(&e),
        },
        ConsoleCommand::Refresh => match session.refresh().await {
            Ok(()) => println!("Pedido de atualização enviado"),
            Err(e) => report(&e),
        },
        ConsoleCommand::Send(text) => match session.send(&text).await {
            Ok(true) => println!("Enviado: {}", text),
            Ok(false) => {}
            Err(e) => report(&e),
        },
        ConsoleCommand::Discover => {
            println!(
                "Aguardando resposta em {} (até {:?})...",
                session.settings().discovery.response_topic,
                session.settings().discovery.timeout
            );
            match session.request_remote_value().await {
                Ok(value) => println!("{} {}", "Resposta:".green(), value),
                Err(e) => report(&e),
            }
        }
        ConsoleCommand::Log(n) => {
            let snapshot = session.snapshot();
            if snapshot.log().is_empty() {
                println!("{}", "Nenhuma mensagem recebida".dimmed());
            }
            print_lines(dashboard::log_lines(snapshot.log(), n));
        }
        ConsoleCommand::Camera(Some(input)) => match session.configure_camera(&input).await {
            Some(url) => println!("Câmera configurada: {}", url),
            None => println!("{}", "Endereço vazio".yellow()),
        },
        ConsoleCommand::Camera(None) => show_camera(session).await,
        ConsoleCommand::ForgetCamera => {
            session.forget_camera().await;
            println!("Câmera esquecida");
        }
        ConsoleCommand::AutoDiscovery(value) => {
            let Some(store) = store else {
                println!("{}", "Sem armazenamento de configurações".yellow());
                return;
            };
            if let Some(enabled) = value {
                if let Err(e) = store.set_bool(AUTO_DISCOVERY_KEY, enabled).await {
                    println!("{} {}", "Erro:".red().bold(), e);
                    return;
                }
            }
            let enabled = store.get_bool(AUTO_DISCOVERY_KEY).await.unwrap_or(true);
            println!(
                "Descoberta automática: {}",
                if enabled { "ligada" } else { "desligada" }
            );
        }
        ConsoleCommand::Help => print_lines(dashboard::help_lines()),
        ConsoleCommand::Quit => {}
    }
}

async fn show_camera(session: &MqttSession<Connected>) {
    let url = session.snapshot().camera_url;
    let status = match &url {
        Some(url) => match CameraEndpoint::from_url(url).fetch_status().await {
            Ok(status) => Some(status),
            Err(e) => {
                report(&e);
                None
            }
        },
        None => None,
    };
    print_lines(dashboard::camera_lines(url.as_deref(), status.as_ref()));
}

/// Asks for the camera address once at startup when none is known and
/// auto-discovery is enabled (the default).
async fn auto_discover(session: &MqttSession<Connected>, store: &KeyValueStore) {
    if session.snapshot().camera_url.is_some() {
        return;
    }
    if !store.get_bool(AUTO_DISCOVERY_KEY).await.unwrap_or(true) {
        debug!("Camera auto-discovery disabled");
        return;
    }

    println!("{}", "Procurando o servidor da câmera...".dimmed());
    match session.request_remote_value().await {
        Ok(value) => println!("{} {}", "Servidor da câmera:".green(), value),
        Err(e) => {
            warn!("Camera auto-discovery failed: {}", e);
            report(&e);
        }
    }
}

/// Prints every classified message and the running counters until Ctrl-C or
/// until the connection fails.
pub async fn run_monitor(session: &MqttSession<Connected>) -> Result<()> {
    let mut rx = session.subscribe();
    let mut printed = rx.borrow().log().len();
    println!(
        "Monitorando {} (Ctrl-C para sair)",
        session.settings().receive_topic.bold()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let (lines, failed) = {
                    let snapshot = rx.borrow_and_update();
                    let log = snapshot.log();
                    let mut lines: Vec<String> =
                        log[printed.min(log.len())..].iter().map(dashboard::log_line).collect();
                    if !lines.is_empty() {
                        lines.push(dashboard::counters_line(&snapshot.counters()));
                    }
                    printed = log.len();
                    let failed = !snapshot.connected();
                    (lines, failed)
                };
                print_lines(lines);
                if failed {
                    return Err(eyre!("Broker connection lost"));
                }
            }
        }
    }
    Ok(())
}
