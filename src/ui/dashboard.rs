use colored::Colorize;

use crate::mqtt::mqtt_handler::ConnectionState;
use crate::session::actuator::ActuatorState;
use crate::session::camera::{CameraEndpoint, CameraStatus};
use crate::session::telemetry::{ColorCounters, LogEntry};
use crate::session::SessionSnapshot;

pub fn connection_label(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Connected => "conectado".green().to_string(),
        ConnectionState::Connecting => "conectando".yellow().to_string(),
        ConnectionState::Disconnected => "desconectado".dimmed().to_string(),
        ConnectionState::Failed => "falha".red().bold().to_string(),
        ConnectionState::Closed => "encerrado".dimmed().to_string(),
    }
}

/// The toggle button as text: next action, or the wait notice.
pub fn actuator_button(state: ActuatorState) -> String {
    let label = format!("[ {} ]", state.label());
    match state {
        ActuatorState::Off => label.green().to_string(),
        ActuatorState::On => label.red().to_string(),
        ActuatorState::PendingOn | ActuatorState::PendingOff => label.yellow().to_string(),
    }
}

pub fn counters_line(counters: &ColorCounters) -> String {
    format!(
        "{} {}  {} {}  {} {}  {} {}",
        "vermelho:".red(),
        counters.red,
        "verde:".green(),
        counters.green,
        "azul:".blue(),
        counters.blue,
        "indefinido:".dimmed(),
        counters.undefined
    )
}

pub fn log_line(entry: &LogEntry) -> String {
    format!("{}  {}", entry.time.format("%H:%M:%S").to_string().dimmed(), entry.value)
}

/// Last `limit` entries, oldest first.
pub fn log_lines(entries: &[LogEntry], limit: usize) -> Vec<String> {
    let start = entries.len().saturating_sub(limit);
    entries[start..].iter().map(log_line).collect()
}

pub fn status_lines(snapshot: &SessionSnapshot) -> Vec<String> {
    let status = &snapshot.status;
    let mut lines = vec![
        format!(
            "{} {}   {} {}",
            "Broker:".bold(),
            connection_label(&status.connection_state),
            "Esteira:".bold(),
            actuator_button(snapshot.actuator)
        ),
        counters_line(&snapshot.counters()),
        format!(
            "{} {}   {} {}   {} {}",
            "recebidas:".dimmed(),
            status.messages_received,
            "enviadas:".dimmed(),
            status.messages_sent,
            "descobertas pendentes:".dimmed(),
            snapshot.discovery_in_flight
        ),
    ];

    if let Some(last) = &snapshot.telemetry.last_message {
        lines.push(format!("{} {}", "Última mensagem:".dimmed(), last));
    }
    if let Some(activity) = status.last_activity {
        lines.push(format!(
            "{} {}",
            "Última atividade:".dimmed(),
            activity.format("%H:%M:%S")
        ));
    }
    if let Some(error) = status.error_messages.last() {
        lines.push(format!("{} {}", "Último erro:".red(), error));
    }
    lines
}

pub fn camera_lines(url: Option<&str>, status: Option<&CameraStatus>) -> Vec<String> {
    let Some(url) = url else {
        return vec![format!(
            "{} use 'discover' ou 'camera <endereço>'",
            "Câmera não configurada:".yellow()
        )];
    };

    let endpoint = CameraEndpoint::from_url(url);
    let mut lines = vec![
        format!("{} {}", "Câmera:".bold(), endpoint.base()),
        format!("  vídeo:  {}", endpoint.video_url()),
        format!("  normal: {}", endpoint.camera_normal_url()),
        format!("  IA:     {}", endpoint.camera_ia_url()),
        format!(
            "  foto:   {}",
            endpoint.capture_url(chrono::Local::now().timestamp_millis())
        ),
    ];

    if let Some(status) = status {
        let online = if status.camera {
            "câmera ativa".green().to_string()
        } else {
            "câmera inativa".red().to_string()
        };
        lines.push(format!(
            "  servidor {} em {}:{} ({})",
            status.status, status.ip, status.port, online
        ));
        if let Some(local_ip) = &status.local_ip {
            lines.push(format!("  IP local: {}", local_ip));
        }
        if status.test_mode == Some(true) {
            lines.push("  modo de teste".yellow().to_string());
        }
    }
    lines
}

pub fn help_lines() -> Vec<String> {
    [
        ("status", "conexão, esteira e contadores"),
        ("toggle", "liga ou desliga a esteira"),
        ("refresh", "pede ao servidor da câmera que se anuncie de novo"),
        ("send <texto>", "publica texto livre para o dispositivo"),
        ("discover", "pede ao dispositivo o endereço do servidor da câmera"),
        ("log [n]", "últimas n mensagens (padrão 10)"),
        ("camera [url]", "mostra ou define o servidor da câmera"),
        ("camera clear", "esquece o servidor da câmera"),
        ("auto [on|off]", "descoberta automática da câmera ao iniciar"),
        ("help", "esta lista"),
        ("quit", "desconecta e sai"),
    ]
    .iter()
    .map(|(command, text)| format!("  {} {}", format!("{:<14}", command).bold().cyan(), text))
    .collect()
}
