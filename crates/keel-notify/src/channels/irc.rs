//! IRC channel: connects, joins, says one line and quits.

use async_trait::async_trait;
use keel_core::notifier::require_setting;
use keel_core::{NotificationPayload, Notifier, NotifierKind, NotifierSettings, NotifyError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::DELIVERY_TIMEOUT;

const DEFAULT_PORT: u16 = 6667;
const DEFAULT_NICK: &str = "keel";

/// Settings: `server` (`host[:port]`, required), `channel` (required),
/// `nick`.
#[derive(Default)]
pub struct IrcNotifier;

impl IrcNotifier {
    pub fn new() -> Self {
        Self
    }
}

fn server_address(server: &str) -> String {
    if server.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        server.to_string()
    } else {
        format!("{}:{}", server, DEFAULT_PORT)
    }
}

fn channel_name(channel: &str) -> String {
    if channel.starts_with('#') || channel.starts_with('&') {
        channel.to_string()
    } else {
        format!("#{}", channel)
    }
}

/// Strip characters that would end an IRC line early.
fn irc_text(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

async fn deliver(address: &str, nick: &str, channel: &str, text: &str) -> Result<(), NotifyError> {
    let stream = TcpStream::connect(address).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(format!("NICK {}\r\nUSER {} 0 * :Keel CI\r\n", nick, nick).as_bytes())
        .await?;

    // Wait for the welcome numeric, answering keepalives on the way
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(NotifyError::Transport(
                "server closed the connection during registration".to_string(),
            ));
        };
        if let Some(token) = line.strip_prefix("PING ") {
            writer.write_all(format!("PONG {}\r\n", token).as_bytes()).await?;
            continue;
        }
        if line.starts_with("ERROR") {
            return Err(NotifyError::Transport(line));
        }
        match line.split_whitespace().nth(1) {
            Some("001") => break,
            Some("432" | "433" | "436") => {
                return Err(NotifyError::Transport(format!("nick {} rejected: {}", nick, line)));
            }
            _ => {}
        }
    }

    writer
        .write_all(
            format!(
                "JOIN {channel}\r\nPRIVMSG {channel} :{text}\r\nQUIT :done\r\n",
                channel = channel,
                text = text
            )
            .as_bytes(),
        )
        .await?;
    writer.flush().await?;

    // Let the server close the connection after QUIT
    while let Ok(Some(_)) = lines.next_line().await {}
    Ok(())
}

#[async_trait]
impl Notifier for IrcNotifier {
    fn kind(&self) -> NotifierKind {
        NotifierKind::Irc
    }

    async fn send(
        &self,
        settings: &NotifierSettings,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let address = server_address(require_setting(settings, "server")?);
        let channel = channel_name(require_setting(settings, "channel")?);
        let nick = settings.get("nick").map(String::as_str).unwrap_or(DEFAULT_NICK);
        let text = irc_text(&payload.summary());

        debug!(project = %payload.project, build_id = %payload.build_id, %address, %channel, "Sending IRC message");
        tokio::time::timeout(DELIVERY_TIMEOUT, deliver(&address, nick, &channel, &text))
            .await
            .map_err(|_| NotifyError::Transport(format!("{} timed out", address)))?
    }
}
