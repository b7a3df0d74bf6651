use crate::broker::BrokerLink;
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayCore;
use crate::transport::MeshTransport;
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type CommandHandler<T, B> = fn(&mut GatewayCore<T, B>, &CommandTable<T, B>, &str) -> Result<String>;

/// A registered console command.
pub struct Command<T: MeshTransport, B: BrokerLink> {
    pub name: &'static str,
    pub description: &'static str,
    pub handler: CommandHandler<T, B>,
}

/// Fixed table of console commands, built once at startup.
///
/// Dispatch splits a line into a case-insensitively matched command name and
/// a raw argument tail, then routes to the handler. The table itself never
/// touches gateway state.
pub struct CommandTable<T: MeshTransport, B: BrokerLink> {
    commands: Vec<Command<T, B>>,
}

impl<T: MeshTransport, B: BrokerLink> CommandTable<T, B> {
    /// Builds the table with the builtin command set.
    pub fn new() -> Self {
        let mut table = Self { commands: Vec::new() };
        table.register("help", "list available commands", cmd_help);
        table.register(
            "status",
            "show gateway id, uplink address, node count and broker state",
            cmd_status,
        );
        table.register("nodes", "list known nodes; 'nodes refresh' re-queries the mesh", cmd_nodes);
        table.register("ping", "ping <target>, or ping <source> <target> to delegate", cmd_ping);
        table.register("reboot", "restart the gateway after a short delay", cmd_reboot);
        table
    }

    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        handler: CommandHandler<T, B>,
    ) {
        self.commands.push(Command { name, description, handler });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command<T, B>> {
        self.commands.iter()
    }

    /// Routes one console line. Returns None for a blank line, otherwise the
    /// reply text for the operator.
    pub fn dispatch(&self, core: &mut GatewayCore<T, B>, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (name, args) = match line.split_once(' ') {
            Some((name, args)) => (name, args),
            None => (line, ""),
        };
        let command = self.commands.iter().find(|c| c.name.eq_ignore_ascii_case(name));
        match command {
            Some(command) => (command.handler)(core, self, args).map(Some),
            None => Ok(Some(format!("unknown command '{}', try 'help'", name))),
        }
    }
}

impl<T: MeshTransport, B: BrokerLink> Default for CommandTable<T, B> {
    fn default() -> Self {
        Self::new()
    }
}

fn cmd_help<T: MeshTransport, B: BrokerLink>(
    _core: &mut GatewayCore<T, B>,
    table: &CommandTable<T, B>,
    _args: &str,
) -> Result<String> {
    let mut out = String::new();
    for command in table.iter() {
        out.push_str(&format!("{} - {}\n", command.name, command.description));
    }
    Ok(out.trim_end().to_string())
}

fn cmd_status<T: MeshTransport, B: BrokerLink>(
    core: &mut GatewayCore<T, B>,
    _table: &CommandTable<T, B>,
    _args: &str,
) -> Result<String> {
    Ok(format!(
        "id={} ip={} nodes={} broker={}",
        core.own_id(),
        core.station_display(),
        core.peer_count(),
        if core.broker_connected() { "up" } else { "down" },
    ))
}

fn cmd_nodes<T: MeshTransport, B: BrokerLink>(
    core: &mut GatewayCore<T, B>,
    _table: &CommandTable<T, B>,
    args: &str,
) -> Result<String> {
    let arg = args.trim();
    if arg.eq_ignore_ascii_case("refresh") {
        core.refresh_nodes()?;
        return Ok("node info requested, answers arrive asynchronously".to_string());
    }
    if !arg.is_empty() {
        return Ok("usage: nodes [refresh]".to_string());
    }
    if core.registry().is_empty() {
        return Ok("no nodes discovered yet, try 'nodes refresh'".to_string());
    }
    let mut out = String::new();
    for record in core.registry().iter() {
        out.push_str(&format!(
            "{}: {} ({}), last seen {}s ago\n",
            record.node_id,
            record.node_type,
            record.sensors,
            record.last_seen.elapsed().as_secs(),
        ));
    }
    Ok(out.trim_end().to_string())
}

fn cmd_ping<T: MeshTransport, B: BrokerLink>(
    core: &mut GatewayCore<T, B>,
    _table: &CommandTable<T, B>,
    args: &str,
) -> Result<String> {
    const USAGE: &str = "usage: ping <target> | ping <source> <target>";
    let parts: Vec<&str> = args.split_whitespace().collect();
    match parts.as_slice() {
        [target] => {
            let Ok(target) = target.parse::<u32>() else {
                return Ok(USAGE.to_string());
            };
            match core.start_ping(target)? {
                Some(seq) => Ok(format!("PING sent to {} (seq={})", target, seq)),
                None => Ok("ping already pending, try again later".to_string()),
            }
        }
        [source, target] => {
            let (Ok(source), Ok(target)) = (source.parse::<u32>(), target.parse::<u32>()) else {
                return Ok(USAGE.to_string());
            };
            match core.start_delegated_ping(source, target)? {
                Some(seq) => {
                    Ok(format!("PING_CMD sent: {} will ping {} (seq={})", source, target, seq))
                }
                None => Ok("ping already pending, try again later".to_string()),
            }
        }
        _ => Ok(USAGE.to_string()),
    }
}

fn cmd_reboot<T: MeshTransport, B: BrokerLink>(
    core: &mut GatewayCore<T, B>,
    _table: &CommandTable<T, B>,
    _args: &str,
) -> Result<String> {
    core.request_reboot();
    Ok("rebooting shortly".to_string())
}

/// Channel pair connecting a console front end to the gateway loop.
///
/// `lines` carries operator input one line at a time; `replies` carries
/// reply text back. An empty reply means "no output, prompt again".
pub struct ConsoleChannels {
    pub lines: mpsc::Receiver<String>,
    pub replies: mpsc::Sender<String>,
}

/// Line-oriented TCP console serving one client at a time.
///
/// The next client is accepted only after the current one disconnects. The
/// accept loop ends, releasing the listen address, once the gateway side of
/// the channels is gone.
pub struct ConsoleServer {
    listener: TcpListener,
}

impl ConsoleServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "console listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Detaches the accept loop and returns the gateway-side channels.
    pub fn start(self) -> ConsoleChannels {
        let (line_tx, line_rx) = mpsc::channel(32);
        let (reply_tx, reply_rx) = mpsc::channel(32);
        tokio::spawn(serve(self.listener, line_tx, reply_rx));
        ConsoleChannels { lines: line_rx, replies: reply_tx }
    }
}

async fn serve(
    listener: TcpListener,
    line_tx: mpsc::Sender<String>,
    mut reply_rx: mpsc::Receiver<String>,
) {
    loop {
        let (mut stream, peer) = tokio::select! {
            biased;
            _ = line_tx.closed() => {
                debug!("gateway side gone, console stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "console accept failed");
                    continue;
                }
            },
        };
        info!(%peer, "console client connected");
        // Replies queued with no client attached belong to nobody.
        while reply_rx.try_recv().is_ok() {}
        if let Err(e) = serve_client(&mut stream, &line_tx, &mut reply_rx).await {
            debug!(error = %e, "console session ended");
        }
        info!(%peer, "console client disconnected");
    }
}

async fn serve_client(
    stream: &mut TcpStream,
    line_tx: &mpsc::Sender<String>,
    reply_rx: &mut mpsc::Receiver<String>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    writer.write_all(b"> ").await?;
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        tokio::select! {
            res = reader.read_buf(&mut buf) => {
                if res? == 0 {
                    return Ok(());
                }
                while let Some(line) = try_extract_line(&mut buf) {
                    line_tx.send(line).await.map_err(|_| GatewayError::ChannelClosed)?;
                }
            }
            maybe_reply = reply_rx.recv() => {
                match maybe_reply {
                    Some(reply) if reply.is_empty() => writer.write_all(b"> ").await?,
                    Some(reply) => {
                        writer.write_all(reply.as_bytes()).await?;
                        writer.write_all(b"\n> ").await?;
                    }
                    None => return Err(GatewayError::ChannelClosed),
                }
            }
        }
    }
}

/// Extracts one newline-terminated line from the buffer, if complete.
/// The terminator (and a preceding CR) is stripped.
pub fn try_extract_line(buffer: &mut BytesMut) -> Option<String> {
    let pos = memchr::memchr(b'\n', buffer.as_ref())?;
    let mut line = buffer.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}
