//! The processor-facing control port.
//!
//! Loopback only. A client must send the control password as its first line (compared in constant
//! time, within a short grace window), then either `list-connections` for a one-shot listing or
//! `attach` to become *the* attached processor: the journal is replayed, a `caught-up` sentinel
//! follows, and from then on every committed event is streamed live while command lines are
//! accepted in the other direction. At most one processor can be attached at a time.

use crate::conn::{self, ConnCmd, ConnHandle};
use crate::linebuf::LineBuf;
use crate::state::Connector;

use mamirc_common::{Event, Lifecycle};

use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Control lines are short except `send`, which carries up to one IRC line.
const CTL_MAX_LINE: usize = 2048;

/// Queue of event lines pending transmission to the attached processor.
const STREAM_QUEUE_LEN: usize = 10_000;

pub(crate) async fn listen_task(
    state: Connector,
    port: u16,
    password: String,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Control port listening on 127.0.0.1:{}", port);
    loop {
        let (sock, addr) = listener.accept().await?;
        debug!("Control connection from {}", addr);
        tokio::task::spawn_local(client_task(state.clone(), sock, password.clone()));
    }
}

async fn client_task(state: Connector, sock: TcpStream, password: String) {
    let (read_half, mut write_half) = sock.into_split();
    let mut reader = LineReader::new(read_half);

    // Authentication handshake. Failures close the socket silently.
    let pw_line = match timeout(AUTH_TIMEOUT, reader.next_line()).await {
        Ok(Some(line)) => line,
        Ok(None) | Err(_) => {
            debug!("Control client went away before authenticating");
            return;
        }
    };
    if !bool::from(pw_line.ct_eq(password.as_bytes())) {
        debug!("Control client failed authentication");
        return;
    }

    let mode = match timeout(AUTH_TIMEOUT, reader.next_line()).await {
        Ok(Some(line)) => line,
        Ok(None) | Err(_) => {
            return;
        }
    };

    match mode.as_slice() {
        b"list-connections" => {
            let conns = state.list_connections();
            let mut out = format!("connections {}\r\n", conns.len());
            for (conn_id, profile) in conns {
                out.push_str(&format!("{} {}\r\n", conn_id, profile));
            }
            let _ = write_half.write_all(out.as_bytes()).await;
        }
        b"attach" => {
            let (snd_line, rcv_line) = mpsc::channel::<Vec<u8>>(STREAM_QUEUE_LEN);
            let replay = match state.attach(snd_line.clone()) {
                Some(replay) => replay,
                None => {
                    warn!("Refusing attach: a processor is already attached");
                    return;
                }
            };
            info!("Processor attached; replaying {} event(s)", replay.len());
            tokio::task::spawn_local(stream_task(write_half, replay, rcv_line));
            command_loop(&state, &mut reader).await;
            state.detach(&snd_line);
            info!("Processor detached");
        }
        _ => {
            warn!(
                "Unknown control mode: {:?}",
                String::from_utf8_lossy(&mode)
            );
        }
    }
}

/// Write the journal replay, the `caught-up` sentinel, then live events until the channel or the
/// socket closes.
async fn stream_task(
    mut write_half: OwnedWriteHalf,
    replay: Vec<Event>,
    mut rcv_line: mpsc::Receiver<Vec<u8>>,
) {
    for ev in replay {
        let mut line = ev.encode_line();
        line.extend_from_slice(b"\r\n");
        if write_half.write_all(&line).await.is_err() {
            return;
        }
    }
    if write_half.write_all(b"caught-up\r\n").await.is_err() {
        return;
    }
    while let Some(mut line) = rcv_line.recv().await {
        line.extend_from_slice(b"\r\n");
        if write_half.write_all(&line).await.is_err() {
            return;
        }
    }
}

async fn command_loop(state: &Connector, reader: &mut LineReader) {
    while let Some(line) = reader.next_line().await {
        if line == b"terminate" {
            state.terminate();
        }
        handle_command(state, &line);
    }
}

/// Parsing is strict: single space separators, no trailing whitespace, no NUL bytes. Anything
/// unknown or malformed is logged and ignored.
fn handle_command(state: &Connector, line: &[u8]) {
    if line.contains(&0) {
        warn!("Ignoring control line with NUL byte");
        return;
    }

    // `send <conn-id> <raw-bytes>`: everything after the second space is opaque payload, so it is
    // parsed on the byte level before attempting UTF-8.
    if let Some(rest) = line.strip_prefix(b"send ") {
        match rest.iter().position(|b| *b == b' ') {
            Some(sp) => {
                let conn_id = match std::str::from_utf8(&rest[..sp])
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    Some(conn_id) => conn_id,
                    None => {
                        warn!("Ignoring send command with bad connection id");
                        return;
                    }
                };
                let payload = rest[sp + 1..].to_vec();
                match state.cmd_sender(conn_id) {
                    Some(snd_cmd) => {
                        if snd_cmd.try_send(ConnCmd::Send(payload)).is_err() {
                            warn!("Connection {}: command queue full", conn_id);
                        }
                    }
                    None => {
                        warn!("send command for unknown connection {}", conn_id);
                    }
                }
            }
            None => {
                warn!("Ignoring malformed send command");
            }
        }
        return;
    }

    let line = match std::str::from_utf8(line) {
        Ok(line) => line,
        Err(_) => {
            warn!("Ignoring non-UTF-8 control line");
            return;
        }
    };

    if let Some(arg) = line.strip_prefix("disconnect ") {
        match arg.parse::<u64>() {
            Ok(conn_id) => match state.cmd_sender(conn_id) {
                Some(snd_cmd) => {
                    let _ = snd_cmd.try_send(ConnCmd::Disconnect);
                }
                None => {
                    warn!("disconnect command for unknown connection {}", conn_id);
                }
            },
            Err(_) => {
                warn!("Ignoring disconnect command with bad connection id: {:?}", arg);
            }
        }
        return;
    }

    if line.starts_with("connect ") {
        match Lifecycle::parse(line) {
            Some(Lifecycle::Connect {
                host,
                port,
                ssl,
                profile,
            }) => {
                start_connection(state, host, port, ssl, profile);
            }
            _ => {
                warn!("Ignoring malformed connect command: {:?}", line);
            }
        }
        return;
    }

    warn!("Ignoring unknown control line: {:?}", line);
}

fn start_connection(state: &Connector, host: String, port: u16, ssl: bool, profile: String) {
    let conn_id = state.alloc_conn_id();
    let lifecycle = Lifecycle::Connect {
        host: host.clone(),
        port,
        ssl,
        profile: profile.clone(),
    };
    if !state.emit(
        conn_id,
        mamirc_common::EventKind::Connection,
        lifecycle.encode().as_bytes(),
    ) {
        return;
    }

    let (snd_cmd, rcv_cmd) = mpsc::channel::<ConnCmd>(100);
    state.register_conn(conn_id, ConnHandle { profile, snd_cmd });
    info!("Connection {}: connecting to {}:{} (ssl: {})", conn_id, host, port, ssl);
    tokio::task::spawn_local(conn::conn_task(
        state.clone(),
        conn_id,
        host,
        port,
        ssl,
        rcv_cmd,
    ));
}

/// Buffered line reading over the control socket, sharing the connector's tolerant framing.
struct LineReader {
    read_half: OwnedReadHalf,
    linebuf: LineBuf,
    pending: std::collections::VecDeque<Vec<u8>>,
}

impl LineReader {
    fn new(read_half: OwnedReadHalf) -> LineReader {
        LineReader {
            read_half,
            linebuf: LineBuf::new(CTL_MAX_LINE),
            pending: std::collections::VecDeque::new(),
        }
    }

    async fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            let mut buf: [u8; 1024] = [0; 1024];
            match self.read_half.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => {
                    self.pending.extend(self.linebuf.feed(&buf[..n]));
                }
            }
        }
    }
}
