//! One outbound IRC connection: a reader task framing raw bytes into RECEIVE events and a writer
//! task draining the output queue through the send throttle.

use crate::linebuf::LineBuf;
use crate::state::Connector;
use crate::stream::Stream;
use crate::throttle::{Throttle, BURST, STEP};

use mamirc_common::{EventKind, Lifecycle};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

use futures_util::future::FutureExt;
use futures_util::stream::StreamExt;
use futures_util::{pin_mut, select};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Maximum IRC line length, in bytes, in both directions.
pub(crate) const MAX_LINE_LEN: usize = 1000;

const SEND_QUEUE_LEN: usize = 1000;

pub(crate) struct ConnHandle {
    pub(crate) profile: String,
    pub(crate) snd_cmd: mpsc::Sender<ConnCmd>,
}

#[derive(Debug)]
pub(crate) enum ConnCmd {
    /// Queue a raw line (without terminator) for sending.
    Send(Vec<u8>),
    /// Graceful client-side close.
    Disconnect,
    /// Internal: the writer task hit an I/O error.
    Stop,
}

pub(crate) async fn conn_task(
    state: Connector,
    conn_id: u64,
    host: String,
    port: u16,
    ssl: bool,
    rcv_cmd: mpsc::Receiver<ConnCmd>,
) {
    // The `connect` lifecycle event was journaled when the command was accepted.
    let mut rcv_cmd = ReceiverStream::new(rcv_cmd).fuse();

    let connect_fut = establish(host, port, ssl).fuse();
    pin_mut!(connect_fut);

    let (addr, stream) = loop {
        select! {
            res = connect_fut => {
                match res {
                    Ok(conn) => break conn,
                    Err(err) => {
                        info!("Connection {} failed: {}", conn_id, err);
                        return finish(&state, conn_id);
                    }
                }
            }
            cmd = rcv_cmd.next() => {
                match cmd {
                    Some(ConnCmd::Disconnect) => {
                        state.emit(
                            conn_id,
                            EventKind::Connection,
                            Lifecycle::Disconnect.encode().as_bytes(),
                        );
                        return finish(&state, conn_id);
                    }
                    Some(ConnCmd::Send(_)) => {
                        debug!("Connection {}: dropping send before open", conn_id);
                    }
                    Some(ConnCmd::Stop) | None => {
                        return finish(&state, conn_id);
                    }
                }
            }
        }
    };

    let opened = Lifecycle::Opened {
        ip: addr.ip().to_string(),
    };
    if !state.emit(conn_id, EventKind::Connection, opened.encode().as_bytes()) {
        return finish(&state, conn_id);
    }

    let (mut read_half, write_half) = tokio::io::split(stream);

    // Writer task. It signals failures back through the command channel so the reader loop can
    // tear the connection down.
    let (snd_out, rcv_out) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_LEN);
    if let Some(snd_cmd) = state.cmd_sender(conn_id) {
        tokio::task::spawn_local(writer_task(
            state.clone(),
            conn_id,
            write_half,
            rcv_out,
            snd_cmd,
        ));
    }

    let mut linebuf = LineBuf::new(MAX_LINE_LEN);
    let mut read_buf: [u8; 1024] = [0; 1024];

    'main: loop {
        select! {
            cmd = rcv_cmd.next() => {
                match cmd {
                    Some(ConnCmd::Send(line)) => {
                        if snd_out.try_send(line).is_err() {
                            warn!("Connection {}: output queue full, dropping line", conn_id);
                        }
                    }
                    Some(ConnCmd::Disconnect) => {
                        state.emit(
                            conn_id,
                            EventKind::Connection,
                            Lifecycle::Disconnect.encode().as_bytes(),
                        );
                        break 'main;
                    }
                    Some(ConnCmd::Stop) | None => {
                        break 'main;
                    }
                }
            }
            res = read_half.read(&mut read_buf).fuse() => {
                match res {
                    Err(err) => {
                        debug!("Connection {}: read error: {}", conn_id, err);
                        break 'main;
                    }
                    Ok(0) => {
                        debug!("Connection {}: closed by remote", conn_id);
                        break 'main;
                    }
                    Ok(n) => {
                        for line in linebuf.feed(&read_buf[..n]) {
                            if !state.emit(conn_id, EventKind::Receive, &line) {
                                break 'main;
                            }
                        }
                    }
                }
            }
        }
    }

    finish(&state, conn_id)
}

/// Journal the final `closed` event and drop the connection from the live table. Dropping the
/// handle closes the output queue, which ends the writer task.
fn finish(state: &Connector, conn_id: u64) {
    state.emit(
        conn_id,
        EventKind::Connection,
        Lifecycle::Closed.encode().as_bytes(),
    );
    state.remove_conn(conn_id);
}

async fn establish(host: String, port: u16, ssl: bool) -> io::Result<(SocketAddr, Stream)> {
    let host_clone = host.clone();
    let addrs = tokio::task::spawn_blocking(move || (host_clone.as_str(), port).to_socket_addrs())
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}", host),
        ));
    }

    let mut last_err = None;
    for addr in addrs {
        debug!("Connecting to {}", addr);
        match Stream::connect(addr, ssl.then_some(host.as_str())).await {
            Ok(stream) => return Ok((addr, stream)),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "connect failed")))
}

async fn writer_task(
    state: Connector,
    conn_id: u64,
    mut write_half: WriteHalf<Stream>,
    mut rcv_out: mpsc::Receiver<Vec<u8>>,
    snd_cmd: mpsc::Sender<ConnCmd>,
) {
    let mut throttle = Throttle::new(STEP, BURST);

    while let Some(mut line) = rcv_out.recv().await {
        if line.contains(&0) {
            warn!("Connection {}: dropping outbound line with NUL byte", conn_id);
            continue;
        }
        if line.len() > MAX_LINE_LEN - 2 {
            warn!(
                "Connection {}: truncating outbound line of {} bytes",
                conn_id,
                line.len()
            );
            line.truncate(MAX_LINE_LEN - 2);
        }

        let delay = throttle.next_delay(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut bytes = line.clone();
        bytes.extend_from_slice(b"\r\n");
        if let Err(err) = write_half.write_all(&bytes).await {
            debug!("Connection {}: write error: {}", conn_id, err);
            let _ = snd_cmd.try_send(ConnCmd::Stop);
            return;
        }

        // SEND events record what was actually written (without the terminator)
        if !state.emit(conn_id, EventKind::Send, &line) {
            let _ = snd_cmd.try_send(ConnCmd::Stop);
            return;
        }
    }
}
