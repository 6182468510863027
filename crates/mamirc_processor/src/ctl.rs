//! Control-port client: attaches to the connector, pumps the replayed and live event stream into
//! the core, and writes outbound command lines.

use crate::core::Shared;

use mamirc_common::Event;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub(crate) async fn run(
    shared: Shared,
    port: u16,
    password: String,
    mut rcv_cmd: mpsc::Receiver<Vec<u8>>,
) -> anyhow::Result<()> {
    let sock = TcpStream::connect(("127.0.0.1", port)).await?;
    info!("Attached to connector on 127.0.0.1:{}", port);
    let (read_half, mut write_half) = sock.into_split();

    let mut hello = Vec::new();
    hello.extend_from_slice(password.as_bytes());
    hello.extend_from_slice(b"\r\nattach\r\n");
    write_half.write_all(&hello).await?;

    // Command writer. The core queues complete command lines; this task frames them.
    tokio::spawn(async move {
        while let Some(mut cmd) = rcv_cmd.recv().await {
            cmd.extend_from_slice(b"\r\n");
            if write_half.write_all(&cmd).await.is_err() {
                return;
            }
        }
    });

    // Event reader. Our own connector writes strict CR+LF lines.
    let mut reader = BufReader::new(read_half);
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            anyhow::bail!("connector closed the control connection");
        }
        while matches!(buf.last(), Some(b'\r') | Some(b'\n')) {
            buf.pop();
        }
        if buf.is_empty() {
            continue;
        }

        if buf == b"caught-up" {
            shared.core.lock().unwrap().handle_caught_up();
            continue;
        }

        match Event::parse_line(&buf) {
            Ok(ev) => {
                shared.core.lock().unwrap().handle_event(ev);
            }
            Err(err) => {
                warn!("Ignoring unparseable event line: {}", err);
            }
        }
    }
}
