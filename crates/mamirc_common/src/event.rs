//! The event model shared by the connector and the processor.
//!
//! Every byte exchanged with an IRC server, plus every connection lifecycle change, becomes an
//! `Event`. The connector journals events and streams them to the attached processor as lines of
//! the form `<conn-id> <seq> <timestamp-ms> <kind> <payload>`, where the payload is the raw line
//! bytes (not necessarily UTF-8).

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What an event records: a connection lifecycle change, a line received from the server, or a
/// line sent to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connection,
    Receive,
    Send,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connection => "CONNECTION",
            EventKind::Receive => "RECEIVE",
            EventKind::Send => "SEND",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "CONNECTION" => Some(EventKind::Connection),
            "RECEIVE" => Some(EventKind::Receive),
            "SEND" => Some(EventKind::Send),
            _ => None,
        }
    }
}

/// One journaled/streamed event. `seq` is the per-connection sequence number assigned by the
/// journal, increasing by one. `line` holds the payload verbatim; for `Receive` and `Send` events
/// that is the IRC line without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub conn_id: u64,
    /// Strictly increasing by one within a connection.
    pub seq: u64,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub kind: EventKind,
    pub line: Vec<u8>,
}

impl Event {
    pub fn new(conn_id: u64, seq: u64, timestamp: u64, kind: EventKind, line: Vec<u8>) -> Event {
        Event {
            conn_id,
            seq,
            timestamp,
            kind,
            line,
        }
    }

    /// Encode for the control-port stream: `<conn-id> <seq> <timestamp-ms> <kind> <payload>`,
    /// without a line terminator.
    pub fn encode_line(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {} {} ",
            self.conn_id,
            self.seq,
            self.timestamp,
            self.kind.as_str()
        )
        .into_bytes();
        out.extend_from_slice(&self.line);
        out
    }

    /// Parse a control-port stream line. The four header fields are ASCII; everything after the
    /// fourth space is the payload, taken verbatim.
    pub fn parse_line(bytes: &[u8]) -> Result<Event, String> {
        let mut rest = bytes;
        let mut fields: [&[u8]; 4] = [&[]; 4];
        for field in fields.iter_mut() {
            let sp = rest
                .iter()
                .position(|b| *b == b' ')
                .ok_or_else(|| format!("truncated event line: {:?}", String::from_utf8_lossy(bytes)))?;
            *field = &rest[..sp];
            rest = &rest[sp + 1..];
        }

        let conn_id = parse_u64(fields[0])
            .ok_or_else(|| format!("bad conn-id in event line: {:?}", String::from_utf8_lossy(bytes)))?;
        let seq = parse_u64(fields[1])
            .ok_or_else(|| format!("bad sequence in event line: {:?}", String::from_utf8_lossy(bytes)))?;
        let timestamp = parse_u64(fields[2])
            .ok_or_else(|| format!("bad timestamp in event line: {:?}", String::from_utf8_lossy(bytes)))?;
        let kind = std::str::from_utf8(fields[3])
            .ok()
            .and_then(EventKind::parse)
            .ok_or_else(|| format!("bad kind in event line: {:?}", String::from_utf8_lossy(bytes)))?;

        Ok(Event {
            conn_id,
            seq,
            timestamp,
            kind,
            line: rest.to_vec(),
        })
    }
}

fn parse_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse::<u64>().ok()
}

/// Payload of a CONNECTION event. The connector emits `connect` when it accepts a connect
/// command, `opened` once the TCP/TLS stream is established, `disconnect` when a client-side
/// disconnect command arrives, and `closed` exactly once on final teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Connect {
        host: String,
        port: u16,
        ssl: bool,
        /// Final field; may contain spaces.
        profile: String,
    },
    Opened {
        ip: String,
    },
    Disconnect,
    Closed,
}

impl Lifecycle {
    pub fn encode(&self) -> String {
        match self {
            Lifecycle::Connect {
                host,
                port,
                ssl,
                profile,
            } => format!("connect {} {} {} {}", host, port, ssl, profile),
            Lifecycle::Opened { ip } => format!("opened {}", ip),
            Lifecycle::Disconnect => "disconnect".to_owned(),
            Lifecycle::Closed => "closed".to_owned(),
        }
    }

    pub fn parse(s: &str) -> Option<Lifecycle> {
        if s == "disconnect" {
            return Some(Lifecycle::Disconnect);
        }
        if s == "closed" {
            return Some(Lifecycle::Closed);
        }
        if let Some(ip) = s.strip_prefix("opened ") {
            return Some(Lifecycle::Opened { ip: ip.to_owned() });
        }
        if let Some(rest) = s.strip_prefix("connect ") {
            let mut parts = rest.splitn(4, ' ');
            let host = parts.next()?.to_owned();
            let port = parts.next()?.parse::<u16>().ok()?;
            let ssl = match parts.next()? {
                "true" => true,
                "false" => false,
                _ => return None,
            };
            let profile = parts.next()?.to_owned();
            if host.is_empty() || profile.is_empty() {
                return None;
            }
            return Some(Lifecycle::Connect {
                host,
                port,
                ssl,
                profile,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_line_roundtrip() {
        let ev = Event::new(
            3,
            7,
            1234567890123,
            EventKind::Receive,
            b":srv 001 nick :hi".to_vec(),
        );
        let line = ev.encode_line();
        assert_eq!(line, b"3 7 1234567890123 RECEIVE :srv 001 nick :hi".to_vec());
        assert_eq!(Event::parse_line(&line).unwrap(), ev);
    }

    #[test]
    fn event_line_payload_verbatim() {
        // Payload keeps interior spaces and non-UTF-8 bytes
        let ev = Event::new(0, 0, 1, EventKind::Send, vec![b'a', b' ', 0xff, b'b']);
        assert_eq!(Event::parse_line(&ev.encode_line()).unwrap(), ev);
    }

    #[test]
    fn event_line_rejects_garbage() {
        assert!(Event::parse_line(b"").is_err());
        assert!(Event::parse_line(b"1 2 3").is_err());
        assert!(Event::parse_line(b"x 2 3 RECEIVE y").is_err());
        assert!(Event::parse_line(b"1 x 3 RECEIVE y").is_err());
        assert!(Event::parse_line(b"1 2 3 NOPE y").is_err());
    }

    #[test]
    fn lifecycle_connect_profile_keeps_spaces() {
        let lc = Lifecycle::parse("connect irc.example.net 6697 true my cool network").unwrap();
        assert_eq!(
            lc,
            Lifecycle::Connect {
                host: "irc.example.net".to_owned(),
                port: 6697,
                ssl: true,
                profile: "my cool network".to_owned(),
            }
        );
        assert_eq!(lc.encode(), "connect irc.example.net 6697 true my cool network");
    }

    #[test]
    fn lifecycle_parse_rejects_malformed() {
        assert!(Lifecycle::parse("connect host notaport true p").is_none());
        assert!(Lifecycle::parse("connect host 6667 maybe p").is_none());
        assert!(Lifecycle::parse("connect host 6667 true").is_none());
        assert!(Lifecycle::parse("shutdown").is_none());
    }

    #[test]
    fn lifecycle_simple_forms() {
        assert_eq!(
            Lifecycle::parse("opened 203.0.113.7"),
            Some(Lifecycle::Opened {
                ip: "203.0.113.7".to_owned()
            })
        );
        assert_eq!(Lifecycle::parse("disconnect"), Some(Lifecycle::Disconnect));
        assert_eq!(Lifecycle::parse("closed"), Some(Lifecycle::Closed));
    }
}
