//! The append-only event journal.
//!
//! One record per line: `<conn-id> <seq> <timestamp-ms> <kind> <base64(payload)>`. A single owner
//! performs all writes, so record order in the file is commit order; per-connection sequence
//! numbers increase by one. Flushed on every append; fsynced at most once per second, so a crash
//! loses a small tail at worst. On open the existing file is scanned once to seed the sequence
//! counters and the next connection id; a torn final record (crash mid-write) is skipped.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use mamirc_common::{now_ms, Event, EventKind};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const SYNC_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct Journal {
    path: PathBuf,
    out: BufWriter<File>,
    /// Next sequence number per connection id.
    seqs: HashMap<u64, u64>,
    next_conn_id: u64,
    last_sync: Instant,
}

impl Journal {
    pub(crate) fn open(path: &Path) -> io::Result<Journal> {
        let mut seqs: HashMap<u64, u64> = HashMap::new();
        let mut next_conn_id = 0;

        if path.exists() {
            // Scan once to seed counters. `good_end` is the byte offset just past the last record
            // that parsed; anything after it is a torn tail from a crash and gets truncated so
            // that new appends start on a record boundary.
            let mut reader = BufReader::new(File::open(path)?);
            let mut pos: u64 = 0;
            let mut good_end: u64 = 0;
            let mut buf = String::new();
            loop {
                buf.clear();
                let n = reader.read_line(&mut buf)?;
                if n == 0 {
                    break;
                }
                pos += n as u64;
                match parse_record(buf.trim_end_matches(['\r', '\n'])) {
                    Some(ev) => {
                        seqs.insert(ev.conn_id, ev.seq + 1);
                        if ev.conn_id >= next_conn_id {
                            next_conn_id = ev.conn_id + 1;
                        }
                        good_end = pos;
                    }
                    None => {
                        break;
                    }
                }
            }
            let file_len = std::fs::metadata(path)?.len();
            if good_end < file_len {
                warn!(
                    "Journal {:?}: truncating {} byte(s) of torn tail",
                    path,
                    file_len - good_end
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(good_end)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Journal {
            path: path.to_owned(),
            out: BufWriter::new(file),
            seqs,
            next_conn_id,
            last_sync: Instant::now(),
        })
    }

    /// Connection ids are never reused within the lifetime of the journal file.
    pub(crate) fn alloc_conn_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Append one event, assigning its per-connection sequence number and timestamp. The record
    /// is flushed to the OS before this returns; it becomes visible to a subscriber only after.
    pub(crate) fn append(
        &mut self,
        conn_id: u64,
        kind: EventKind,
        line: &[u8],
    ) -> io::Result<Event> {
        let seq = self.seqs.entry(conn_id).or_insert(0);
        let ev = Event::new(conn_id, *seq, now_ms(), kind, line.to_vec());
        writeln!(
            self.out,
            "{} {} {} {} {}",
            ev.conn_id,
            ev.seq,
            ev.timestamp,
            kind.as_str(),
            BASE64.encode(line)
        )?;
        self.out.flush()?;
        *seq += 1;

        if self.last_sync.elapsed() >= SYNC_INTERVAL {
            self.sync();
        }
        Ok(ev)
    }

    /// Read back every committed event, in commit order.
    pub(crate) fn replay(&mut self) -> io::Result<Vec<Event>> {
        self.out.flush()?;
        let mut events = Vec::new();
        for line in BufReader::new(File::open(&self.path)?).lines() {
            let line = line?;
            if let Some(ev) = parse_record(&line) {
                events.push(ev);
            }
        }
        Ok(events)
    }

    pub(crate) fn sync(&mut self) {
        let _ = self.out.flush();
        if let Err(err) = self.out.get_ref().sync_data() {
            warn!("Journal fsync failed: {}", err);
        }
        self.last_sync = Instant::now();
    }
}

fn parse_record(line: &str) -> Option<Event> {
    let mut parts = line.splitn(5, ' ');
    let conn_id = parts.next()?.parse::<u64>().ok()?;
    let seq = parts.next()?.parse::<u64>().ok()?;
    let timestamp = parts.next()?.parse::<u64>().ok()?;
    let kind = EventKind::parse(parts.next()?)?;
    let payload = BASE64.decode(parts.next()?).ok()?;
    Some(Event::new(conn_id, seq, timestamp, kind, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_journal(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push("mamirc_journal_tests");
        let _ = std::fs::create_dir_all(&dir);
        dir.push(name);
        let _ = std::fs::remove_file(&dir);
        dir
    }

    #[test]
    fn append_then_replay_in_order() {
        let path = temp_journal("order.dat");
        let mut journal = Journal::open(&path).unwrap();

        let c0 = journal.alloc_conn_id();
        let c1 = journal.alloc_conn_id();
        journal.append(c0, EventKind::Connection, b"opened 10.0.0.1").unwrap();
        journal.append(c1, EventKind::Receive, b":srv 001 me :hi").unwrap();
        journal.append(c0, EventKind::Send, b"NICK me").unwrap();

        let events = journal.replay().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].conn_id, c0);
        assert_eq!(events[0].kind, EventKind::Connection);
        assert_eq!(events[1].conn_id, c1);
        assert_eq!(events[2].line, b"NICK me".to_vec());
        // Sequences count per connection
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 0);
        assert_eq!(events[2].seq, 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sequences_survive_reopen() {
        let path = temp_journal("reopen.dat");
        let conn;
        {
            let mut journal = Journal::open(&path).unwrap();
            conn = journal.alloc_conn_id();
            journal.append(conn, EventKind::Receive, b"a").unwrap();
            journal.append(conn, EventKind::Receive, b"b").unwrap();
            journal.sync();
        }
        {
            let mut journal = Journal::open(&path).unwrap();
            // Ids allocated after reopen do not collide with journaled ones
            assert!(journal.alloc_conn_id() > conn);
            // And sequence numbering continues where the previous run stopped
            let ev = journal.append(conn, EventKind::Receive, b"c").unwrap();
            assert_eq!(ev.seq, 2);

            let events = journal.replay().unwrap();
            let seqs: Vec<Vec<u8>> = events
                .iter()
                .filter(|ev| ev.conn_id == conn)
                .map(|ev| ev.line.clone())
                .collect();
            assert_eq!(seqs, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_skipped() {
        let path = temp_journal("torn.dat");
        {
            let mut journal = Journal::open(&path).unwrap();
            let conn = journal.alloc_conn_id();
            journal.append(conn, EventKind::Receive, b"good").unwrap();
            journal.sync();
        }
        // Simulate a crash mid-record
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"0 1 12345 RECE").unwrap();
        }
        let mut journal = Journal::open(&path).unwrap();
        let events = journal.replay().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].line, b"good".to_vec());

        // The torn tail was truncated away, so new appends land on a record boundary
        journal.append(0, EventKind::Receive, b"after").unwrap();
        let events = journal.replay().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].line, b"after".to_vec());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn payload_bytes_roundtrip() {
        let path = temp_journal("bytes.dat");
        let mut journal = Journal::open(&path).unwrap();
        let conn = journal.alloc_conn_id();
        let payload = vec![b':', 0xc3, 0x28, b' ', 0x00, b'x'];
        journal.append(conn, EventKind::Receive, &payload).unwrap();
        assert_eq!(journal.replay().unwrap()[0].line, payload);
        let _ = std::fs::remove_file(&path);
    }
}
