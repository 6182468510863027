//! Tolerant line framing over a raw byte stream.
//!
//! IRC servers in the wild terminate lines with CR, LF or CR+LF, sometimes inconsistently within
//! one connection, so all three are accepted (a CR immediately followed by a LF counts as one
//! terminator). Lines longer than the configured maximum are dropped whole; reading resumes at
//! the next terminator.

pub(crate) struct LineBuf {
    buf: Vec<u8>,
    max_len: usize,
    /// Currently discarding an oversized line, until the next terminator.
    overflowed: bool,
    /// Last byte seen was CR, so an immediately following LF is part of the same terminator.
    last_was_cr: bool,
}

impl LineBuf {
    pub(crate) fn new(max_len: usize) -> LineBuf {
        LineBuf {
            buf: Vec::with_capacity(1024),
            max_len,
            overflowed: false,
            last_was_cr: false,
        }
    }

    /// Feed bytes, returning the lines completed by them (without terminators).
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for byte in bytes {
            match *byte {
                b'\r' => {
                    self.finish_line(&mut lines);
                    self.last_was_cr = true;
                }
                b'\n' => {
                    if self.last_was_cr {
                        // Second half of a CR+LF pair; the line was finished at the CR
                        self.last_was_cr = false;
                    } else {
                        self.finish_line(&mut lines);
                    }
                }
                byte => {
                    self.last_was_cr = false;
                    if self.overflowed {
                        continue;
                    }
                    if self.buf.len() == self.max_len {
                        warn!("Dropping line longer than {} bytes", self.max_len);
                        self.buf.clear();
                        self.overflowed = true;
                    } else {
                        self.buf.push(byte);
                    }
                }
            }
        }
        lines
    }

    fn finish_line(&mut self, lines: &mut Vec<Vec<u8>>) {
        if self.overflowed {
            self.overflowed = false;
        } else {
            lines.push(std::mem::take(&mut self.buf));
        }
    }
}
