use std::{io, time::Instant};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UnixStream},
};

use resp_proto::{FrameError, Reply};

use crate::{address::ServerAddr, options::BenchConfig, workload::Template};

/// Alphabet the randomization slots are refilled from.
const RAND_ALPHABET: &[u8] = b"0123456789!@#$%^&*ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const SLOTS_INITIAL_CAPACITY: usize = 8;
const READ_CHUNK: usize = 16 * 1024;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// One socket plus the incremental reply parser state.
pub struct Connection {
    stream: Stream,
    rbuf: Vec<u8>,
}

impl Connection {
    pub async fn connect(addr: &ServerAddr) -> io::Result<Self> {
        let stream = match addr {
            ServerAddr::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            ServerAddr::Unix(path) => Stream::Unix(UnixStream::connect(path).await?),
        };
        Ok(Self {
            stream,
            rbuf: Vec::with_capacity(READ_CHUNK),
        })
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.stream {
            Stream::Tcp(stream) => stream.write(buf).await?,
            Stream::Unix(stream) => stream.write(buf).await?,
        };
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        Ok(n)
    }

    /// Read once from the socket into the parser buffer.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match &mut self.stream {
            Stream::Tcp(stream) => stream.read(&mut chunk).await?,
            Stream::Unix(stream) => stream.read(&mut chunk).await?,
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ));
        }
        self.rbuf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Pop one complete reply off the parser buffer, if present.
    fn try_pop(&mut self) -> Result<Option<Reply>, FrameError> {
        match resp_proto::decode(&self.rbuf)? {
            Some((reply, used)) => {
                self.rbuf.drain(..used);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

/// The prebuilt request bytes for one client: an optional database-selection
/// prefix followed by the workload command repeated `pipeline` times.
///
/// Randomization slots are tracked as offsets rather than raw pointers, so
/// the buffer is free to move and to shrink when the prefix is discarded.
pub struct RequestBuffer {
    buf: Vec<u8>,
    prefix_len: usize,
    slots: Vec<usize>,
    sentinel_len: usize,
    keyspacelen: usize,
}

impl RequestBuffer {
    /// Build the buffer from a workload template, scanning the body for
    /// sentinel occurrences that later rounds will randomize.
    pub fn from_template(cfg: &BenchConfig, template: &Template) -> Self {
        let mut buf = prefix_bytes(cfg);
        let prefix_len = buf.len();
        buf.reserve(template.cmd.len() * cfg.pipeline);
        for _ in 0..cfg.pipeline {
            buf.extend_from_slice(&template.cmd);
        }

        let mut slots = Vec::with_capacity(SLOTS_INITIAL_CAPACITY);
        if cfg.randomkeys {
            let needle = cfg.sentinel.as_bytes();
            let step = if template.keysize != 0 {
                template.keysize
            } else {
                needle.len()
            };
            let mut at = prefix_len;
            while let Some(pos) = find(&buf[at..], needle) {
                slots.push(at + pos);
                at += pos + step;
            }
        }

        Self {
            buf,
            prefix_len,
            slots,
            sentinel_len: cfg.sentinel.len(),
            keyspacelen: cfg.keyspacelen,
        }
    }

    /// Clone another client's body without rescanning it: slot offsets are
    /// carried over, adjusted for the difference in prefix length.
    pub fn cloned(cfg: &BenchConfig, from: &RequestBuffer) -> Self {
        let mut buf = prefix_bytes(cfg);
        let prefix_len = buf.len();
        buf.extend_from_slice(&from.buf[from.prefix_len..]);
        let slots = from
            .slots
            .iter()
            .map(|&slot| slot - from.prefix_len + prefix_len)
            .collect();
        Self {
            buf,
            prefix_len,
            slots,
            sentinel_len: from.sentinel_len,
            keyspacelen: from.keyspacelen,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Drop the acknowledged prefix commands in place and rebase every slot
    /// offset into the remaining body.
    pub fn discard_prefix(&mut self) {
        let n = self.prefix_len;
        self.buf.drain(..n);
        for slot in &mut self.slots {
            *slot -= n;
        }
        self.prefix_len = 0;
    }

    /// Rewrite the randomized region that follows each sentinel with fresh
    /// bytes from the alphabet.
    pub fn randomize(&mut self, rng: &mut SmallRng) {
        for &slot in &self.slots {
            let start = (slot + self.sentinel_len).min(self.buf.len());
            let end = (start + self.keyspacelen).min(self.buf.len());
            for byte in &mut self.buf[start..end] {
                *byte = RAND_ALPHABET[rng.gen_range(0..RAND_ALPHABET.len())];
            }
        }
    }
}

fn prefix_bytes(cfg: &BenchConfig) -> Vec<u8> {
    if cfg.dbnum != 0 {
        resp_proto::encode_command(&[b"SELECT".as_slice(), cfg.dbnum.to_string().as_bytes()])
    } else {
        Vec::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reading failed: either the socket died or the byte stream stopped being
/// valid RESP. Both are fatal to the benchmark.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// State machine for one connection's request rounds.
///
/// A round writes the whole request buffer, then consumes one reply per
/// pipelined command. Latency is stamped when the first bytes of the round
/// arrive, so reply parsing is never part of the measurement.
pub struct Client {
    conn: Connection,
    req: RequestBuffer,
    written: usize,
    pending: usize,
    prefix_pending: usize,
    start: Instant,
    latency_us: i64,
    rng: SmallRng,
}

impl Client {
    pub async fn from_template(cfg: &BenchConfig, template: &Template) -> io::Result<Self> {
        let conn = Connection::connect(&cfg.addr).await?;
        Ok(Self::assemble(
            cfg,
            RequestBuffer::from_template(cfg, template),
            conn,
        ))
    }

    /// Open a fresh connection carrying a copy of `from`'s request buffer.
    pub async fn cloned(cfg: &BenchConfig, from: &Client) -> io::Result<Self> {
        let conn = Connection::connect(&cfg.addr).await?;
        Ok(Self::assemble(
            cfg,
            RequestBuffer::cloned(cfg, &from.req),
            conn,
        ))
    }

    fn assemble(cfg: &BenchConfig, req: RequestBuffer, conn: Connection) -> Self {
        let prefix_pending = usize::from(req.prefix_len() > 0);
        Self {
            conn,
            req,
            written: 0,
            pending: cfg.pipeline + prefix_pending,
            prefix_pending,
            start: Instant::now(),
            latency_us: -1,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Start a round: refresh the key slots and stamp the request start time.
    /// Slot randomization happens before the stamp so it never counts as
    /// latency.
    pub fn begin_round(&mut self, randomkeys: bool) {
        if randomkeys {
            self.req.randomize(&mut self.rng);
        }
        self.written = 0;
        self.start = Instant::now();
        self.latency_us = -1;
    }

    /// Send the whole request buffer, tracking how much has gone out.
    pub async fn write_round(&mut self) -> io::Result<()> {
        while self.written < self.req.len() {
            let n = self.conn.write(&self.req.bytes()[self.written..]).await?;
            self.written += n;
        }
        Ok(())
    }

    /// Wait for the next complete reply of the current round.
    pub async fn next_reply(&mut self) -> Result<Reply, ReadError> {
        loop {
            if let Some(reply) = self.conn.try_pop()? {
                return Ok(reply);
            }
            self.conn.fill().await?;
            if self.latency_us < 0 {
                self.latency_us = self.start.elapsed().as_micros() as i64;
            }
        }
    }

    pub fn latency_us(&self) -> i64 {
        self.latency_us
    }

    pub fn round_complete(&self) -> bool {
        self.pending == 0
    }

    pub fn has_prefix_pending(&self) -> bool {
        self.prefix_pending > 0
    }

    /// Consume the reply to a prefix command. Once the whole prefix segment is
    /// acknowledged it is dropped from the buffer, so reused rounds rewrite
    /// only the body.
    pub fn complete_prefix_reply(&mut self) {
        self.prefix_pending -= 1;
        self.pending -= 1;
        if self.req.prefix_len() > 0 {
            self.req.discard_prefix();
        }
    }

    pub fn complete_body_reply(&mut self) {
        self.pending -= 1;
    }

    /// Re-arm the buffer for another round on the same connection.
    pub fn reset(&mut self, pipeline: usize) {
        self.written = 0;
        self.pending = pipeline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{self, Selection, DEFAULT_SENTINEL};

    fn config() -> BenchConfig {
        BenchConfig {
            addr: ServerAddr::Tcp {
                host: "127.0.0.1".to_owned(),
                port: 6379,
            },
            numclients: 1,
            requests: 100,
            keepalive: true,
            datasize: 3,
            pipeline: 1,
            randomkeys: true,
            keyspacelen: 4,
            quiet: false,
            csv: false,
            idle: false,
            show_errors: false,
            inc_value: 1,
            max_latency_ms: 10,
            dbnum: 0,
            sentinel: DEFAULT_SENTINEL.to_owned(),
            subkeys: 10,
        }
    }

    fn set_template(cfg: &BenchConfig) -> Template {
        workload::suite(cfg, &Selection::new(&Some(vec!["set".to_owned()])))
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn scan_finds_one_slot_per_pipelined_command() {
        let mut cfg = config();
        cfg.pipeline = 3;
        let template = set_template(&cfg);
        let req = RequestBuffer::from_template(&cfg, &template);

        assert_eq!(req.slots().len(), 3);
        for &slot in req.slots() {
            assert_eq!(&req.bytes()[slot..slot + 12], b"__rand_int__");
        }
        assert_eq!(req.len(), template.cmd.len() * 3);
    }

    #[test]
    fn scan_finds_adjacent_slots_in_one_command() {
        let cfg = config();
        let template = workload::suite(&cfg, &Selection::new(&Some(vec!["mset".to_owned()])))
            .into_iter()
            .next()
            .unwrap();
        let req = RequestBuffer::from_template(&cfg, &template);
        assert_eq!(req.slots().len(), 10);
    }

    #[test]
    fn prefix_offsets_are_rebased_after_discard() {
        let mut cfg = config();
        cfg.dbnum = 3;
        let template = set_template(&cfg);
        let mut with_prefix = RequestBuffer::from_template(&cfg, &template);

        cfg.dbnum = 0;
        let without_prefix = RequestBuffer::from_template(&cfg, &template);

        let select = b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n";
        assert_eq!(with_prefix.prefix_len(), select.len());
        assert!(with_prefix.bytes().starts_with(select));

        with_prefix.discard_prefix();
        assert_eq!(with_prefix.prefix_len(), 0);
        assert_eq!(with_prefix.bytes(), without_prefix.bytes());
        assert_eq!(with_prefix.slots(), without_prefix.slots());
    }

    #[test]
    fn randomize_rewrites_exactly_the_padded_region() {
        let cfg = config();
        let template = set_template(&cfg);
        let mut req = RequestBuffer::from_template(&cfg, &template);
        let before = req.bytes().to_vec();
        let slot = req.slots()[0];

        let mut rng = SmallRng::seed_from_u64(7);
        req.randomize(&mut rng);
        let after = req.bytes();

        let start = slot + 12;
        let end = start + cfg.keyspacelen;
        assert_eq!(&after[..start], &before[..start]);
        assert_eq!(&after[end..], &before[end..]);
        assert!(after[start..end]
            .iter()
            .all(|b| RAND_ALPHABET.contains(b)));
    }

    #[test]
    fn zero_length_slots_leave_the_buffer_untouched() {
        let mut cfg = config();
        cfg.keyspacelen = 0;
        let template = set_template(&cfg);
        let mut req = RequestBuffer::from_template(&cfg, &template);
        let before = req.bytes().to_vec();
        let mut rng = SmallRng::seed_from_u64(7);
        req.randomize(&mut rng);
        assert_eq!(req.bytes(), &before[..]);
    }

    #[test]
    fn successive_rounds_pick_different_keys() {
        let cfg = config();
        let template = set_template(&cfg);
        let mut req = RequestBuffer::from_template(&cfg, &template);
        let mut rng = SmallRng::seed_from_u64(7);

        req.randomize(&mut rng);
        let first = req.bytes().to_vec();
        req.randomize(&mut rng);
        assert_ne!(req.bytes(), &first[..]);
    }

    #[test]
    fn clone_matches_construction_from_the_same_template() {
        let mut cfg = config();
        cfg.dbnum = 2;
        cfg.pipeline = 2;
        let template = set_template(&cfg);

        let fresh = RequestBuffer::from_template(&cfg, &template);
        let cloned = RequestBuffer::cloned(&cfg, &fresh);
        assert_eq!(cloned.bytes(), fresh.bytes());
        assert_eq!(cloned.slots(), fresh.slots());
        assert_eq!(cloned.prefix_len(), fresh.prefix_len());

        // Cloning from a client whose prefix was already discarded prepends a
        // fresh prefix and translates the offsets back.
        let mut trimmed = RequestBuffer::from_template(&cfg, &template);
        trimmed.discard_prefix();
        let recloned = RequestBuffer::cloned(&cfg, &trimmed);
        assert_eq!(recloned.bytes(), fresh.bytes());
        assert_eq!(recloned.slots(), fresh.slots());
    }

    #[test]
    fn idle_template_builds_an_empty_body() {
        let mut cfg = config();
        cfg.randomkeys = false;
        let req = RequestBuffer::from_template(&cfg, &Template::idle());
        assert!(req.is_empty());
        assert!(req.slots().is_empty());
    }
}
