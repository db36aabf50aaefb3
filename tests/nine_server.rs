//! End-to-end protocol scenarios: a scripted client drives the real server
//! over an in-memory transport, against the block driver on a RAM disk.

use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fabric9::block::BlockDriver;
use fabric9::device::{MemoryDisk, StorageBackend};
use fabric9::proto::codec::{decode, encode, read_frame};
use fabric9::proto::{Fcall, Message, NOFID, NOTAG, OREAD, ORDWR, QTDIR};
use fabric9::{Capability, DriverConfig, Driver, DriverError, DriverResult, Server};

/// One-shot transport: the scripted requests are the read side, replies
/// accumulate in the write side.
struct Pipe {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Script {
    bytes: Vec<u8>,
}

impl Script {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn push(&mut self, tag: u16, body: Message) -> &mut Self {
        self.bytes.extend(encode(&Fcall::new(tag, body)).unwrap());
        self
    }

    /// Run the script against a fresh session; returns the replies and the
    /// serve result.
    fn run(&self, server: &Server) -> (Vec<Fcall>, Result<(), DriverError>) {
        let mut pipe = Pipe { input: Cursor::new(self.bytes.clone()), output: Vec::new() };
        let result = server.serve(&mut pipe);

        let mut replies = Vec::new();
        let mut cursor = Cursor::new(pipe.output);
        while let Some(frame) = read_frame(&mut cursor, u32::MAX).unwrap() {
            replies.push(decode(&frame).unwrap());
        }
        (replies, result)
    }
}

fn block_server() -> Server {
    block_server_with(Arc::new(MemoryDisk::new(1, 64)))
}

fn block_server_with(backend: Arc<dyn StorageBackend>) -> Server {
    let driver = Arc::new(BlockDriver::new("blk0", backend));
    let config = DriverConfig::new(
        "blk0",
        Capability::FILE_SYSTEM | BlockDriver::REQUIRED_CAPS,
        "/dev/sd",
    );
    driver.initialize(&config).unwrap();
    driver.start().unwrap();
    Server::new(driver)
}

/// RAM disk whose `write_sector` fails on a chosen call number.
struct FailingDisk {
    inner: MemoryDisk,
    fail_on_write: u64,
    writes: AtomicU64,
}

impl FailingDisk {
    fn new(inner: MemoryDisk, fail_on_write: u64) -> Self {
        Self { inner, fail_on_write, writes: AtomicU64::new(0) }
    }
}

impl StorageBackend for FailingDisk {
    fn init(&self) -> DriverResult<()> {
        self.inner.init()
    }
    fn device_count(&self) -> usize {
        self.inner.device_count()
    }
    fn capacity(&self, device: usize) -> DriverResult<u64> {
        self.inner.capacity(device)
    }
    fn sector_size(&self, device: usize) -> u32 {
        self.inner.sector_size(device)
    }
    fn read_sector(&self, device: usize, lba: u64, buf: &mut [u8]) -> DriverResult<()> {
        self.inner.read_sector(device, lba, buf)
    }
    fn write_sector(&self, device: usize, lba: u64, buf: &[u8]) -> DriverResult<()> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on_write {
            return Err(DriverError::Backend(format!("sector {} write failed", lba)));
        }
        self.inner.write_sector(device, lba, buf)
    }
    fn flush(&self, device: usize) -> DriverResult<()> {
        self.inner.flush(device)
    }
    fn model(&self, device: usize) -> String {
        self.inner.model(device)
    }
    fn serial(&self, device: usize) -> String {
        self.inner.serial(device)
    }
}

fn tversion(msize: u32, version: &str) -> Message {
    Message::Tversion { msize, version: version.into() }
}

fn tattach(fid: u32) -> Message {
    Message::Tattach { fid, afid: NOFID, uname: "user".into(), aname: "".into() }
}

fn walk(fid: u32, newfid: u32, names: &[&str]) -> Message {
    Message::Twalk { fid, newfid, wnames: names.iter().map(|s| s.to_string()).collect() }
}

#[test]
fn test_version_negotiation() {
    // Tversion(tag 0xFFFF, 8192, "9P2000") -> same back.
    let server = block_server();
    let mut script = Script::new();
    script.push(NOTAG, tversion(8192, "9P2000"));
    let (replies, result) = script.run(&server);
    result.unwrap();

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].tag, NOTAG);
    assert_eq!(
        replies[0].body,
        Message::Rversion { msize: 8192, version: "9P2000".into() }
    );
}

#[test]
fn test_version_clamps_to_server_max() {
    let server = block_server();
    let mut script = Script::new();
    script.push(NOTAG, tversion(1_000_000, "9P2000"));
    let (replies, _) = script.run(&server);
    assert_eq!(
        replies[0].body,
        Message::Rversion { msize: 8192, version: "9P2000".into() }
    );
}

#[test]
fn test_unsupported_version_resets_session() {
    // Unknown version: echo msize with "unknown", then refuse everything
    // but another Tversion.
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(4096, "9P2000.L"))
        .push(1, tattach(1))
        .push(NOTAG, tversion(4096, "9P2000"))
        .push(2, tattach(1));
    let (replies, result) = script.run(&server);
    result.unwrap();

    assert_eq!(
        replies[0].body,
        Message::Rversion { msize: 4096, version: "unknown".into() }
    );
    assert!(matches!(replies[1].body, Message::Rerror { .. }));
    assert_eq!(
        replies[2].body,
        Message::Rversion { msize: 4096, version: "9P2000".into() }
    );
    assert!(matches!(replies[3].body, Message::Rattach { .. }));
}

#[test]
fn test_attach_open_read_root() {
    // S3: attach yields a directory qid; reading the open root returns at
    // most the asked-for count.
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, Message::Topen { fid: 1, mode: OREAD })
        .push(3, Message::Tread { fid: 1, offset: 0, count: 100 });
    let (replies, result) = script.run(&server);
    result.unwrap();

    let Message::Rattach { qid } = replies[1].body else {
        panic!("expected Rattach, got {:?}", replies[1].body);
    };
    assert_ne!(qid.qtype & QTDIR, 0);

    assert!(matches!(replies[2].body, Message::Ropen { .. }));
    let Message::Rread { ref data } = replies[3].body else {
        panic!("expected Rread, got {:?}", replies[3].body);
    };
    assert!(!data.is_empty());
    assert!(data.len() <= 100);
}

#[test]
fn test_walk_to_data_and_read() {
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 2, &["disk", "0", "data"]))
        .push(3, Message::Topen { fid: 2, mode: ORDWR })
        .push(4, Message::Twrite { fid: 2, offset: 508, data: (1..=10).collect() })
        .push(5, Message::Tread { fid: 2, offset: 508, count: 10 });
    let (replies, result) = script.run(&server);
    result.unwrap();

    let Message::Rwalk { ref wqids } = replies[2].body else {
        panic!("expected Rwalk, got {:?}", replies[2].body);
    };
    assert_eq!(wqids.len(), 3);
    assert_eq!(wqids[2].qtype & QTDIR, 0);

    assert_eq!(replies[4].body, Message::Rwrite { count: 10 });
    assert_eq!(replies[5].body, Message::Rread { data: (1..=10).collect() });
}

#[test]
fn test_walk_partial_success_does_not_bind() {
    // "disk" resolves, "9" does not: one qid back, newfid stays unbound.
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 3, &["disk", "9", "data"]))
        .push(3, Message::Tstat { fid: 3 });
    let (replies, result) = script.run(&server);
    result.unwrap();

    let Message::Rwalk { ref wqids } = replies[2].body else {
        panic!("expected Rwalk, got {:?}", replies[2].body);
    };
    assert_eq!(wqids.len(), 1);
    assert!(matches!(replies[3].body, Message::Rerror { .. }));
}

#[test]
fn test_walk_first_step_failure_is_error() {
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 3, &["nope"]))
        .push(3, Message::Tstat { fid: 3 });
    let (replies, result) = script.run(&server);
    result.unwrap();

    assert!(matches!(replies[2].body, Message::Rerror { .. }));
    assert!(matches!(replies[3].body, Message::Rerror { .. }));
}

#[test]
fn test_walk_newfid_collision() {
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 2, &[])) // clone to 2
        .push(3, walk(1, 2, &["disk"])) // 2 already in use
        .push(4, walk(1, 1, &["disk"])); // newfid == fid replaces fid
    let (replies, result) = script.run(&server);
    result.unwrap();

    assert_eq!(replies[2].body, Message::Rwalk { wqids: vec![] });
    assert!(matches!(replies[3].body, Message::Rerror { .. }));
    assert!(matches!(replies[4].body, Message::Rwalk { .. }));
}

#[test]
fn test_clunk_destroys_fid() {
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, Message::Tclunk { fid: 1 })
        .push(3, Message::Tclunk { fid: 1 });
    let (replies, result) = script.run(&server);
    result.unwrap();

    assert_eq!(replies[2].body, Message::Rclunk);
    assert!(matches!(replies[3].body, Message::Rerror { .. }));
}

#[test]
fn test_remove_fails_but_fid_dies() {
    // Device files cannot be removed; the fid is gone regardless.
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 2, &["disk", "0", "ctl"]))
        .push(3, Message::Tremove { fid: 2 })
        .push(4, Message::Tstat { fid: 2 });
    let (replies, result) = script.run(&server);
    result.unwrap();

    assert!(matches!(replies[3].body, Message::Rerror { .. }));
    assert!(matches!(replies[4].body, Message::Rerror { .. }));
}

#[test]
fn test_fid_isolation_between_connections() {
    // Two sessions on one driver: each gets its own fid namespace.
    let server = block_server();

    let mut first = Script::new();
    first
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 1, &["disk", "0", "data"]));
    let (replies, result) = first.run(&server);
    result.unwrap();
    assert!(matches!(replies[2].body, Message::Rwalk { .. }));

    // The second connection's fid 1 is fresh: attach succeeds and the fid
    // still points at the root, not at disk/0/data.
    let mut second = Script::new();
    second
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, Message::Tstat { fid: 1 });
    let (replies, result) = second.run(&server);
    result.unwrap();

    assert!(matches!(replies[1].body, Message::Rattach { .. }));
    let Message::Rstat { ref stat } = replies[2].body else {
        panic!("expected Rstat, got {:?}", replies[2].body);
    };
    assert_eq!(stat.name, "blk0");
}

#[test]
fn test_qid_path_stable_across_connections() {
    let server = block_server();
    let stat_once = || {
        let mut script = Script::new();
        script
            .push(NOTAG, tversion(8192, "9P2000"))
            .push(1, tattach(1))
            .push(2, walk(1, 2, &["disk", "0", "data"]))
            .push(3, Message::Tstat { fid: 2 });
        let (replies, result) = script.run(&server);
        result.unwrap();
        match &replies[3].body {
            Message::Rstat { stat } => stat.qid.path,
            other => panic!("expected Rstat, got {:?}", other),
        }
    };
    assert_eq!(stat_once(), stat_once());
}

#[test]
fn test_undersized_msize_is_fatal() {
    let server = block_server();
    let mut script = Script::new();
    script.push(NOTAG, tversion(6, "9P2000"));
    let (replies, result) = script.run(&server);
    assert!(matches!(result, Err(DriverError::Protocol(_))));
    assert!(replies.is_empty());
}

#[test]
fn test_oversized_message_is_fatal() {
    // Negotiate a small msize, then send a frame that exceeds it.
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(64, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 2, &["disk", "0", "data"]))
        .push(3, Message::Topen { fid: 2, mode: ORDWR })
        .push(4, Message::Twrite { fid: 2, offset: 0, data: vec![0u8; 100] });
    let (replies, result) = script.run(&server);
    assert!(matches!(result, Err(DriverError::Protocol(_))));
    // Everything before the oversized frame was answered.
    assert_eq!(replies.len(), 4);
}

#[test]
fn test_unknown_message_type_gets_rerror() {
    let server = block_server();
    // Hand-build a Tauth frame: size[4] type[1] tag[2] fid[4].
    let mut bytes = Vec::new();
    bytes.extend(encode(&Fcall::new(NOTAG, tversion(8192, "9P2000"))).unwrap());
    let mut auth = Vec::new();
    auth.extend_from_slice(&11u32.to_le_bytes());
    auth.push(102); // Tauth
    auth.extend_from_slice(&7u16.to_le_bytes());
    auth.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend(auth);

    let script = Script { bytes };
    let (replies, result) = script.run(&server);
    result.unwrap();
    assert_eq!(
        replies[1].body,
        Message::Rerror { ename: "unknown message type".into() }
    );
    assert_eq!(replies[1].tag, 7);
}

#[test]
fn test_mid_span_write_failure_is_rerror() {
    // A two-sector write whose second sector write fails on the device
    // answers Rerror, never a partial-success Rwrite.
    let server = block_server_with(Arc::new(FailingDisk::new(MemoryDisk::new(1, 64), 2)));
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 2, &["disk", "0", "data"]))
        .push(3, Message::Topen { fid: 2, mode: ORDWR })
        .push(4, Message::Twrite { fid: 2, offset: 508, data: (1..=10).collect() });
    let (replies, result) = script.run(&server);
    result.unwrap();

    let Message::Rerror { ref ename } = replies[4].body else {
        panic!("expected Rerror, got {:?}", replies[4].body);
    };
    assert!(ename.contains("backend error"));
}

#[test]
fn test_read_requires_open() {
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 2, &["disk", "0", "data"]))
        .push(3, Message::Tread { fid: 2, offset: 0, count: 16 });
    let (replies, result) = script.run(&server);
    result.unwrap();
    assert!(matches!(replies[3].body, Message::Rerror { .. }));
}

#[test]
fn test_ctl_roundtrip_over_protocol() {
    let server = block_server();
    let mut script = Script::new();
    script
        .push(NOTAG, tversion(8192, "9P2000"))
        .push(1, tattach(1))
        .push(2, walk(1, 2, &["disk", "0", "ctl"]))
        .push(3, Message::Topen { fid: 2, mode: ORDWR })
        .push(4, Message::Tread { fid: 2, offset: 0, count: 256 })
        .push(5, Message::Twrite { fid: 2, offset: 0, data: b"flush\n".to_vec() })
        .push(6, Message::Twrite { fid: 2, offset: 0, data: b"eject\n".to_vec() });
    let (replies, result) = script.run(&server);
    result.unwrap();

    let Message::Rread { ref data } = replies[4].body else {
        panic!("expected Rread, got {:?}", replies[4].body);
    };
    let text = String::from_utf8(data.clone()).unwrap();
    assert!(text.contains("device sd0"));
    assert!(text.contains("sector_size 512"));

    assert_eq!(replies[5].body, Message::Rwrite { count: 6 });
    assert!(matches!(replies[6].body, Message::Rerror { .. }));
}
