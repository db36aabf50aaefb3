//! 9P2000 wire codec
//!
//! Stateless encode/decode between [`Fcall`] values and little-endian
//! frames. Anything malformed (short buffers, strings past the end, counts
//! that disagree with the frame) is a [`DriverError::Protocol`], which the
//! server treats as fatal for the connection.

use std::io::{self, Read};

use crate::error::{DriverError, DriverResult};
use super::*;

// ============================================================================
// Frame builder
// ============================================================================

/// Encoder with the 4-byte size prefix patched in at the end.
struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    fn new(msg_type: u8, tag: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(msg_type);
        buf.extend_from_slice(&tag.to_le_bytes());
        Self { buf }
    }

    fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn push_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_str(&mut self, value: &str) -> DriverResult<()> {
        if value.len() > u16::MAX as usize {
            return Err(DriverError::Protocol("string too long".into()));
        }
        self.push_u16(value.len() as u16);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn push_qid(&mut self, qid: &Qid) {
        self.push_u8(qid.qtype);
        self.push_u32(qid.version);
        self.push_u64(qid.path);
    }

    fn finish(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&size.to_le_bytes());
        self.buf
    }
}

// ============================================================================
// Cursor readers
// ============================================================================

fn short() -> DriverError {
    DriverError::Protocol("short buffer".into())
}

fn read_u8(buf: &[u8], off: &mut usize) -> DriverResult<u8> {
    let value = *buf.get(*off).ok_or_else(short)?;
    *off += 1;
    Ok(value)
}

fn read_u16(buf: &[u8], off: &mut usize) -> DriverResult<u16> {
    if *off + 2 > buf.len() {
        return Err(short());
    }
    let value = u16::from_le_bytes([buf[*off], buf[*off + 1]]);
    *off += 2;
    Ok(value)
}

fn read_u32(buf: &[u8], off: &mut usize) -> DriverResult<u32> {
    if *off + 4 > buf.len() {
        return Err(short());
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[*off..*off + 4]);
    *off += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(buf: &[u8], off: &mut usize) -> DriverResult<u64> {
    if *off + 8 > buf.len() {
        return Err(short());
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[*off..*off + 8]);
    *off += 8;
    Ok(u64::from_le_bytes(bytes))
}

fn read_str(buf: &[u8], off: &mut usize) -> DriverResult<String> {
    let len = read_u16(buf, off)? as usize;
    if *off + len > buf.len() {
        return Err(short());
    }
    let value = std::str::from_utf8(&buf[*off..*off + len])
        .map_err(|_| DriverError::Protocol("invalid utf8 in string".into()))?;
    *off += len;
    Ok(value.to_string())
}

fn read_qid(buf: &[u8], off: &mut usize) -> DriverResult<Qid> {
    Ok(Qid {
        qtype: read_u8(buf, off)?,
        version: read_u32(buf, off)?,
        path: read_u64(buf, off)?,
    })
}

// ============================================================================
// Stat codec
// ============================================================================

/// Encode a stat blob: fields only, no outer length prefix. Rstat and
/// directory reads prepend their own u16 length.
pub fn encode_stat(st: &Stat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(49 + st.name.len() + st.uid.len() + st.gid.len() + st.muid.len());
    buf.extend_from_slice(&st.stype.to_le_bytes());
    buf.extend_from_slice(&st.dev.to_le_bytes());
    buf.push(st.qid.qtype);
    buf.extend_from_slice(&st.qid.version.to_le_bytes());
    buf.extend_from_slice(&st.qid.path.to_le_bytes());
    buf.extend_from_slice(&st.mode.to_le_bytes());
    buf.extend_from_slice(&st.atime.to_le_bytes());
    buf.extend_from_slice(&st.mtime.to_le_bytes());
    buf.extend_from_slice(&st.length.to_le_bytes());
    for s in [&st.name, &st.uid, &st.gid, &st.muid] {
        buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }
    buf
}

/// Decode a stat blob produced by [`encode_stat`].
pub fn decode_stat(buf: &[u8], off: &mut usize) -> DriverResult<Stat> {
    Ok(Stat {
        stype: read_u16(buf, off)?,
        dev: read_u32(buf, off)?,
        qid: read_qid(buf, off)?,
        mode: read_u32(buf, off)?,
        atime: read_u32(buf, off)?,
        mtime: read_u32(buf, off)?,
        length: read_u64(buf, off)?,
        name: read_str(buf, off)?,
        uid: read_str(buf, off)?,
        gid: read_str(buf, off)?,
        muid: read_str(buf, off)?,
    })
}

// ============================================================================
// Frame I/O
// ============================================================================

/// Read one framed message from the transport.
///
/// Returns `Ok(None)` on clean end-of-stream before the size prefix. A size
/// below [`MIN_MSG_SIZE`] or above `max_size` is a protocol error.
pub fn read_frame(r: &mut impl Read, max_size: u32) -> DriverResult<Option<Vec<u8>>> {
    let mut size_bytes = [0u8; 4];
    match r.read_exact(&mut size_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let size = u32::from_le_bytes(size_bytes);
    if size < MIN_MSG_SIZE || size > max_size {
        return Err(DriverError::Protocol(format!("invalid message size: {}", size)));
    }

    let mut frame = vec![0u8; size as usize];
    frame[0..4].copy_from_slice(&size_bytes);
    r.read_exact(&mut frame[4..])
        .map_err(|err| DriverError::Protocol(format!("truncated message: {}", err)))?;
    Ok(Some(frame))
}

// ============================================================================
// Decode
// ============================================================================

/// Decode a complete frame (including the size prefix) into an [`Fcall`].
pub fn decode(frame: &[u8]) -> DriverResult<Fcall> {
    let mut off = 0usize;
    let size = read_u32(frame, &mut off)?;
    if size as usize != frame.len() || size < MIN_MSG_SIZE {
        return Err(DriverError::Protocol("frame size mismatch".into()));
    }
    let msg_type = read_u8(frame, &mut off)?;
    let tag = read_u16(frame, &mut off)?;

    let body = match msg_type {
        TVERSION | RVERSION => {
            let msize = read_u32(frame, &mut off)?;
            let version = read_str(frame, &mut off)?;
            if msg_type == TVERSION {
                Message::Tversion { msize, version }
            } else {
                Message::Rversion { msize, version }
            }
        }
        TATTACH => Message::Tattach {
            fid: read_u32(frame, &mut off)?,
            afid: read_u32(frame, &mut off)?,
            uname: read_str(frame, &mut off)?,
            aname: read_str(frame, &mut off)?,
        },
        RATTACH => Message::Rattach { qid: read_qid(frame, &mut off)? },
        RERROR => Message::Rerror { ename: read_str(frame, &mut off)? },
        TWALK => {
            let fid = read_u32(frame, &mut off)?;
            let newfid = read_u32(frame, &mut off)?;
            let nwname = read_u16(frame, &mut off)?;
            let mut wnames = Vec::with_capacity(nwname as usize);
            for _ in 0..nwname {
                wnames.push(read_str(frame, &mut off)?);
            }
            Message::Twalk { fid, newfid, wnames }
        }
        RWALK => {
            let nwqid = read_u16(frame, &mut off)?;
            let mut wqids = Vec::with_capacity(nwqid as usize);
            for _ in 0..nwqid {
                wqids.push(read_qid(frame, &mut off)?);
            }
            Message::Rwalk { wqids }
        }
        TOPEN => Message::Topen {
            fid: read_u32(frame, &mut off)?,
            mode: read_u8(frame, &mut off)?,
        },
        ROPEN | RCREATE => {
            let qid = read_qid(frame, &mut off)?;
            let iounit = read_u32(frame, &mut off)?;
            if msg_type == ROPEN {
                Message::Ropen { qid, iounit }
            } else {
                Message::Rcreate { qid, iounit }
            }
        }
        TCREATE => Message::Tcreate {
            fid: read_u32(frame, &mut off)?,
            name: read_str(frame, &mut off)?,
            perm: read_u32(frame, &mut off)?,
            mode: read_u8(frame, &mut off)?,
        },
        TREAD => Message::Tread {
            fid: read_u32(frame, &mut off)?,
            offset: read_u64(frame, &mut off)?,
            count: read_u32(frame, &mut off)?,
        },
        RREAD => {
            let count = read_u32(frame, &mut off)? as usize;
            if off + count > frame.len() {
                return Err(DriverError::Protocol("read count exceeds frame".into()));
            }
            let data = frame[off..off + count].to_vec();
            off += count;
            Message::Rread { data }
        }
        TWRITE => {
            let fid = read_u32(frame, &mut off)?;
            let offset = read_u64(frame, &mut off)?;
            let count = read_u32(frame, &mut off)? as usize;
            if off + count > frame.len() {
                return Err(DriverError::Protocol("write count exceeds frame".into()));
            }
            let data = frame[off..off + count].to_vec();
            off += count;
            Message::Twrite { fid, offset, data }
        }
        RWRITE => Message::Rwrite { count: read_u32(frame, &mut off)? },
        TCLUNK => Message::Tclunk { fid: read_u32(frame, &mut off)? },
        RCLUNK => Message::Rclunk,
        TREMOVE => Message::Tremove { fid: read_u32(frame, &mut off)? },
        RREMOVE => Message::Rremove,
        TSTAT => Message::Tstat { fid: read_u32(frame, &mut off)? },
        RSTAT => {
            let statsz = read_u16(frame, &mut off)? as usize;
            if off + statsz > frame.len() {
                return Err(DriverError::Protocol("stat size exceeds frame".into()));
            }
            let stat = decode_stat(frame, &mut off)?;
            Message::Rstat { stat }
        }
        TWSTAT => {
            let fid = read_u32(frame, &mut off)?;
            let statsz = read_u16(frame, &mut off)? as usize;
            if off + statsz > frame.len() {
                return Err(DriverError::Protocol("stat size exceeds frame".into()));
            }
            let stat = decode_stat(frame, &mut off)?;
            Message::Twstat { fid, stat }
        }
        RWSTAT => Message::Rwstat,
        other => {
            // Unsupported type (Tauth, Tflush, ...): body is ignored, the
            // tag survives so the reply can be an Rerror.
            off = frame.len();
            Message::Unknown { msg_type: other }
        }
    };

    if off != frame.len() {
        return Err(DriverError::Protocol("trailing bytes in frame".into()));
    }
    Ok(Fcall { tag, body })
}

// ============================================================================
// Encode
// ============================================================================

/// Encode an [`Fcall`] into a complete frame including the size prefix.
pub fn encode(fc: &Fcall) -> DriverResult<Vec<u8>> {
    let mut f = Frame::new(fc.body.msg_type(), fc.tag);
    match &fc.body {
        Message::Tversion { msize, version } | Message::Rversion { msize, version } => {
            f.push_u32(*msize);
            f.push_str(version)?;
        }
        Message::Tattach { fid, afid, uname, aname } => {
            f.push_u32(*fid);
            f.push_u32(*afid);
            f.push_str(uname)?;
            f.push_str(aname)?;
        }
        Message::Rattach { qid } => f.push_qid(qid),
        Message::Rerror { ename } => f.push_str(ename)?,
        Message::Twalk { fid, newfid, wnames } => {
            f.push_u32(*fid);
            f.push_u32(*newfid);
            f.push_u16(wnames.len() as u16);
            for name in wnames {
                f.push_str(name)?;
            }
        }
        Message::Rwalk { wqids } => {
            f.push_u16(wqids.len() as u16);
            for qid in wqids {
                f.push_qid(qid);
            }
        }
        Message::Topen { fid, mode } => {
            f.push_u32(*fid);
            f.push_u8(*mode);
        }
        Message::Ropen { qid, iounit } | Message::Rcreate { qid, iounit } => {
            f.push_qid(qid);
            f.push_u32(*iounit);
        }
        Message::Tcreate { fid, name, perm, mode } => {
            f.push_u32(*fid);
            f.push_str(name)?;
            f.push_u32(*perm);
            f.push_u8(*mode);
        }
        Message::Tread { fid, offset, count } => {
            f.push_u32(*fid);
            f.push_u64(*offset);
            f.push_u32(*count);
        }
        Message::Rread { data } => {
            f.push_u32(data.len() as u32);
            f.push_bytes(data);
        }
        Message::Twrite { fid, offset, data } => {
            f.push_u32(*fid);
            f.push_u64(*offset);
            f.push_u32(data.len() as u32);
            f.push_bytes(data);
        }
        Message::Rwrite { count } => f.push_u32(*count),
        Message::Tclunk { fid } | Message::Tremove { fid } | Message::Tstat { fid } => {
            f.push_u32(*fid);
        }
        Message::Rclunk | Message::Rremove | Message::Rwstat => {}
        Message::Rstat { stat } => {
            let blob = encode_stat(stat);
            f.push_u16(blob.len() as u16);
            f.push_bytes(&blob);
        }
        Message::Twstat { fid, stat } => {
            f.push_u32(*fid);
            let blob = encode_stat(stat);
            f.push_u16(blob.len() as u16);
            f.push_bytes(&blob);
        }
        Message::Unknown { msg_type } => {
            return Err(DriverError::Protocol(format!(
                "cannot encode unknown message type {}",
                msg_type
            )));
        }
    }
    Ok(f.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(fc: Fcall) {
        let bytes = encode(&fc).expect("encode");
        let back = decode(&bytes).expect("decode");
        assert_eq!(fc, back);
    }

    fn sample_qid() -> Qid {
        Qid { qtype: QTDIR, version: 3, path: 0xDEAD_BEEF_CAFE }
    }

    fn sample_stat() -> Stat {
        Stat {
            stype: 0,
            dev: 1,
            qid: sample_qid(),
            mode: DMDIR | 0o755,
            atime: 1_700_000_000,
            mtime: 1_700_000_001,
            length: 0,
            name: "disk".into(),
            uid: "sys".into(),
            gid: "sys".into(),
            muid: "sys".into(),
        }
    }

    #[test]
    fn test_roundtrip_every_message_type() {
        let cases = vec![
            Message::Tversion { msize: 8192, version: "9P2000".into() },
            Message::Rversion { msize: 8192, version: "9P2000".into() },
            Message::Tattach { fid: 1, afid: NOFID, uname: "user".into(), aname: "".into() },
            Message::Rattach { qid: sample_qid() },
            Message::Rerror { ename: "not found: disk/9".into() },
            Message::Twalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["disk".into(), "0".into(), "data".into()],
            },
            Message::Twalk { fid: 1, newfid: 1, wnames: vec![] },
            Message::Rwalk { wqids: vec![sample_qid(), Qid::file(9, 0)] },
            Message::Rwalk { wqids: vec![] },
            Message::Topen { fid: 2, mode: ORDWR | OTRUNC },
            Message::Ropen { qid: Qid::file(7, 1), iounit: 0 },
            Message::Tcreate { fid: 2, name: "scratch".into(), perm: 0o644, mode: OWRITE },
            Message::Rcreate { qid: Qid::file(8, 0), iounit: 4096 },
            Message::Tread { fid: 2, offset: u64::MAX - 1, count: 512 },
            Message::Rread { data: vec![0xAB; 512] },
            Message::Rread { data: vec![] },
            Message::Twrite { fid: 2, offset: 508, data: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10] },
            Message::Rwrite { count: 10 },
            Message::Tclunk { fid: 2 },
            Message::Rclunk,
            Message::Tremove { fid: 3 },
            Message::Rremove,
            Message::Tstat { fid: 1 },
            Message::Rstat { stat: sample_stat() },
            Message::Twstat { fid: 1, stat: sample_stat() },
            Message::Rwstat,
        ];
        for (i, body) in cases.into_iter().enumerate() {
            roundtrip(Fcall::new(i as u16, body));
        }
    }

    #[test]
    fn test_roundtrip_empty_strings_and_extremes() {
        roundtrip(Fcall::new(NOTAG, Message::Tversion { msize: 7, version: "".into() }));
        roundtrip(Fcall::new(0, Message::Twrite { fid: u32::MAX - 1, offset: 0, data: vec![] }));
        roundtrip(Fcall::new(0xFFFE, Message::Rerror { ename: "x".repeat(200) }));
    }

    #[test]
    fn test_decode_rejects_size_mismatch() {
        let mut bytes = encode(&Fcall::new(0, Message::Rclunk)).unwrap();
        bytes[0] = bytes[0].wrapping_add(1);
        assert!(matches!(decode(&bytes), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_string_past_end() {
        // Tversion with a string length claiming more bytes than the frame has.
        let mut f = Frame::new(TVERSION, 0);
        f.push_u32(8192);
        f.push_u16(50); // string length, but no bytes follow
        let bytes = f.finish();
        assert!(matches!(decode(&bytes), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_write_count_past_end() {
        let mut f = Frame::new(TWRITE, 0);
        f.push_u32(1);
        f.push_u64(0);
        f.push_u32(100); // count, but only 2 data bytes present
        f.push_bytes(&[1, 2]);
        let bytes = f.finish();
        assert!(matches!(decode(&bytes), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut f = Frame::new(TCLUNK, 0);
        f.push_u32(1);
        f.push_u32(99); // stray extra field
        let bytes = f.finish();
        assert!(matches!(decode(&bytes), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_unknown_type_keeps_tag() {
        let mut f = Frame::new(TAUTH, 0x1234);
        f.push_u32(1);
        let fc = decode(&f.finish()).unwrap();
        assert_eq!(fc.tag, 0x1234);
        assert_eq!(fc.body, Message::Unknown { msg_type: TAUTH });
    }

    #[test]
    fn test_read_frame_rejects_undersized_and_oversized() {
        let mut small = io::Cursor::new(3u32.to_le_bytes().to_vec());
        assert!(matches!(read_frame(&mut small, 8192), Err(DriverError::Protocol(_))));

        let mut big = io::Cursor::new(90_000u32.to_le_bytes().to_vec());
        assert!(matches!(read_frame(&mut big, 8192), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_read_frame_clean_eof() {
        let mut empty = io::Cursor::new(Vec::new());
        assert_eq!(read_frame(&mut empty, 8192).unwrap(), None);
    }

    #[test]
    fn test_qid_13_bytes_on_wire() {
        let bytes = encode(&Fcall::new(0, Message::Rattach { qid: sample_qid() })).unwrap();
        // size[4] type[1] tag[2] qid[13]
        assert_eq!(bytes.len(), 20);
        assert_eq!(bytes[7], QTDIR);
    }
}
