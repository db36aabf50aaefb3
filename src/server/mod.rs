//! 9P2000 server loop and file-server contract
//!
//! [`Server`] pumps a single connection: read one message, dispatch through
//! the [`FileServer`] contract, write exactly one reply with the same tag.
//! Multiple connections may serve the same [`FileServer`] concurrently from
//! separate threads; implementations must be safe for that.

pub mod qid;
pub mod session;

use std::cmp::min;
use std::io::{Read, Write};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{DriverError, DriverResult};
use crate::proto::codec;
use crate::proto::{Fcall, Message, Qid, Stat, IOHDR_SIZE, MIN_MSG_SIZE, NOFID, ORDWR, OWRITE};

pub use qid::QidRegistry;
pub use session::{Fid, Session};

/// Default server-side msize ceiling.
pub const DEFAULT_MAX_MSIZE: u32 = 8192;

/// Protocol version this server speaks.
pub const VERSION_9P2000: &str = "9P2000";

/// The contract the 9P server calls for each operation.
///
/// Paths are relative to the server root; the root is the empty string.
/// The server owns all fid bookkeeping, so implementations deal only in
/// paths, the way the fabric drivers are written.
pub trait FileServer: Send + Sync {
    /// Negotiate the protocol version. `msize` has already been capped to
    /// the server ceiling. Returning [`DriverError::Version`] makes the
    /// server reply `Rversion("unknown")` and reset the session.
    fn version(&self, msize: u32, version: &str) -> DriverResult<(u32, String)> {
        if version != VERSION_9P2000 {
            return Err(DriverError::Version(version.to_string()));
        }
        Ok((msize, VERSION_9P2000.to_string()))
    }

    /// Establish the connection root. The auth fid is accepted by the
    /// server but never exercised.
    fn attach(&self, uname: &str, aname: &str) -> DriverResult<Qid>;

    /// Resolve one path element, returning the child path and its qid.
    fn walk(&self, path: &str, name: &str) -> DriverResult<(String, Qid)>;

    fn open(&self, path: &str, mode: u8) -> DriverResult<(Qid, u32)>;

    /// Create a file under `path`, returning the new path, qid and iounit.
    fn create(&self, path: &str, name: &str, perm: u32, mode: u8)
        -> DriverResult<(String, Qid, u32)>;

    fn read(&self, path: &str, offset: u64, count: u32) -> DriverResult<Vec<u8>>;

    fn write(&self, path: &str, offset: u64, data: &[u8]) -> DriverResult<u32>;

    /// Stat entries for every child of a directory; the server turns them
    /// into directory-read content.
    fn readdir(&self, path: &str) -> DriverResult<Vec<Stat>>;

    fn stat(&self, path: &str) -> DriverResult<Stat>;

    fn wstat(&self, path: &str, stat: &Stat) -> DriverResult<()>;

    fn remove(&self, path: &str) -> DriverResult<()>;

    /// Called when a fid is clunked. Failures are logged, never surfaced:
    /// clunk always succeeds at the protocol level.
    fn clunk(&self, _path: &str) -> DriverResult<()> {
        Ok(())
    }
}

/// Single-connection 9P2000 request-reply pump.
pub struct Server {
    fs: Arc<dyn FileServer>,
    max_msize: u32,
}

impl Server {
    pub fn new(fs: Arc<dyn FileServer>) -> Self {
        Self { fs, max_msize: DEFAULT_MAX_MSIZE }
    }

    pub fn with_max_msize(fs: Arc<dyn FileServer>, max_msize: u32) -> Self {
        Self { fs, max_msize: max_msize.max(MIN_MSG_SIZE) }
    }

    /// Serve one connection until end-of-stream or a fatal protocol error.
    pub fn serve<T: Read + Write>(&self, conn: &mut T) -> DriverResult<()> {
        let mut session = Session::new(self.max_msize);
        loop {
            let frame = match codec::read_frame(conn, session.msize())? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            let fc = codec::decode(&frame)?;
            let tag = fc.tag;

            let reply = match self.dispatch(&mut session, fc) {
                Ok(body) => Fcall::new(tag, body),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!("request tag {} failed: {}", tag, err);
                    Fcall::new(tag, Message::Rerror { ename: err.ename() })
                }
            };

            let bytes = codec::encode(&reply)?;
            conn.write_all(&bytes)?;
        }
    }

    fn dispatch(&self, session: &mut Session, fc: Fcall) -> DriverResult<Message> {
        if !session.negotiated() && !matches!(fc.body, Message::Tversion { .. }) {
            return Ok(Message::Rerror { ename: "version not negotiated".into() });
        }

        match fc.body {
            Message::Tversion { msize, version } => self.version(session, msize, &version),

            Message::Tattach { fid, afid: _afid, uname, aname } => {
                if fid == NOFID || session.contains(fid) {
                    return Err(DriverError::FidInUse(fid));
                }
                let qid = self.fs.attach(&uname, &aname)?;
                session.insert(fid, Fid::new(String::new(), qid))?;
                Ok(Message::Rattach { qid })
            }

            Message::Twalk { fid, newfid, wnames } => self.walk(session, fid, newfid, &wnames),

            Message::Topen { fid, mode } => {
                let f = session.get(fid)?;
                if f.open_mode.is_some() {
                    return Ok(Message::Rerror { ename: "fid already open".into() });
                }
                let path = f.path.clone();
                let (qid, iounit) = self.fs.open(&path, mode)?;
                session.set_open(fid, path, qid, mode)?;
                Ok(Message::Ropen { qid, iounit })
            }

            Message::Tcreate { fid, name, perm, mode } => {
                let f = session.get(fid)?;
                if !f.qid.is_dir() {
                    return Ok(Message::Rerror { ename: "create in non-directory".into() });
                }
                let dir = f.path.clone();
                let (path, qid, iounit) = self.fs.create(&dir, &name, perm, mode)?;
                session.set_open(fid, path, qid, mode)?;
                Ok(Message::Rcreate { qid, iounit })
            }

            Message::Tread { fid, offset, count } => {
                let f = session.get(fid)?;
                if !readable(f.open_mode) {
                    return Ok(Message::Rerror { ename: "fid not open for reading".into() });
                }
                let count = min(count, session.msize().saturating_sub(IOHDR_SIZE));
                let data = if f.qid.is_dir() {
                    self.read_dir(&f.path, offset, count)?
                } else {
                    let mut data = self.fs.read(&f.path, offset, count)?;
                    data.truncate(count as usize);
                    data
                };
                Ok(Message::Rread { data })
            }

            Message::Twrite { fid, offset, data } => {
                let f = session.get(fid)?;
                if !writable(f.open_mode) {
                    return Ok(Message::Rerror { ename: "fid not open for writing".into() });
                }
                if f.qid.is_dir() {
                    return Ok(Message::Rerror { ename: "cannot write to directory".into() });
                }
                let count = self.fs.write(&f.path, offset, &data)?;
                Ok(Message::Rwrite { count })
            }

            Message::Tclunk { fid } => {
                // The fid dies even if the close fails.
                let f = session.remove(fid)?;
                if let Err(err) = self.fs.clunk(&f.path) {
                    warn!("clunk of {:?} failed: {}", f.path, err);
                }
                Ok(Message::Rclunk)
            }

            Message::Tremove { fid } => {
                // Remove destroys the fid first, then attempts removal.
                let f = session.remove(fid)?;
                self.fs.remove(&f.path)?;
                Ok(Message::Rremove)
            }

            Message::Tstat { fid } => {
                let f = session.get(fid)?;
                let stat = self.fs.stat(&f.path)?;
                Ok(Message::Rstat { stat })
            }

            Message::Twstat { fid, stat } => {
                let f = session.get(fid)?;
                self.fs.wstat(&f.path, &stat)?;
                Ok(Message::Rwstat)
            }

            Message::Unknown { msg_type } => {
                debug!("unknown message type {}", msg_type);
                Ok(Message::Rerror { ename: "unknown message type".into() })
            }

            // R-messages arriving at a server are client bugs.
            _ => Ok(Message::Rerror { ename: "unknown message type".into() }),
        }
    }

    fn version(&self, session: &mut Session, msize: u32, version: &str) -> DriverResult<Message> {
        if msize < MIN_MSG_SIZE {
            return Err(DriverError::Protocol(format!("msize {} below minimum", msize)));
        }
        session.reset();
        let capped = min(msize, self.max_msize);
        match self.fs.version(capped, version) {
            Ok((negotiated, reply)) => {
                session.negotiate(negotiated);
                Ok(Message::Rversion { msize: negotiated, version: reply })
            }
            Err(DriverError::Version(_)) => {
                Ok(Message::Rversion { msize, version: "unknown".into() })
            }
            Err(err) => Err(err),
        }
    }

    fn walk(
        &self,
        session: &mut Session,
        fid: u32,
        newfid: u32,
        wnames: &[String],
    ) -> DriverResult<Message> {
        let (start_path, start_qid) = {
            let f = session.get(fid)?;
            (f.path.clone(), f.qid)
        };
        if newfid != fid && session.contains(newfid) {
            return Err(DriverError::FidInUse(newfid));
        }

        // Zero-length walk: clone the fid without touching the file.
        if wnames.is_empty() {
            session.rebind(newfid, Fid::new(start_path, start_qid));
            return Ok(Message::Rwalk { wqids: Vec::new() });
        }

        let mut path = start_path;
        let mut qid = start_qid;
        let mut wqids = Vec::with_capacity(wnames.len());
        for name in wnames {
            match self.fs.walk(&path, name) {
                Ok((next, next_qid)) => {
                    path = next;
                    qid = next_qid;
                    wqids.push(next_qid);
                }
                Err(err) => {
                    if wqids.is_empty() {
                        // First step failed: error reply, nothing bound.
                        return Err(err);
                    }
                    // Partial success: report what resolved, do not bind.
                    return Ok(Message::Rwalk { wqids });
                }
            }
        }

        // Total success: bind the terminal file to newfid exactly once.
        session.rebind(newfid, Fid::new(path, qid));
        Ok(Message::Rwalk { wqids })
    }

    /// Directory content: concatenated length-prefixed stat entries,
    /// sliced at the byte offset the client asked for.
    fn read_dir(&self, path: &str, offset: u64, count: u32) -> DriverResult<Vec<u8>> {
        let mut listing = Vec::new();
        for st in self.fs.readdir(path)? {
            let blob = codec::encode_stat(&st);
            listing.extend_from_slice(&(blob.len() as u16).to_le_bytes());
            listing.extend_from_slice(&blob);
        }
        let start = min(offset as usize, listing.len());
        let end = min(start + count as usize, listing.len());
        Ok(listing[start..end].to_vec())
    }
}

fn readable(mode: Option<u8>) -> bool {
    // OREAD, ORDWR and OEXEC may read; OWRITE may not.
    matches!(mode.map(|m| m & 3), Some(0) | Some(2) | Some(3))
}

fn writable(mode: Option<u8>) -> bool {
    matches!(mode.map(|m| m & 3), Some(m) if m == OWRITE & 3 || m == ORDWR & 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_classes() {
        use crate::proto::{OEXEC, OREAD, OTRUNC};
        assert!(readable(Some(OREAD)));
        assert!(readable(Some(ORDWR)));
        assert!(readable(Some(OEXEC)));
        assert!(!readable(Some(OWRITE)));
        assert!(!readable(None));

        assert!(writable(Some(OWRITE)));
        assert!(writable(Some(ORDWR | OTRUNC)));
        assert!(!writable(Some(OREAD)));
        assert!(!writable(None));
    }
}
