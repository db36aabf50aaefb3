//! Per-connection session state
//!
//! One [`Session`] per 9P connection: the negotiated msize and the fid
//! table. The server processes one request at a time per connection, so
//! none of this needs locking.

use std::collections::HashMap;

use crate::error::{DriverError, DriverResult};
use crate::proto::Qid;

/// Server-side state bound to one client-chosen fid number.
#[derive(Debug, Clone)]
pub struct Fid {
    /// Path this fid currently resolves to, relative to the driver root.
    /// The root itself is the empty string.
    pub path: String,
    pub qid: Qid,
    /// Set by open/create; cleared whenever the fid is rebound.
    pub open_mode: Option<u8>,
}

impl Fid {
    pub fn new(path: String, qid: Qid) -> Self {
        Self { path, qid, open_mode: None }
    }
}

/// Per-connection fid namespace plus the msize negotiation result.
pub struct Session {
    max_msize: u32,
    msize: u32,
    negotiated: bool,
    fids: HashMap<u32, Fid>,
}

impl Session {
    pub fn new(max_msize: u32) -> Self {
        Self {
            max_msize,
            msize: max_msize,
            negotiated: false,
            fids: HashMap::new(),
        }
    }

    /// Current frame-size limit. Before negotiation this is the server
    /// maximum; after Tversion it is the negotiated value.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub fn negotiated(&self) -> bool {
        self.negotiated
    }

    /// Fix the msize after a successful Tversion. Clears all fids.
    pub fn negotiate(&mut self, msize: u32) {
        self.msize = msize;
        self.negotiated = true;
        self.fids.clear();
    }

    /// Drop back to the pre-version state (unsupported version string).
    pub fn reset(&mut self) {
        self.msize = self.max_msize;
        self.negotiated = false;
        self.fids.clear();
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.fids.contains_key(&fid)
    }

    pub fn get(&self, fid: u32) -> DriverResult<&Fid> {
        self.fids.get(&fid).ok_or(DriverError::NoSuchFid(fid))
    }

    /// Bind a fid that must not already exist.
    pub fn insert(&mut self, num: u32, fid: Fid) -> DriverResult<()> {
        if self.fids.contains_key(&num) {
            return Err(DriverError::FidInUse(num));
        }
        self.fids.insert(num, fid);
        Ok(())
    }

    /// Bind a fid, replacing any existing entry (walk with newfid == fid).
    pub fn rebind(&mut self, num: u32, fid: Fid) {
        self.fids.insert(num, fid);
    }

    /// Mark a fid as opened with the given mode.
    pub fn set_open(&mut self, num: u32, path: String, qid: Qid, mode: u8) -> DriverResult<()> {
        let fid = self.fids.get_mut(&num).ok_or(DriverError::NoSuchFid(num))?;
        fid.path = path;
        fid.qid = qid;
        fid.open_mode = Some(mode);
        Ok(())
    }

    /// Remove and return a fid (clunk/remove).
    pub fn remove(&mut self, fid: u32) -> DriverResult<Fid> {
        self.fids.remove(&fid).ok_or(DriverError::NoSuchFid(fid))
    }

    #[cfg(test)]
    pub fn fid_count(&self) -> usize {
        self.fids.len()
    }
}
