//! User namespace id maps.
//!
//! An [`IdmapSet`] describes how ids inside a container's user namespace relate to ids on the
//! host. Unprivileged containers store their root file system with shifted ownership, exporting
//! them requires translating every uid/gid back.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use crate::archive::IdRemap;

/// One range of either uid or gid mappings (or both).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IdmapEntry {
    #[serde(rename = "Isuid")]
    pub is_uid: bool,
    #[serde(rename = "Isgid")]
    pub is_gid: bool,
    /// id as seen on the host, i.e. 100000
    #[serde(rename = "Hostid")]
    pub host_id: u32,
    /// id as seen in the namespace, i.e. 0
    #[serde(rename = "Nsid")]
    pub ns_id: u32,
    #[serde(rename = "Maprange")]
    pub map_range: u32,
}

fn is_between(x: i64, low: i64, high: i64) -> bool {
    x >= low && x < high
}

impl IdmapEntry {
    fn kind_char(&self) -> char {
        match (self.is_uid, self.is_gid) {
            (true, true) => 'b',
            (true, false) => 'u',
            _ => 'g',
        }
    }

    /// Whether both entries map overlapping host or namespace ids of the same kind.
    pub fn intersects(&self, other: &IdmapEntry) -> bool {
        if !((self.is_uid && other.is_uid) || (self.is_gid && other.is_gid)) {
            return false;
        }

        let (e_host, e_ns, e_range) = (
            i64::from(self.host_id),
            i64::from(self.ns_id),
            i64::from(self.map_range),
        );
        let (i_host, i_ns, i_range) = (
            i64::from(other.host_id),
            i64::from(other.ns_id),
            i64::from(other.map_range),
        );

        is_between(e_host, i_host, i_host + i_range - 1)
            || is_between(i_host, e_host, e_host + e_range - 1)
            || is_between(e_host + e_range - 1, i_host, i_host + i_range - 1)
            || is_between(i_host + i_range - 1, e_host, e_host + e_range - 1)
            || is_between(e_ns, i_ns, i_ns + i_range - 1)
            || is_between(i_ns, e_ns, e_ns + e_range - 1)
            || is_between(e_ns + e_range - 1, i_ns, i_ns + i_range - 1)
            || is_between(i_ns + i_range - 1, e_ns, e_ns + e_range - 1)
    }

    /// Shift an id from the namespace to the host, i.e. 0 -> 100000.
    fn shift_into_ns(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.ns_id)?;
        if offset >= self.map_range {
            return None;
        }
        self.host_id.checked_add(offset)
    }

    /// Shift an id from the host back to the namespace, i.e. 101000 -> 1000.
    fn shift_from_ns(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.host_id)?;
        if offset >= self.map_range {
            return None;
        }
        self.ns_id.checked_add(offset)
    }

    /// The lines LXC expects in its `lxc.idmap` configuration.
    pub fn to_lxc_strings(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(2);
        if self.is_uid {
            lines.push(format!("u {} {} {}", self.ns_id, self.host_id, self.map_range));
        }
        if self.is_gid {
            lines.push(format!("g {} {} {}", self.ns_id, self.host_id, self.map_range));
        }
        lines
    }
}

impl FromStr for IdmapEntry {
    type Err = Error;

    /// Parse `<u|g|b>:<nsid>:<hostid>:<range>`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            bail!("bad idmap: {:?}", s);
        }

        let (is_uid, is_gid) = match parts[0] {
            "u" => (true, false),
            "g" => (false, true),
            "b" => (true, true),
            _ => bail!("bad idmap type in {:?}", s),
        };

        let number = |value: &str| -> Result<u32, Error> {
            value
                .parse::<u32>()
                .map_err(|err| format_err!("bad id {:?} in idmap {:?}: {}", value, s, err))
        };

        let entry = IdmapEntry {
            is_uid,
            is_gid,
            ns_id: number(parts[1])?,
            host_id: number(parts[2])?,
            map_range: number(parts[3])?,
        };

        // every id in the range has to be representable on both sides
        let limit = u64::from(u32::MAX) + 1;
        if u64::from(entry.host_id) + u64::from(entry.map_range) > limit
            || u64::from(entry.ns_id) + u64::from(entry.map_range) > limit
        {
            bail!("bad mapping {:?}: id wraparound", s);
        }

        Ok(entry)
    }
}

impl fmt::Display for IdmapEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind_char(),
            self.ns_id,
            self.host_id,
            self.map_range
        )
    }
}

/// An ordered list of id mappings. For each id kind the first matching entry wins.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdmapSet {
    entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON representation stored in container configuration.
    pub fn from_json(data: &str) -> Result<Self, Error> {
        serde_json::from_str(data).map_err(|err| format_err!("failed to parse idmap - {}", err))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Build a set from `u:0:100000:65536` style entries.
    pub fn parse_entries<I, S>(entries: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for entry in entries {
            set.append(entry.as_ref().parse()?)?;
        }
        Ok(set)
    }

    pub fn entries(&self) -> &[IdmapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn intersects(&self, entry: &IdmapEntry) -> bool {
        self.entries.iter().any(|e| entry.intersects(e))
    }

    /// Add an entry, refusing it if it overlaps an existing one.
    pub fn append(&mut self, entry: IdmapEntry) -> Result<(), Error> {
        if self.intersects(&entry) {
            bail!("conflicting id mapping {}", entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    fn shift(
        &self,
        uid: u32,
        gid: u32,
        shift: impl Fn(&IdmapEntry, u32) -> Option<u32>,
    ) -> (Option<u32>, Option<u32>) {
        let mut u = None;
        let mut g = None;

        for entry in &self.entries {
            if entry.is_uid && u.is_none() {
                u = shift(entry, uid);
            }
            if entry.is_gid && g.is_none() {
                g = shift(entry, gid);
            }
        }

        (u, g)
    }

    /// Translate namespace ids to host ids. `None` means the id is not mapped.
    pub fn shift_into_ns(&self, uid: u32, gid: u32) -> (Option<u32>, Option<u32>) {
        self.shift(uid, gid, IdmapEntry::shift_into_ns)
    }

    /// Translate host ids back to namespace ids. `None` means the id is not mapped.
    pub fn shift_from_ns(&self, uid: u32, gid: u32) -> (Option<u32>, Option<u32>) {
        self.shift(uid, gid, IdmapEntry::shift_from_ns)
    }

    /// Unique LXC configuration lines for all entries.
    pub fn to_lxc_strings(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for line in self.entries.iter().flat_map(IdmapEntry::to_lxc_strings) {
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
        lines
    }
}

impl IdRemap for IdmapSet {
    fn remap(&self, uid: u32, gid: u32) -> Option<(u32, u32)> {
        match self.shift_from_ns(uid, gid) {
            (Some(uid), Some(gid)) => Some((uid, gid)),
            _ => None,
        }
    }
}
