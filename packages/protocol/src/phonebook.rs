//! Phonebook: stored slots binding a phone number to a network destination.
//!
//! Mutations are written through to disk immediately. Loading and saving run
//! under the phonebook's own lock.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Transport used to reach a phonebook destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Telnet,
    Ssh,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Telnet => 23,
            Protocol::Ssh => 22,
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TELNET" => Ok(Protocol::Telnet),
            "SSH" => Ok(Protocol::Ssh),
            other => Err(anyhow!("unsupported protocol '{other}'")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Telnet => write!(f, "TELNET"),
            Protocol::Ssh => write!(f, "SSH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub phone: String,
    pub host: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Entry {
    /// Parse the `&Z` payload `phone|host[:port]|protocol|user|pass`.
    ///
    /// Phone and host are required, protocol defaults to TELNET, user and
    /// password may be omitted. Case is preserved.
    pub fn from_record(record: &str) -> Result<Self> {
        let fields: Vec<&str> = record.split('|').collect();
        if fields.len() < 2 || fields.len() > 5 {
            bail!("expected phone|host|protocol|user|pass, got '{record}'");
        }
        let protocol = match fields.get(2).map(|p| p.trim()) {
            Some(p) if !p.is_empty() => p.parse()?,
            _ => Protocol::Telnet,
        };
        let entry = Entry {
            phone: fields[0].trim().to_string(),
            host: fields[1].trim().to_string(),
            protocol,
            username: fields.get(3).map(|s| s.to_string()).unwrap_or_default(),
            password: fields.get(4).map(|s| s.to_string()).unwrap_or_default(),
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("phonebook entry for '{}' has no host", self.phone);
        }
        if let Some(bad) = self.phone.chars().find(|c| !is_phone_char(*c)) {
            bail!("invalid character '{bad}' in phone '{}'", self.phone);
        }
        if sanitize_phone(&self.phone).is_empty() {
            bail!("phone '{}' has no digits", self.phone);
        }
        Ok(())
    }

    pub fn sanitized_phone(&self) -> String {
        sanitize_phone(&self.phone)
    }

    /// Host and port, falling back to the protocol's default port.
    pub fn address(&self) -> Result<(String, u16)> {
        split_host_port(&self.host, self.protocol.default_port())
    }
}

fn is_phone_char(c: char) -> bool {
    c.is_ascii_digit()
        || matches!(c.to_ascii_uppercase(), 'A'..='D')
        || matches!(c, '#' | '*' | '(' | ')' | '-' | '+' | ' ')
}

/// Reduce a phone number or dial string to the characters that identify
/// it: digits, `A`-`D`, `#` and `*`. Presentation characters and dial
/// modifiers are dropped.
pub fn sanitize_phone(phone: &str) -> String {
    phone
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_digit() || matches!(c, 'A'..='D' | '#' | '*'))
        .collect()
}

/// Split `host[:port]`. Bracketed IPv6 literals are accepted.
pub fn split_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
    let target = target.trim();
    if target.is_empty() {
        bail!("empty host");
    }

    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal in '{target}'"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid port in '{target}'"))?,
            None if tail.is_empty() => default_port,
            None => bail!("unexpected '{tail}' after host in '{target}'"),
        };
        return Ok((host.to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in '{target}'"))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((target.to_string(), default_port)),
    }
}

#[derive(Debug, Default)]
pub struct Phonebook {
    entries: Mutex<BTreeMap<u32, Entry>>,
    path: Option<PathBuf>,
}

impl Phonebook {
    /// An empty phonebook that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Phonebook backed by `path`. A missing file gives an empty book.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let book = Self::empty_at(path);
        book.reload()?;
        Ok(book)
    }

    /// Empty phonebook bound to `path` without reading it. The next save
    /// replaces whatever is there.
    pub fn empty_at(path: impl AsRef<Path>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Re-read the backing file. On failure the book is left empty.
    pub fn reload(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.clear();
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            log::info!("No phonebook at {path:?}, starting empty");
            return Ok(());
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read phonebook from {path:?}"))?;
        let loaded: BTreeMap<u32, Entry> =
            serde_json::from_str(&json).context("Failed to deserialize phonebook")?;
        check_invariants(&loaded)?;
        log::info!("Loaded {} phonebook entries from {path:?}", loaded.len());
        *entries = loaded;
        Ok(())
    }

    fn save_locked(&self, entries: &BTreeMap<u32, Entry>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json =
            serde_json::to_string_pretty(entries).context("Failed to serialize phonebook")?;
        fs::write(path, json).with_context(|| format!("Failed to write phonebook to {path:?}"))?;
        log::debug!("Saved {} phonebook entries to {path:?}", entries.len());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let entries = self.entries.lock();
        self.save_locked(&entries)
    }

    /// Add or replace a slot. Rejected when another slot already has the
    /// same sanitized phone.
    pub fn add(&self, slot: u32, entry: Entry) -> Result<()> {
        entry.validate()?;
        let mut entries = self.entries.lock();
        let phone = entry.sanitized_phone();
        if let Some((other, _)) = entries
            .iter()
            .find(|(s, e)| **s != slot && e.sanitized_phone() == phone)
        {
            bail!("phone '{}' is already stored in slot {other}", entry.phone);
        }
        let previous = entries.insert(slot, entry);
        if let Err(err) = self.save_locked(&entries) {
            match previous {
                Some(previous) => entries.insert(slot, previous),
                None => entries.remove(&slot),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Remove a slot. Returns whether it existed.
    pub fn delete(&self, slot: u32) -> Result<bool> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(&slot) else {
            return Ok(false);
        };
        if let Err(err) = self.save_locked(&entries) {
            entries.insert(slot, previous);
            return Err(err);
        }
        Ok(true)
    }

    /// Find the entry whose sanitized phone matches the dialled digits.
    pub fn lookup(&self, digits: &str) -> Option<Entry> {
        let wanted = sanitize_phone(digits);
        if wanted.is_empty() {
            return None;
        }
        self.entries
            .lock()
            .values()
            .find(|e| e.sanitized_phone() == wanted)
            .cloned()
    }

    pub fn slot(&self, slot: u32) -> Option<Entry> {
        self.entries.lock().get(&slot).cloned()
    }

    pub fn entries(&self) -> Vec<(u32, Entry)> {
        self.entries
            .lock()
            .iter()
            .map(|(slot, entry)| (*slot, entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn check_invariants(entries: &BTreeMap<u32, Entry>) -> Result<()> {
    let mut seen: BTreeMap<String, u32> = BTreeMap::new();
    for (slot, entry) in entries {
        entry
            .validate()
            .with_context(|| format!("invalid phonebook slot {slot}"))?;
        if let Some(other) = seen.insert(entry.sanitized_phone(), *slot) {
            bail!(
                "slots {other} and {slot} share phone '{}'",
                entry.sanitized_phone()
            );
        }
    }
    Ok(())
}
