//! Jobs executed inside worker processes.
//!
//! The server binary re-runs itself with the `worker` subcommand to do
//! blocking work (reverse DNS, directory scans) away from the main loop.
//! Results go to stdout, which is the pipe the supervisor reads.

use crate::error::{Result, ServerError};
use crate::world::{Item, Mobile, Player, Room};
use log::debug;
use serde::de::DeserializeOwned;
use shared::{load_record, DNS_RETRY_LIMIT};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Reverse-resolves `address`, retrying transient resolver failures.
pub fn resolve(address: &str, out: &mut impl Write) -> Result<()> {
    let ip: IpAddr = address
        .parse()
        .map_err(|_| ServerError::Worker(format!("not an address: {}", address)))?;

    let mut attempt = 0;
    let hostname = loop {
        attempt += 1;
        match dns_lookup::lookup_addr(&ip) {
            Ok(name) => break name,
            Err(e) if is_transient(&e) && attempt < DNS_RETRY_LIMIT => {
                debug!("Lookup of {} failed transiently (attempt {}): {}", address, attempt, e);
                thread::sleep(Duration::from_millis(100 * u64::from(attempt)));
            }
            Err(e) => return Err(ServerError::Worker(format!("lookup of {} failed: {}", address, e))),
        }
    };
    writeln!(out, "{}", hostname)?;
    Ok(())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Prints the names of records in `dir` starting with `prefix`, sorted.
pub fn list(dir: &Path, prefix: &str, out: &mut impl Write) -> Result<()> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                return None;
            }
            path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
        })
        .filter(|name| name.to_lowercase().starts_with(&prefix.to_lowercase()))
        .collect();
    names.sort();

    for name in &names {
        writeln!(out, "{}", name)?;
    }
    writeln!(out, "{} matching", names.len())?;
    Ok(())
}

/// Per-directory result of an audit.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AuditCount {
    pub readable: usize,
    pub unreadable: Vec<String>,
}

/// Decodes every stored record and reports anything that fails to load.
pub fn audit(data_dir: &Path, out: &mut impl Write) -> Result<()> {
    let sections = [
        ("rooms", audit_dir::<Room>(&data_dir.join("rooms"))?),
        ("mobiles", audit_dir::<Mobile>(&data_dir.join("mobiles"))?),
        ("items", audit_dir::<Item>(&data_dir.join("items"))?),
        ("players", audit_dir::<Player>(&data_dir.join("players"))?),
    ];
    for (name, count) in &sections {
        writeln!(
            out,
            "{}: {} readable, {} unreadable",
            name,
            count.readable,
            count.unreadable.len()
        )?;
        for bad in &count.unreadable {
            writeln!(out, "  unreadable: {}", bad)?;
        }
    }
    Ok(())
}

/// Walks `dir` (one level of area subdirectories) decoding `.bin` records.
pub fn audit_dir<T: DeserializeOwned>(dir: &Path) -> Result<AuditCount> {
    let mut count = AuditCount::default();
    if !dir.exists() {
        return Ok(count);
    }
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("bin") {
                match load_record::<T>(&path) {
                    Ok(_) => count.readable += 1,
                    Err(_) => count.unreadable.push(path.display().to_string()),
                }
            }
        }
    }
    count.unreadable.sort();
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Role;
    use shared::{store_record, CacheKey};
    use tempfile::tempdir;

    #[test]
    fn test_resolve_rejects_garbage() {
        let mut out = Vec::new();
        assert!(resolve("not-an-ip", &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_list_filters_by_prefix() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let room = CacheKey::new("misc", 1);
        for name in ["Alda", "Alric", "Bren"] {
            let player = Player::new(name, Role::Player, room.clone());
            store_record(&dir.join(format!("{}.bin", name)), &player).unwrap();
        }
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut out = Vec::new();
        list(dir, "al", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Alda\nAlric\n2 matching\n");
    }

    #[test]
    fn test_audit_reports_unreadable_records() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let key = CacheKey::new("town", 3);
        store_record(&dir.join("rooms/town/3.bin"), &Room::empty(&key)).unwrap();
        fs::create_dir_all(dir.join("rooms/town")).unwrap();
        fs::write(dir.join("rooms/town/4.bin"), [1u8, 2, 3]).unwrap();

        let rooms = audit_dir::<Room>(&dir.join("rooms")).unwrap();
        assert_eq!(rooms.readable, 1);
        assert_eq!(rooms.unreadable.len(), 1);
        assert!(rooms.unreadable[0].ends_with("4.bin"));

        let mut out = Vec::new();
        audit(dir, &mut out).unwrap();
        let report = String::from_utf8(out).unwrap();
        assert!(report.contains("rooms: 1 readable, 1 unreadable"));
        assert!(report.contains("players: 0 readable, 0 unreadable"));
    }
}
