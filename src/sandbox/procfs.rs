//! Per-process accounting read from `/proc`, normalized to bytes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcMemory {
    pub vm_size: u64,
    pub vm_rss: u64,
}

/// Parses the `VmSize`/`VmRSS` lines of `/proc/<pid>/status`
pub fn parse_status(text: &str) -> ProcMemory {
    let mut memory = ProcMemory::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let target = match key {
            "VmSize" => &mut memory.vm_size,
            "VmRSS" => &mut memory.vm_rss,
            _ => continue,
        };
        if let Some(bytes) = parse_size(value) {
            *target = bytes;
        }
    }
    memory
}

fn parse_size(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let amount: u64 = parts.next()?.parse().ok()?;
    let factor = match parts.next() {
        None => 1,
        Some(unit) => match unit.to_ascii_lowercase().as_str() {
            "b" => 1,
            "kb" => 1024,
            "mb" => 1024 * 1024,
            "gb" => 1024 * 1024 * 1024,
            _ => return None,
        },
    };
    amount.checked_mul(factor)
}

pub fn read_memory(pid: i32) -> io::Result<ProcMemory> {
    fs::read_to_string(format!("/proc/{pid}/status")).map(|text| parse_status(&text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatEntry {
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
}

/// Parses `/proc/<pid>/stat`; the command name may contain spaces and parens
pub fn parse_stat(text: &str) -> Option<StatEntry> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let pid = text[..open].trim().parse().ok()?;
    let mut rest = text.get(close + 1..)?.split_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    let pgrp = rest.next()?.parse().ok()?;
    Some(StatEntry { pid, ppid, pgrp })
}

fn all_processes() -> io::Result<Vec<StatEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        // processes vanish between listing and reading
        if let Ok(text) = fs::read_to_string(format!("/proc/{pid}/stat")) {
            entries.extend(parse_stat(&text));
        }
    }
    Ok(entries)
}

/// Every live member of `pgid` plus every descendant of `root`, by pid
pub fn collect_tree(entries: &[StatEntry], root: i32, pgid: i32) -> Vec<StatEntry> {
    let by_pid: HashMap<i32, &StatEntry> = entries.iter().map(|e| (e.pid, e)).collect();
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for e in entries {
        children.entry(e.ppid).or_default().push(e.pid);
    }

    let group = entries.iter().filter(|e| e.pgrp == pgid).map(|e| e.pid);
    let mut visited = HashSet::new();
    let mut tree = Vec::new();
    let mut queue: VecDeque<i32> = std::iter::once(root).chain(group).collect();
    while let Some(pid) = queue.pop_front() {
        if !visited.insert(pid) {
            continue;
        }
        if let Some(entry) = by_pid.get(&pid) {
            tree.push(**entry);
        }
        queue.extend(children.get(&pid).into_iter().flatten().copied());
    }

    tree.sort_unstable_by_key(|e| e.pid);
    tree
}

pub fn process_tree(root: i32, pgid: i32) -> io::Result<Vec<StatEntry>> {
    Ok(collect_tree(&all_processes()?, root, pgid))
}

/// Resident memory summed over `pids`; exited processes count as zero
pub fn tree_rss(pids: &[i32]) -> u64 {
    pids.iter()
        .filter_map(|&pid| read_memory(pid).ok())
        .map(|m| m.vm_rss)
        .sum()
}
