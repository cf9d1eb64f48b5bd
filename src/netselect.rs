//! Network interface selection: enumerate, filter, prompt, remember.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::io::{self, BufRead, Write};
use std::net::IpAddr;

use crate::config::Preferences;

/// Interface names that never carry a LAN-reachable address: container
/// bridges, VPN and tunnel devices, loopback.
const VIRTUAL_IFACE_PATTERN: &str =
    r"^(veth|br\-|docker|lo|EHC|XHC|bridge|gif|stf|p2p|awdl|utun|tun|tap)";

/// One selectable interface with its usable addresses.
#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    addrs: Vec<IpAddr>,
}

/// Pick the address to bind, prompting when the choice is ambiguous, and
/// record the chosen interface name on the preferences for future runs.
pub fn select_address(preferences: &mut Preferences) -> Result<IpAddr> {
    let candidates = enumerate_candidates()?;

    // Saved preference short-circuits the prompt.
    if let Some(saved) = preferences.interface.as_deref() {
        if let Some(candidate) = candidates.iter().find(|c| c.name == saved) {
            return pick_ip(candidate);
        }
        tracing::debug!("saved interface '{}' not found, prompting again", saved);
    }

    let filter = Regex::new(VIRTUAL_IFACE_PATTERN).expect("valid interface filter pattern");
    let filtered: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| !filter.is_match(&c.name))
        .collect();

    let chosen = match filtered.len() {
        0 => bail!("No network interface available."),
        1 => filtered[0],
        _ => prompt_for_interface(&filtered)?,
    };
    preferences.interface = Some(chosen.name.clone());
    pick_ip(chosen)
}

/// Group addresses by interface, dropping loopback and link-local ones.
fn enumerate_candidates() -> Result<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = Vec::new();
    let addrs = if_addrs::get_if_addrs().context("Failed to enumerate network interfaces")?;
    for iface in addrs {
        if iface.is_loopback() {
            continue;
        }
        let ip = iface.ip();
        if is_link_local(ip) {
            continue;
        }
        match candidates.iter_mut().find(|c| c.name == iface.name) {
            Some(candidate) => candidate.addrs.push(ip),
            None => candidates.push(Candidate {
                name: iface.name.clone(),
                addrs: vec![ip],
            }),
        }
    }
    Ok(candidates)
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// IPv4 preferred; IPv6 only when it is all the interface has.
fn pick_ip(candidate: &Candidate) -> Result<IpAddr> {
    candidate
        .addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| candidate.addrs.first())
        .copied()
        .with_context(|| format!("Unable to find an IP for interface {}", candidate.name))
}

fn prompt_for_interface<'a>(candidates: &[&'a Candidate]) -> Result<&'a Candidate> {
    println!("Choose the network interface to use (type the number):");
    for (n, candidate) in candidates.iter().enumerate() {
        println!("[{}] {}", n, candidate.name);
    }
    print!("> ");
    io::stdout().flush().ok();

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read interface selection")?;
    let index: usize = line.trim().parse().context("Not a number")?;
    candidates.get(index).copied().context("Wrong number")
}

/// Host part for the generated URL; IPv6 needs brackets.
pub fn display_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}
