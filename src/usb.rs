//! USB device enumeration and the pass-through allow-list.

use std::process::Command;

use anyhow::Result;

use crate::command::CommandRun;

/// An attached USB device eligible for pass-through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbCandidate {
    /// `vendor:product`, lowercase hex.
    pub id: String,
    pub description: String,
}

/// Source of the host's USB device listing.
pub trait UsbSource {
    /// Raw `lsusb`-format listing.
    fn list(&self) -> Result<String>;
}

pub struct LsUsb;

impl UsbSource for LsUsb {
    fn list(&self) -> Result<String> {
        Command::new("lsusb").run_get_string()
    }
}

/// True for a `vvvv:pppp` hex pair.
pub fn is_usb_id(id: &str) -> bool {
    let Some((vendor, product)) = id.split_once(':') else {
        return false;
    };
    let hex4 = |s: &str| s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit());
    hex4(vendor) && hex4(product)
}

/// Parse one `lsusb` line:
/// `Bus 001 Device 003: ID 1b1f:c020 Some Vendor Radio Module`.
fn parse_line(line: &str) -> Option<UsbCandidate> {
    let (_, rest) = line.split_once(" ID ")?;
    let rest = rest.trim();
    let (id, description) = match rest.split_once(char::is_whitespace) {
        Some((id, description)) => (id, description.trim()),
        None => (rest, ""),
    };
    if !is_usb_id(id) {
        return None;
    }
    Some(UsbCandidate {
        id: id.to_ascii_lowercase(),
        description: description.to_string(),
    })
}

/// Devices from `listing` whose id is on `allow_list`, in listing order.
pub fn candidates(listing: &str, allow_list: &[String]) -> Vec<UsbCandidate> {
    listing
        .lines()
        .filter_map(parse_line)
        .filter(|dev| allow_list.iter().any(|id| id.eq_ignore_ascii_case(&dev.id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSUSB: &str = "\
Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub
Bus 001 Device 004: ID 1b1f:c020 Z-Wave.Me RaZberry
Bus 001 Device 003: ID 046d:c52b Logitech, Inc. Unifying Receiver
Bus 001 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
";

    fn allow_list() -> Vec<String> {
        crate::config::Config::default().usb_allow_list
    }

    #[test]
    fn test_candidates_single_match() {
        let found = candidates(LSUSB, &allow_list());
        assert_eq!(
            found,
            vec![UsbCandidate {
                id: "1b1f:c020".to_string(),
                description: "Z-Wave.Me RaZberry".to_string(),
            }]
        );
    }

    #[test]
    fn test_candidates_no_match() {
        let listing = "Bus 001 Device 003: ID 046d:c52b Logitech, Inc. Unifying Receiver\n";
        assert!(candidates(listing, &allow_list()).is_empty());
    }

    #[test]
    fn test_candidates_empty_listing() {
        assert!(candidates("", &allow_list()).is_empty());
    }

    #[test]
    fn test_parse_line_without_description() {
        let dev = parse_line("Bus 001 Device 004: ID 1B1F:C020").unwrap();
        assert_eq!(dev.id, "1b1f:c020");
        assert_eq!(dev.description, "");
    }

    #[test]
    fn test_parse_line_garbage() {
        assert!(parse_line("not an lsusb line").is_none());
        assert!(parse_line("Bus 001 Device 004: ID zzzz:c020 Bogus").is_none());
    }

    #[test]
    fn test_is_usb_id() {
        assert!(is_usb_id("1b1f:c020"));
        assert!(is_usb_id("10C4:EA60"));
        assert!(!is_usb_id("1b1f"));
        assert!(!is_usb_id("1b1f:c02"));
        assert!(!is_usb_id("1b1f:c020:00"));
    }
}
