//! Tree-embedded addresses.
//!
//! A node's position in the spanning tree is a list of coordinates, one per
//! hop below the root, each in [0, 135]. Coordinates pack into nibbles:
//! values below 8 take a single nibble; values 8-135 subtract 8 and take
//! two nibbles with the high bit set on the first. The nibble stream is
//! padded to a fixed 16-byte wire address.
//!
//! Addresses are only comparable within the same tree state (a u8 derived
//! from the root claim). Identity is (tree_state, wire bytes); the decoded
//! coordinate list is a cache.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

/// Routing distance metric selector. Carried in flag bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    /// Graph distance on the tree.
    #[default]
    Tree,
    /// Longest-common-prefix distance with a path-length tiebreaker.
    Cpl,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must be 16 bytes, got {0}")]
    BadLength(usize),

    #[error("coordinate {0} out of range (0-135)")]
    CoordRange(u16),

    #[error("malformed address string: {0}")]
    BadString(String),
}

/// A tree-embedded address: tree state plus packed coordinates.
#[derive(Debug, Clone)]
pub struct Address {
    pub tree_state: u8,
    pub address: [u8; 16],
    coords: Vec<u8>,
}

impl Address {
    /// Construct from wire bytes.
    pub fn from_bytes(tree_state: u8, address: [u8; 16]) -> Self {
        let coords = Self::decode(&address);
        Address { tree_state, address, coords }
    }

    /// Construct from a coordinate list. Fails if any coordinate exceeds 135.
    pub fn from_coords(tree_state: u8, coords: &[u8]) -> Result<Self, AddressError> {
        let address = Self::encode(coords)?;
        // re-decode so trailing zeroes trim exactly as the wire form would
        let coords = Self::decode(&address);
        Ok(Address { tree_state, address, coords })
    }

    /// The root address for a tree state (empty coordinate list).
    pub fn root(tree_state: u8) -> Self {
        Address { tree_state, address: [0u8; 16], coords: Vec::new() }
    }

    pub fn coords(&self) -> &[u8] {
        &self.coords
    }

    /// Unpack wire bytes into coordinates, trimming trailing zeroes.
    pub fn decode(address: &[u8; 16]) -> Vec<u8> {
        let mut nibbles = Vec::with_capacity(32);
        for b in address {
            nibbles.push(b >> 4);
            nibbles.push(b & 0x0F);
        }

        let mut coords = Vec::new();
        let mut it = nibbles.into_iter().peekable();
        while let Some(n) = it.next() {
            if n < 8 || it.peek().is_none() {
                coords.push(n);
            } else {
                let low = it.next().unwrap();
                coords.push(((n & 7) << 4) + low + 8);
            }
        }

        while coords.last() == Some(&0) {
            coords.pop();
        }
        coords
    }

    /// Pack coordinates into wire bytes, right-padded with zeroes.
    pub fn encode(coords: &[u8]) -> Result<[u8; 16], AddressError> {
        let mut nibbles = Vec::with_capacity(32);
        for &coord in coords {
            if coord > 135 {
                return Err(AddressError::CoordRange(coord as u16));
            }
            if coord < 8 {
                nibbles.push(coord);
            } else {
                // subtract 8 and set the high bit of the octet
                let octet = ((coord - 8) & 127) | 128;
                nibbles.push(octet >> 4);
                nibbles.push(octet & 0x0F);
            }
        }
        if nibbles.len() % 2 == 1 {
            nibbles.push(0);
        }
        if nibbles.len() > 32 {
            return Err(AddressError::BadLength(nibbles.len() / 2));
        }

        let mut address = [0u8; 16];
        for (i, pair) in nibbles.chunks(2).enumerate() {
            address[i] = (pair[0] << 4) | pair[1];
        }
        Ok(address)
    }

    /// Longest common prefix length of two coordinate lists.
    pub fn cpl(x1: &[u8], x2: &[u8]) -> usize {
        x1.iter().zip(x2.iter()).take_while(|(a, b)| a == b).count()
    }

    /// Coordinates used for tree distance: truncated at the first zero
    /// (zero is the in-path terminator).
    fn tree_coords(&self) -> &[u8] {
        match self.coords.iter().position(|&c| c == 0) {
            Some(i) => &self.coords[..i],
            None => &self.coords,
        }
    }

    /// Graph distance on the tree: |x| + |y| − 2·cpl(x, y).
    pub fn d_tree(x1: &Address, x2: &Address) -> u32 {
        let a = x1.tree_coords();
        let b = x2.tree_coords();
        (a.len() + b.len() - 2 * Self::cpl(a, b)) as u32
    }

    /// Coordinates used for CPL distance: right-padded to 32 entries.
    fn cpl_coords(&self) -> Vec<u8> {
        let mut c = self.coords.clone();
        c.resize(32, 0);
        c
    }

    /// CPL distance: 33 − cpl − 1/(|x|+|y|+1), or 0 for equal addresses.
    /// Lower is closer; the fractional term breaks ties by path length.
    pub fn d_cpl(x1: &Address, x2: &Address) -> f64 {
        let a = x1.cpl_coords();
        let b = x2.cpl_coords();
        if a == b {
            return 0.0;
        }
        33.0 - Self::cpl(&a, &b) as f64 - 1.0 / (a.len() + b.len() + 1) as f64
    }

    /// Distance under the selected metric, as a totally ordered value.
    pub fn distance(metric: Metric, x1: &Address, x2: &Address) -> f64 {
        match metric {
            Metric::Tree => Self::d_tree(x1, x2) as f64,
            Metric::Cpl => Self::d_cpl(x1, x2),
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.tree_state == other.tree_state && self.address == other.address
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tree_state.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for Address {
    /// Operator-friendly form: `{tree_state}-{hex pairs}` with runs of
    /// zero pairs collapsed to `::` (at most one run).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.address.iter().map(|b| format!("{b:02x}")).collect();
        let mut formatted = String::new();
        let mut compressed = false;
        let mut i = 0;
        while i < pairs.len() {
            if pairs[i] != "00" {
                formatted.push_str(&pairs[i]);
            } else if !compressed {
                // a lone zero pair stays literal; a run compresses
                if i + 1 < pairs.len() && pairs[i + 1] != "00" {
                    formatted.push_str("00");
                } else {
                    formatted.push_str("::");
                    compressed = true;
                }
            } else if !formatted.ends_with("::") {
                formatted.push_str(&pairs[i]);
            }
            i += 1;
        }
        write!(f, "{}-{}", self.tree_state, formatted)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Parse the Display form. Accepts an `Address(...)` decoration and
    /// ignores whitespace and parentheses.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .replace("Address", "")
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '(' && *c != ')')
            .collect();
        let (state, hex) = cleaned
            .split_once('-')
            .ok_or_else(|| AddressError::BadString(s.into()))?;
        let tree_state: u8 = state.parse().map_err(|_| AddressError::BadString(s.into()))?;

        let full = match hex.split_once("::") {
            None => format!("{hex:0<32}"),
            Some((prefix, postfix)) => {
                let pad = 32usize
                    .checked_sub(prefix.len() + postfix.len())
                    .ok_or_else(|| AddressError::BadString(s.into()))?;
                format!("{prefix}{}{postfix}", "0".repeat(pad))
            }
        };
        if full.len() != 32 {
            return Err(AddressError::BadString(s.into()));
        }
        let mut address = [0u8; 16];
        for (i, byte) in address.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&full[2 * i..2 * i + 2], 16)
                .map_err(|_| AddressError::BadString(s.into()))?;
        }
        Ok(Address::from_bytes(tree_state, address))
    }
}
