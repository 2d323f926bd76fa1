// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

use std::fmt::{Debug, Display, Formatter};

pub type Time = u64;

/// How a bus value is turned into a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusFormat {
    #[default]
    Binary,
    #[serde(alias = "hex")]
    Hexadecimal,
    Octal,
    #[serde(alias = "decimal")]
    Unsigned,
    Signed,
}

/// A four state bit vector, most significant bit first.
/// Every byte is one of `0`, `1`, `x` or `z`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Value(Box<[u8]>);

/// Borrowed view of a [`Value`], usually pointing into the storage of a timeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef<'a>(&'a [u8]);

impl Value {
    /// Parses a bit string. Nine state characters are reduced to four states.
    /// Returns `None` if the string contains anything but bit characters.
    pub fn from_bit_str(bits: &str) -> Option<Self> {
        let mut out = Vec::with_capacity(bits.len());
        if normalize_bits(bits.as_bytes(), &mut out) {
            Some(Self(out.into_boxed_slice()))
        } else {
            None
        }
    }

    /// The value every signal holds before its first change.
    pub fn unknown(width: u32) -> Self {
        Self(vec![b'x'; width as usize].into_boxed_slice())
    }

    pub(crate) fn from_normalized(bits: &[u8]) -> Self {
        debug_assert!(bits.iter().all(|b| matches!(b, b'0' | b'1' | b'x' | b'z')));
        Self(bits.into())
    }

    pub fn as_value_ref(&self) -> ValueRef<'_> {
        ValueRef(&self.0)
    }

    pub fn width(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn bits(&self) -> &[u8] {
        &self.0
    }

    pub fn format(&self, format: BusFormat) -> String {
        self.as_value_ref().format(format)
    }
}

impl<'a> ValueRef<'a> {
    pub(crate) fn new(bits: &'a [u8]) -> Self {
        Self(bits)
    }

    pub fn width(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn bits(&self) -> &'a [u8] {
        self.0
    }

    pub fn to_value(&self) -> Value {
        Value(self.0.into())
    }

    /// `true` iff no bit is `x` or `z`.
    pub fn is_fully_known(&self) -> bool {
        self.0.iter().all(|b| matches!(b, b'0' | b'1'))
    }

    /// Returns the unsigned integer value if all bits are known and it fits.
    pub fn to_u128(&self) -> Option<u128> {
        if !self.is_fully_known() || self.0.len() > 128 {
            return None;
        }
        Some(
            self.0
                .iter()
                .fold(0u128, |acc, b| (acc << 1) | (*b - b'0') as u128),
        )
    }

    pub fn format(&self, format: BusFormat) -> String {
        match format {
            BusFormat::Binary => self.to_string(),
            BusFormat::Hexadecimal => format_groups(self.0, 4),
            BusFormat::Octal => format_groups(self.0, 3),
            BusFormat::Unsigned => format_unsigned(self.0),
            BusFormat::Signed => format_signed(self.0),
        }
    }
}

impl Display for ValueRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // all bytes are ascii
        write!(f, "{}", String::from_utf8_lossy(self.0))
    }
}

impl Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueRef({self})")
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_value_ref())
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value({self})")
    }
}

impl PartialEq<ValueRef<'_>> for Value {
    fn eq(&self, other: &ValueRef<'_>) -> bool {
        *self.0 == *other.0
    }
}

impl PartialEq<Value> for ValueRef<'_> {
    fn eq(&self, other: &Value) -> bool {
        *self.0 == *other.0
    }
}

/// Maps a VCD bit character onto one of our four states.
#[inline]
pub(crate) fn normalize_bit(b: u8) -> Option<u8> {
    match b {
        b'0' | b'l' | b'L' => Some(b'0'),
        b'1' | b'h' | b'H' => Some(b'1'),
        b'x' | b'X' | b'u' | b'U' | b'w' | b'W' | b'-' => Some(b'x'),
        b'z' | b'Z' => Some(b'z'),
        _ => None,
    }
}

/// Appends the normalized bits to `out`. Returns false (and leaves `out` in an
/// undefined state) if an invalid character is encountered.
#[inline]
pub(crate) fn normalize_bits(value: &[u8], out: &mut Vec<u8>) -> bool {
    for &b in value.iter() {
        match normalize_bit(b) {
            Some(n) => out.push(n),
            None => return false,
        }
    }
    true
}

/// Brings a normalized bit string to exactly `width` bits.
/// Shorter values are extended on the left: `0` and `1` with zeros, `x` and `z` with
/// themselves. Longer values keep their rightmost `width` bits.
pub(crate) fn coerce_width(value: &[u8], width: usize, out: &mut Vec<u8>) {
    match value.len().cmp(&width) {
        std::cmp::Ordering::Equal => out.extend_from_slice(value),
        std::cmp::Ordering::Greater => out.extend_from_slice(&value[value.len() - width..]),
        std::cmp::Ordering::Less => {
            let fill = match value.first() {
                Some(b'x') => b'x',
                Some(b'z') => b'z',
                _ => b'0',
            };
            out.resize(out.len() + width - value.len(), fill);
            out.extend_from_slice(value);
        }
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Formats groups of `group_bits` bits, starting from the least significant bit.
/// Groups with unknown bits show up as `z` when all of them are `z`, otherwise as `x`.
fn format_groups(bits: &[u8], group_bits: usize) -> String {
    if bits.is_empty() {
        return String::new();
    }
    let num_groups = bits.len().div_ceil(group_bits);
    let mut out = String::with_capacity(num_groups);
    // the first group might not contain a full set of bits
    let first_len = bits.len() - (num_groups - 1) * group_bits;
    let mut start = 0;
    for ii in 0..num_groups {
        let len = if ii == 0 { first_len } else { group_bits };
        let group = &bits[start..start + len];
        start += len;
        let c = if group.iter().all(|b| *b == b'z') {
            'z'
        } else if group.iter().any(|b| matches!(b, b'x' | b'z')) {
            'x'
        } else {
            let digit = group.iter().fold(0usize, |acc, b| (acc << 1) | (*b - b'0') as usize);
            HEX_DIGITS[digit] as char
        };
        out.push(c);
    }
    out
}

fn unknown_decimal(bits: &[u8]) -> Option<String> {
    if bits.iter().all(|b| *b == b'z') {
        Some("z".to_string())
    } else if bits.iter().any(|b| matches!(b, b'x' | b'z')) {
        Some("x".to_string())
    } else {
        None
    }
}

fn format_unsigned(bits: &[u8]) -> String {
    if bits.is_empty() {
        return String::new();
    }
    if let Some(unknown) = unknown_decimal(bits) {
        return unknown;
    }
    bits_to_decimal(bits)
}

fn format_signed(bits: &[u8]) -> String {
    if bits.is_empty() {
        return String::new();
    }
    if let Some(unknown) = unknown_decimal(bits) {
        return unknown;
    }
    if bits[0] == b'0' {
        return bits_to_decimal(bits);
    }
    // two's complement: invert and add one to obtain the magnitude
    let mut magnitude: Vec<u8> = bits
        .iter()
        .map(|b| if *b == b'0' { b'1' } else { b'0' })
        .collect();
    for b in magnitude.iter_mut().rev() {
        if *b == b'0' {
            *b = b'1';
            break;
        }
        *b = b'0';
    }
    format!("-{}", bits_to_decimal(&magnitude))
}

const LIMB_BASE: u64 = 1_000_000_000;

/// Converts a fully known bit string of arbitrary length into a decimal string.
fn bits_to_decimal(bits: &[u8]) -> String {
    if bits.len() <= 128 {
        let value = bits
            .iter()
            .fold(0u128, |acc, b| (acc << 1) | (*b - b'0') as u128);
        return value.to_string();
    }
    // little endian limbs in base 10^9
    let mut limbs: Vec<u64> = vec![0];
    for b in bits.iter() {
        let mut carry = (*b - b'0') as u64;
        for limb in limbs.iter_mut() {
            let v = *limb * 2 + carry;
            *limb = v % LIMB_BASE;
            carry = v / LIMB_BASE;
        }
        if carry > 0 {
            limbs.push(carry);
        }
    }
    let mut out = String::with_capacity(limbs.len() * 9);
    let mut iter = limbs.iter().rev();
    if let Some(first) = iter.next() {
        out.push_str(&first.to_string());
    }
    for limb in iter {
        out.push_str(&format!("{limb:09}"));
    }
    out
}
