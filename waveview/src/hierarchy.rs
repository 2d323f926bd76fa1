// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;
use std::ops::Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Timescale {
    pub factor: u32,
    pub unit: TimescaleUnit,
}

impl Timescale {
    pub fn new(factor: u32, unit: TimescaleUnit) -> Self {
        Timescale { factor, unit }
    }
}

impl Display for Timescale {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.factor, self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimescaleUnit {
    FemtoSeconds,
    PicoSeconds,
    NanoSeconds,
    MicroSeconds,
    MilliSeconds,
    Seconds,
    Unknown,
}

impl TimescaleUnit {
    pub fn to_exponent(&self) -> Option<i8> {
        match &self {
            TimescaleUnit::FemtoSeconds => Some(-15),
            TimescaleUnit::PicoSeconds => Some(-12),
            TimescaleUnit::NanoSeconds => Some(-9),
            TimescaleUnit::MicroSeconds => Some(-6),
            TimescaleUnit::MilliSeconds => Some(-3),
            TimescaleUnit::Seconds => Some(0),
            TimescaleUnit::Unknown => None,
        }
    }
}

impl Display for TimescaleUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimescaleUnit::FemtoSeconds => "fs",
            TimescaleUnit::PicoSeconds => "ps",
            TimescaleUnit::NanoSeconds => "ns",
            TimescaleUnit::MicroSeconds => "us",
            TimescaleUnit::MilliSeconds => "ms",
            TimescaleUnit::Seconds => "s",
            TimescaleUnit::Unknown => "?",
        };
        write!(f, "{s}")
    }
}

/// Declared type of a variable. Informational only, the engine treats all of them as
/// bit vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VarType {
    // VCD
    Event,
    Integer,
    Parameter,
    Real,
    Reg,
    Supply0,
    Supply1,
    Time,
    Tri,
    TriAnd,
    TriOr,
    TriReg,
    Tri0,
    Tri1,
    WAnd,
    Wire,
    WOr,
    String,
    Port,
    SparseArray,
    RealTime,
    // System Verilog
    Bit,
    Logic,
    Int,
    ShortInt,
    LongInt,
    Byte,
    Enum,
    ShortReal,
}

/// Bit range that follows a variable name, e.g. `[7:0]`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VarIndex {
    msb: i64,
    lsb: i64,
}

impl VarIndex {
    pub fn new(msb: i64, lsb: i64) -> Self {
        Self { msb, lsb }
    }

    #[inline]
    pub fn msb(&self) -> i64 {
        self.msb
    }

    #[inline]
    pub fn lsb(&self) -> i64 {
        self.lsb
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.msb.abs_diff(self.lsb).saturating_add(1)
    }
}

impl Display for VarIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.msb == self.lsb {
            write!(f, "[{}]", self.msb)
        } else {
            write!(f, "[{}:{}]", self.msb, self.lsb)
        }
    }
}

/// Identifies a signal inside a single trace. Signals are numbered in declaration order.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SignalRef(NonZeroU32);

impl SignalRef {
    #[inline]
    pub fn from_index(index: usize) -> Option<Self> {
        NonZeroU32::new(index as u32 + 1).map(Self)
    }

    #[inline]
    pub fn index(&self) -> usize {
        (self.0.get() - 1) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Signal {
    path: String,
    /// length of the path without the index suffix
    base_len: usize,
    index: Option<VarIndex>,
    symbol_id: String,
    width: u32,
    var_type: VarType,
    #[serde(skip)]
    timeline: u32,
}

impl Signal {
    /// Full hierarchical path including a bit range suffix if one was declared,
    /// e.g. `tb.dut.addr[7:0]`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Hierarchical path without the bit range suffix, e.g. `tb.dut.addr`.
    pub fn base_path(&self) -> &str {
        &self.path[..self.base_len]
    }

    /// Last path component without the bit range.
    pub fn name(&self) -> &str {
        let base = self.base_path();
        match base.rfind('.') {
            Some(pos) => &base[pos + 1..],
            None => base,
        }
    }

    pub fn index(&self) -> Option<VarIndex> {
        self.index
    }

    /// VCD identifier code.
    pub fn symbol_id(&self) -> &str {
        &self.symbol_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn is_bus(&self) -> bool {
        self.width > 1
    }

    pub fn var_type(&self) -> VarType {
        self.var_type
    }

    #[inline]
    pub(crate) fn timeline_index(&self) -> usize {
        self.timeline as usize
    }
}

/// All signals declared in a trace header.
#[derive(Debug, Clone, Default)]
pub struct SignalTable {
    signals: Vec<Signal>,
    by_path: FxHashMap<String, SignalRef>,
    by_base_path: FxHashMap<String, SignalRef>,
    by_id: FxHashMap<Vec<u8>, SignalRef>,
    timeline_widths: Vec<u32>,
}

impl SignalTable {
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Signal> {
        self.signals.iter()
    }

    pub fn as_slice(&self) -> &[Signal] {
        &self.signals
    }

    pub fn refs(&self) -> impl Iterator<Item = SignalRef> + '_ {
        (0..self.signals.len()).flat_map(SignalRef::from_index)
    }

    pub fn get(&self, signal: SignalRef) -> Option<&Signal> {
        self.signals.get(signal.index())
    }

    /// Looks up a signal by its full path first, then by its path without bit range.
    pub fn lookup(&self, path: &str) -> Option<SignalRef> {
        self.by_path
            .get(path)
            .or_else(|| self.by_base_path.get(path))
            .copied()
    }

    /// Looks up the signal that a VCD identifier code feeds into.
    pub fn lookup_symbol(&self, id: &[u8]) -> Option<SignalRef> {
        self.by_id.get(id).copied()
    }

    pub(crate) fn timeline_widths(&self) -> &[u32] {
        &self.timeline_widths
    }
}

impl Index<SignalRef> for SignalTable {
    type Output = Signal;

    fn index(&self, index: SignalRef) -> &Self::Output {
        &self.signals[index.index()]
    }
}

/// Collects scope and variable declarations while the header is parsed.
pub(crate) struct SignalTableBuilder {
    /// scope names, `None` for scopes that are flattened away
    scopes: Vec<Option<String>>,
    remove_scopes_with_empty_name: bool,
    table: SignalTable,
}

impl SignalTableBuilder {
    pub(crate) fn new(remove_scopes_with_empty_name: bool) -> Self {
        Self {
            scopes: Vec::new(),
            remove_scopes_with_empty_name,
            table: SignalTable::default(),
        }
    }

    pub(crate) fn add_scope(&mut self, name: &str) {
        if self.remove_scopes_with_empty_name && name.is_empty() {
            self.scopes.push(None);
        } else {
            self.scopes.push(Some(name.to_string()));
        }
    }

    /// Superfluous `$upscope` commands are ignored.
    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn make_path(&self, name: &str) -> String {
        let mut path = String::new();
        for scope in self.scopes.iter().flatten() {
            path.push_str(scope);
            path.push('.');
        }
        path.push_str(name);
        path
    }

    /// Declares a variable. Returns a description of the problem if the declaration
    /// conflicts with an earlier one.
    pub(crate) fn add_var(
        &mut self,
        var_type: VarType,
        width: u32,
        id: &[u8],
        name: &str,
        index: Option<VarIndex>,
    ) -> std::result::Result<(), String> {
        let base = self.make_path(name);
        let base_len = base.len();
        let path = match index {
            Some(index) => format!("{base}{index}"),
            None => base,
        };

        // a second declaration of the same path is merged into the first one
        if let Some(&existing) = self.table.by_path.get(&path) {
            let existing_signal = &self.table.signals[existing.index()];
            if existing_signal.width != width {
                return Err(format!(
                    "`{path}` is declared with {width} bits, but an earlier declaration has {} bits",
                    existing_signal.width
                ));
            }
            return match self.table.by_id.get(id) {
                None => {
                    self.table.by_id.insert(id.to_vec(), existing);
                    Ok(())
                }
                Some(other)
                    if self.table.signals[other.index()].timeline == existing_signal.timeline =>
                {
                    Ok(())
                }
                Some(_) => Err(format!(
                    "`{path}` is declared again with symbol `{}` which already belongs to another signal",
                    String::from_utf8_lossy(id)
                )),
            };
        }

        // a known id declares an alias that shares the values of the earlier signal
        let timeline = match self.table.by_id.get(id) {
            Some(source) => {
                let source = &self.table.signals[source.index()];
                if source.width != width {
                    return Err(format!(
                        "symbol `{}` is used for `{}` with {} bits and for `{path}` with {width} bits",
                        String::from_utf8_lossy(id),
                        source.path,
                        source.width
                    ));
                }
                source.timeline
            }
            None => {
                self.table.timeline_widths.push(width);
                (self.table.timeline_widths.len() - 1) as u32
            }
        };

        let signal_ref = SignalRef::from_index(self.table.signals.len())
            .ok_or_else(|| "too many signals".to_string())?;
        self.table.by_id.entry(id.to_vec()).or_insert(signal_ref);
        self.table
            .by_base_path
            .entry(path[..base_len].to_string())
            .or_insert(signal_ref);
        self.table.by_path.insert(path.clone(), signal_ref);
        self.table.signals.push(Signal {
            path,
            base_len,
            index,
            symbol_id: String::from_utf8_lossy(id).to_string(),
            width,
            var_type,
            timeline,
        });
        Ok(())
    }

    pub(crate) fn finish(self) -> SignalTable {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(std::mem::size_of::<SignalRef>(), 4);
        assert_eq!(std::mem::size_of::<Option<SignalRef>>(), 4);
    }

    #[test]
    fn test_index_length() {
        assert_eq!(VarIndex::new(7, 0).length(), 8);
        assert_eq!(VarIndex::new(0, 7).length(), 8);
        assert_eq!(VarIndex::new(1, -1).length(), 3);
        assert_eq!(VarIndex::new(4294967295, 0).length(), 4294967296);
        assert_eq!(VarIndex::new(i64::MAX, i64::MIN).length(), u64::MAX);
    }

    #[test]
    fn test_paths_and_lookup() {
        let mut b = SignalTableBuilder::new(false);
        b.add_scope("tb");
        b.add_scope("dut");
        b.add_var(VarType::Wire, 8, b"#", "addr", Some(VarIndex::new(7, 0)))
            .unwrap();
        b.pop_scope();
        b.add_var(VarType::Reg, 1, b"!", "clk", None).unwrap();
        let t = b.finish();
        assert_eq!(t.len(), 2);
        let addr = t.lookup("tb.dut.addr").unwrap();
        assert_eq!(t.lookup("tb.dut.addr[7:0]"), Some(addr));
        assert_eq!(t[addr].name(), "addr");
        assert_eq!(t[addr].path(), "tb.dut.addr[7:0]");
        assert_eq!(t[addr].base_path(), "tb.dut.addr");
        assert_eq!(t.lookup_symbol(b"!"), t.lookup("tb.clk"));
    }

    #[test]
    fn test_duplicate_declarations() {
        let mut b = SignalTableBuilder::new(false);
        b.add_scope("top");
        b.add_var(VarType::Wire, 4, b"a", "data", None).unwrap();
        // same path, same width: merged, the new id feeds the same timeline
        b.add_var(VarType::Wire, 4, b"b", "data", None).unwrap();
        // same path, other width: conflict
        assert!(b.add_var(VarType::Wire, 2, b"c", "data", None).is_err());
        // same id, other path: alias
        b.add_var(VarType::Wire, 4, b"a", "data_copy", None).unwrap();
        let t = b.finish();
        assert_eq!(t.len(), 2);
        assert_eq!(t.timeline_widths(), [4]);
        assert_eq!(t.lookup_symbol(b"b"), t.lookup("top.data"));
        let copy = t.lookup("top.data_copy").unwrap();
        assert_eq!(t[copy].timeline_index(), 0);
    }

    #[test]
    fn test_flatten_empty_scopes() {
        let mut b = SignalTableBuilder::new(true);
        b.add_scope("");
        b.add_scope("top");
        b.add_var(VarType::Wire, 1, b"!", "x", None).unwrap();
        let t = b.finish();
        assert_eq!(t.iter().next().unwrap().path(), "top.x");
    }
}
