// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

//! Value Change Dump loader.
//!
//! The header is parsed command by command into a [`SignalTable`], the body is fed byte by
//! byte through a small state machine. Anything the body parser cannot make sense of is
//! recorded as a [`LoadWarning`] on the resulting [`Trace`]; only problems in the header
//! abort a load.

use crate::hierarchy::{SignalTable, SignalTableBuilder, Timescale, TimescaleUnit, VarIndex, VarType};
use crate::timeline::TimelineBuilder;
use crate::trace::{Trace, TraceMeta};
use crate::values::{coerce_width, normalize_bits, Time};
use crate::{LoadOptions, LoadWarning, ProgressCount, Result, WaveError};
use std::io::{BufRead, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
enum VcdParseError {
    #[error("failed to parse length: `{0}` for variable `{1}`")]
    VarLengthParsing(String, String),
    #[error("expected command to start with `$`, not `{0}`")]
    StartChar(String),
    #[error("unknown or invalid command: `{0}`, valid are: {list}", list=get_vcd_command_str())]
    InvalidCommand(String),
    #[error("unexpected number of tokens for command {0}: {1}")]
    UnexpectedNumberOfTokens(String, String),
    #[error("unknown var type: {0}")]
    UnknownVarType(String),
    #[error("failed to parse timescale factor: `{0}`")]
    TimescaleFactor(String),
    #[error("{0}")]
    ConflictingDeclaration(String),
    #[error("stream ended before `$enddefinitions`")]
    MissingEndDefinitions,
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
}

type ParseResult<T> = std::result::Result<T, VcdParseError>;

/// Signals and informational fields of a trace, without any values.
#[derive(Debug)]
pub struct Header {
    pub signals: SignalTable,
    pub meta: TraceMeta,
}

/// Parses only the header of a trace. The stream is read up to and including
/// `$enddefinitions`.
pub fn read_header<R: BufRead>(input: R, options: &LoadOptions) -> Result<Header> {
    let mut input = Input::new(input);
    read_header_from_input(&mut input, options)
}

/// Parses a complete trace.
///
/// `cancel` is polled while the body is parsed, a load that sees it set returns
/// [`WaveError::Cancelled`]. `progress` is incremented by the number of bytes consumed.
pub fn load<R: BufRead>(
    input: R,
    options: &LoadOptions,
    cancel: Option<&AtomicBool>,
    progress: Option<ProgressCount>,
) -> Result<Trace> {
    check_cancelled(cancel)?;
    let mut input = Input::new(input);
    let header = read_header_from_input(&mut input, options)?;
    if let Some(p) = progress.as_ref() {
        p.fetch_add(input.pos.offset, Ordering::Relaxed);
    }

    let mut builder = TraceBuilder::new(&header.signals, options.max_warnings);
    let end = parse_body(&mut input, &mut builder, cancel, progress.as_ref())?;
    let body = builder.finish(end);

    log::debug!(
        "parsed {} bytes, {} signals, end time {}, {} warnings{}",
        input.pos.offset,
        header.signals.len(),
        body.end_time,
        body.warning_count,
        if body.partial { ", partial" } else { "" }
    );

    Ok(Trace {
        meta: header.meta,
        signals: header.signals,
        timelines: body.timelines,
        end_time: body.end_time,
        warnings: body.warnings,
        warning_count: body.warning_count,
        partial: body.partial,
    })
}

/// Memory maps a local file and loads it.
pub fn load_file<P: AsRef<std::path::Path>>(
    filename: P,
    options: &LoadOptions,
    cancel: Option<&AtomicBool>,
    progress: Option<ProgressCount>,
) -> Result<Trace> {
    let input_file = std::fs::File::open(filename)?;
    let mmap = unsafe { memmap2::Mmap::map(&input_file)? };
    load(std::io::Cursor::new(&mmap[..]), options, cancel, progress)
}

#[inline]
fn check_cancelled(cancel: Option<&AtomicBool>) -> Result<()> {
    match cancel {
        Some(flag) if flag.load(Ordering::Relaxed) => Err(WaveError::Cancelled),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    /// 1-based
    line: u64,
    /// 0-based byte offset
    offset: u64,
}

/// Wraps the byte stream and keeps track of where we are in it.
struct Input<R> {
    inner: R,
    pos: Position,
    /// start of the header command that is currently parsed
    command_start: Position,
}

impl<R: BufRead> Input<R> {
    fn new(inner: R) -> Self {
        let pos = Position { line: 1, offset: 0 };
        Self {
            inner,
            pos,
            command_start: pos,
        }
    }

    /// Returns `None` at the end of the stream.
    #[inline]
    fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        let byte = loop {
            match self.inner.fill_buf() {
                Ok(buf) => break buf.first().copied(),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if let Some(b) = byte {
            self.inner.consume(1);
            self.pos.offset += 1;
            if b == b'\n' {
                self.pos.line += 1;
            }
        }
        Ok(byte)
    }

    #[inline]
    fn expect_byte(&mut self) -> ParseResult<u8> {
        self.read_byte()?.ok_or(VcdParseError::MissingEndDefinitions)
    }
}

fn read_header_from_input<R: BufRead>(input: &mut Input<R>, options: &LoadOptions) -> Result<Header> {
    let result = parse_header(input, options);
    result.map_err(|e| header_failure(e, input))
}

fn header_failure<R>(err: VcdParseError, input: &Input<R>) -> WaveError {
    match err {
        VcdParseError::Io(e) => WaveError::NetworkFailure(e.to_string()),
        VcdParseError::MissingEndDefinitions => WaveError::MalformedHeader {
            line: input.pos.line,
            offset: input.pos.offset,
            message: err.to_string(),
        },
        other => WaveError::MalformedHeader {
            line: input.command_start.line,
            offset: input.command_start.offset,
            message: other.to_string(),
        },
    }
}

fn parse_header<R: BufRead>(input: &mut Input<R>, options: &LoadOptions) -> ParseResult<Header> {
    let mut signals = SignalTableBuilder::new(options.remove_scopes_with_empty_name);
    let mut meta = TraceMeta::default();
    let mut buf: Vec<u8> = Vec::with_capacity(128);
    loop {
        buf.clear();
        let (cmd, body) = read_command(input, &mut buf)?;
        match cmd {
            VcdCmd::Scope => {
                let tokens = find_tokens(body);
                match tokens.as_slice() {
                    [_tpe] => signals.add_scope(""),
                    [_tpe, name, ..] => signals.add_scope(&String::from_utf8_lossy(name)),
                    _ => return Err(unexpected_n_tokens("scope", &tokens)),
                }
            }
            VcdCmd::UpScope => signals.pop_scope(),
            VcdCmd::Var => {
                let tokens = find_tokens(body);
                // the actual variable name could be represented by a variable number of tokens,
                // thus we combine all trailing tokens together
                if tokens.len() < 4 {
                    return Err(unexpected_n_tokens("variable", &tokens));
                }
                let body_start = body.as_ptr() as usize;
                let name_start = tokens[3].as_ptr() as usize - body_start;
                let last_token = tokens[tokens.len() - 1];
                let name_end = last_token.as_ptr() as usize - body_start + last_token.len();
                let raw_name = &body[name_start..name_end];

                let var_type = convert_var_tpe(tokens[0])?;
                let width = std::str::from_utf8(tokens[1])
                    .ok()
                    .and_then(|w| w.parse::<u32>().ok())
                    .ok_or_else(|| {
                        VcdParseError::VarLengthParsing(
                            String::from_utf8_lossy(tokens[1]).to_string(),
                            String::from_utf8_lossy(raw_name).to_string(),
                        )
                    })?;
                let (name, index) = parse_name(raw_name, width);
                signals
                    .add_var(var_type, width, tokens[2], &name, index)
                    .map_err(VcdParseError::ConflictingDeclaration)?;
            }
            VcdCmd::Date => meta.date = Some(String::from_utf8_lossy(body).to_string()),
            VcdCmd::Version => meta.version = Some(String::from_utf8_lossy(body).to_string()),
            VcdCmd::Comment => meta.comments.push(String::from_utf8_lossy(body).to_string()),
            VcdCmd::Timescale => meta.timescale = Some(parse_timescale(body)?),
            // attributes carry simulator specific annotations that we do not display
            VcdCmd::Attribute | VcdCmd::AttributeEnd => {}
            VcdCmd::EndDefinitions => break,
        }
    }
    Ok(Header {
        signals: signals.finish(),
        meta,
    })
}

fn parse_timescale(body: &[u8]) -> ParseResult<Timescale> {
    let tokens = find_tokens(body);
    let (factor, unit) = match tokens.as_slice() {
        [token] => {
            // find the first non-numeric character
            match token.iter().position(|c| !c.is_ascii_digit()) {
                None => (*token, &[] as &[u8]),
                Some(pos) => (&token[..pos], &token[pos..]),
            }
        }
        [factor, unit] => (*factor, *unit),
        _ => return Err(unexpected_n_tokens("timescale", &tokens)),
    };
    let factor = std::str::from_utf8(factor)
        .ok()
        .and_then(|f| f.parse::<u32>().ok())
        .ok_or_else(|| VcdParseError::TimescaleFactor(String::from_utf8_lossy(factor).to_string()))?;
    Ok(Timescale::new(factor, convert_timescale_unit(unit)))
}

/// Splits a declared name into the variable name and its bit range. A range whose length
/// does not match the declared width stays part of the name.
fn parse_name(raw_name: &[u8], width: u32) -> (String, Option<VarIndex>) {
    match extract_suffix_index(raw_name) {
        (name, Some(index)) if index.length() == width as u64 => {
            (String::from_utf8_lossy(name).to_string(), Some(index))
        }
        _ => (String::from_utf8_lossy(raw_name).to_string(), None),
    }
}

fn extract_suffix_index(value: &[u8]) -> (&[u8], Option<VarIndex>) {
    use ExtractSuffixIndexState as St;
    let mut state = St::SearchingForClosingBracket;

    for (ii, cc) in value.iter().enumerate().rev() {
        // skip whitespace
        if *cc == b' ' {
            continue;
        }

        state = match state {
            St::SearchingForClosingBracket => {
                if *cc == b']' {
                    St::ParsingLsb(ii, 0, 1)
                } else {
                    return (&value[0..ii + 1], None);
                }
            }
            St::ParsingLsb(end, num, factor) => {
                if cc.is_ascii_digit() || *cc == b'-' {
                    let next = if *cc == b'-' {
                        num.checked_neg().map(|num| (num, factor))
                    } else {
                        push_digit(num, factor, *cc)
                    };
                    match next {
                        Some((num, factor)) => St::ParsingLsb(end, num, factor),
                        // an index that does not fit stays part of the name
                        None => return (&value[0..end + 1], None),
                    }
                } else if *cc == b':' {
                    St::ParsingMsb(end, num, 0, 1)
                } else if *cc == b'[' {
                    St::LookingForName(VarIndex::new(num, num))
                } else {
                    return (&value[0..end + 1], None);
                }
            }
            St::ParsingMsb(end, lsb, num, factor) => {
                if cc.is_ascii_digit() || *cc == b'-' {
                    let next = if *cc == b'-' {
                        num.checked_neg().map(|num| (num, factor))
                    } else {
                        push_digit(num, factor, *cc)
                    };
                    match next {
                        Some((num, factor)) => St::ParsingMsb(end, lsb, num, factor),
                        None => return (&value[0..end + 1], None),
                    }
                } else if *cc == b'[' {
                    St::LookingForName(VarIndex::new(num, lsb))
                } else {
                    return (&value[0..end + 1], None);
                }
            }
            St::LookingForName(index) => {
                // any non-space character means that we found the name
                return (&value[0..ii + 1], Some(index));
            }
        };
    }

    // nothing but an index
    (value, None)
}

/// Adds the next more significant decimal digit. Returns `None` on overflow.
#[inline]
fn push_digit(num: i64, factor: i64, digit: u8) -> Option<(i64, i64)> {
    let num = num.checked_add(((digit - b'0') as i64).checked_mul(factor)?)?;
    Some((num, factor.checked_mul(10)?))
}

#[derive(Debug, Copy, Clone)]
enum ExtractSuffixIndexState {
    SearchingForClosingBracket,
    ParsingLsb(usize, i64, i64),
    ParsingMsb(usize, i64, i64, i64),
    LookingForName(VarIndex),
}

fn convert_timescale_unit(name: &[u8]) -> TimescaleUnit {
    match name {
        b"fs" => TimescaleUnit::FemtoSeconds,
        b"ps" => TimescaleUnit::PicoSeconds,
        b"ns" => TimescaleUnit::NanoSeconds,
        b"us" => TimescaleUnit::MicroSeconds,
        b"ms" => TimescaleUnit::MilliSeconds,
        b"s" => TimescaleUnit::Seconds,
        _ => TimescaleUnit::Unknown,
    }
}

fn convert_var_tpe(tpe: &[u8]) -> ParseResult<VarType> {
    match tpe {
        b"wire" => Ok(VarType::Wire),
        b"reg" => Ok(VarType::Reg),
        b"parameter" => Ok(VarType::Parameter),
        b"integer" => Ok(VarType::Integer),
        b"string" => Ok(VarType::String),
        b"event" => Ok(VarType::Event),
        b"real" => Ok(VarType::Real),
        b"real_parameter" => Ok(VarType::Parameter),
        b"supply0" => Ok(VarType::Supply0),
        b"supply1" => Ok(VarType::Supply1),
        b"time" => Ok(VarType::Time),
        b"tri" => Ok(VarType::Tri),
        b"triand" => Ok(VarType::TriAnd),
        b"trior" => Ok(VarType::TriOr),
        b"trireg" => Ok(VarType::TriReg),
        b"tri0" => Ok(VarType::Tri0),
        b"tri1" => Ok(VarType::Tri1),
        b"wand" => Ok(VarType::WAnd),
        b"wor" => Ok(VarType::WOr),
        b"logic" => Ok(VarType::Logic),
        b"port" => Ok(VarType::Port),
        b"sparray" => Ok(VarType::SparseArray),
        b"realtime" => Ok(VarType::RealTime),
        b"bit" => Ok(VarType::Bit),
        b"int" => Ok(VarType::Int),
        b"shortint" => Ok(VarType::ShortInt),
        b"longint" => Ok(VarType::LongInt),
        b"byte" => Ok(VarType::Byte),
        b"enum" => Ok(VarType::Enum),
        b"shortreal" => Ok(VarType::ShortReal),
        _ => Err(VcdParseError::UnknownVarType(
            String::from_utf8_lossy(tpe).to_string(),
        )),
    }
}

#[inline]
fn unexpected_n_tokens(cmd: &str, tokens: &[&[u8]]) -> VcdParseError {
    VcdParseError::UnexpectedNumberOfTokens(
        cmd.to_string(),
        iter_bytes_to_list_str(tokens.iter()),
    )
}

const VCD_DATE: &[u8] = b"date";
const VCD_TIMESCALE: &[u8] = b"timescale";
const VCD_VAR: &[u8] = b"var";
const VCD_SCOPE: &[u8] = b"scope";
const VCD_UP_SCOPE: &[u8] = b"upscope";
const VCD_COMMENT: &[u8] = b"comment";
const VCD_VERSION: &[u8] = b"version";
const VCD_END_DEFINITIONS: &[u8] = b"enddefinitions";
/// Emitted by some VHDL simulators.
const VCD_ATTRIBUTE_BEGIN: &[u8] = b"attrbegin";
const VCD_ATTRIBUTE_END: &[u8] = b"attrend";
const VCD_COMMANDS: [&[u8]; 10] = [
    VCD_DATE,
    VCD_TIMESCALE,
    VCD_VAR,
    VCD_SCOPE,
    VCD_UP_SCOPE,
    VCD_COMMENT,
    VCD_VERSION,
    VCD_END_DEFINITIONS,
    VCD_ATTRIBUTE_BEGIN,
    VCD_ATTRIBUTE_END,
];

/// Used to show all commands when printing an error message.
fn get_vcd_command_str() -> String {
    iter_bytes_to_list_str(VCD_COMMANDS.iter())
}

fn iter_bytes_to_list_str<'a, I>(bytes: I) -> String
where
    I: Iterator<Item = &'a &'a [u8]>,
{
    bytes
        .map(|c| String::from_utf8_lossy(c))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, PartialEq)]
enum VcdCmd {
    Date,
    Timescale,
    Var,
    Scope,
    UpScope,
    Comment,
    Version,
    EndDefinitions,
    Attribute,
    AttributeEnd,
}

impl VcdCmd {
    fn from_bytes(name: &[u8]) -> Option<Self> {
        match name {
            VCD_VAR => Some(VcdCmd::Var),
            VCD_SCOPE => Some(VcdCmd::Scope),
            VCD_UP_SCOPE => Some(VcdCmd::UpScope),
            VCD_DATE => Some(VcdCmd::Date),
            VCD_TIMESCALE => Some(VcdCmd::Timescale),
            VCD_COMMENT => Some(VcdCmd::Comment),
            VCD_VERSION => Some(VcdCmd::Version),
            VCD_END_DEFINITIONS => Some(VcdCmd::EndDefinitions),
            VCD_ATTRIBUTE_BEGIN => Some(VcdCmd::Attribute),
            VCD_ATTRIBUTE_END => Some(VcdCmd::AttributeEnd),
            _ => None,
        }
    }
}

/// Reads in a command until the `$end`. Uses buf to store the read data.
/// Returns the name and the body of the command.
fn read_command<'a, R: BufRead>(
    input: &mut Input<R>,
    buf: &'a mut Vec<u8>,
) -> ParseResult<(VcdCmd, &'a [u8])> {
    debug_assert!(buf.is_empty());

    let start_char = skip_whitespace(input)?;
    input.command_start = Position {
        line: input.pos.line,
        offset: input.pos.offset - 1,
    };

    if start_char != b'$' {
        return Err(VcdParseError::StartChar(
            String::from_utf8_lossy(&[start_char]).to_string(),
        ));
    }

    read_token(input, buf)?;

    let cmd = VcdCmd::from_bytes(buf).ok_or_else(|| {
        VcdParseError::InvalidCommand(String::from_utf8_lossy(buf).to_string())
    })?;
    buf.clear();

    read_until_end_token(input, buf)?;

    Ok((cmd, &buf[..]))
}

#[inline]
fn find_tokens(line: &[u8]) -> Vec<&[u8]> {
    line.split(|c| is_white_space(*c))
        .filter(|e| !e.is_empty())
        .collect()
}

#[inline]
fn read_until_end_token<R: BufRead>(input: &mut Input<R>, buf: &mut Vec<u8>) -> ParseResult<()> {
    // count how many characters of the $end token we have recognized
    let mut end_index = 0;
    // we skip any whitespace at the beginning, but not between tokens
    let mut skipping_preceding_whitespace = true;
    loop {
        let byte = input.expect_byte()?;
        if skipping_preceding_whitespace {
            if is_white_space(byte) {
                continue;
            }
            skipping_preceding_whitespace = false;
        }
        // we always append and then later drop the `$end` bytes.
        buf.push(byte);
        end_index = match (end_index, byte) {
            (0, b'$') => 1,
            (1, b'e') => 2,
            (2, b'n') => 3,
            (3, b'd') => {
                buf.truncate(buf.len() - 4); // drop $end
                right_strip(buf);
                return Ok(());
            }
            (_, b'$') => 1,
            _ => 0,
        };
    }
}

#[inline]
fn read_token<R: BufRead>(input: &mut Input<R>, buf: &mut Vec<u8>) -> ParseResult<()> {
    loop {
        let byte = input.expect_byte()?;
        if is_white_space(byte) {
            return Ok(());
        }
        buf.push(byte);
    }
}

/// Advances the input until the first non-whitespace character which is then returned.
#[inline]
fn skip_whitespace<R: BufRead>(input: &mut Input<R>) -> ParseResult<u8> {
    loop {
        let byte = input.expect_byte()?;
        if !is_white_space(byte) {
            return Ok(byte);
        }
    }
}

#[inline]
fn right_strip(buf: &mut Vec<u8>) {
    while let Some(&last) = buf.last() {
        if !is_white_space(last) {
            break;
        }
        buf.pop();
    }
}

#[inline]
fn is_white_space(b: u8) -> bool {
    matches!(b, b' ' | b'\n' | b'\r' | b'\t')
}

/// How often (in bytes) the body parser checks the cancel flag and reports progress.
const POLL_INTERVAL: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyEnd {
    Complete,
    /// The stream was interrupted, the reason is reported to the user.
    Truncated(String),
}

trait ParseBodyOutput {
    fn time(&mut self, value: Time, line: u64);
    fn invalid_time(&mut self, token: &[u8], line: u64);
    fn value(&mut self, value: &[u8], id: &[u8], line: u64);
    fn unsupported(&mut self, token: &[u8], line: u64);
}

fn parse_body<R: BufRead>(
    input: &mut Input<R>,
    out: &mut impl ParseBodyOutput,
    cancel: Option<&AtomicBool>,
    progress: Option<&ProgressCount>,
) -> Result<BodyEnd> {
    let mut parser = BodyParser::default();
    loop {
        check_cancelled(cancel)?;
        let consumed = match input.inner.fill_buf() {
            Ok([]) => break,
            Ok(chunk) => {
                let chunk = &chunk[..chunk.len().min(POLL_INTERVAL)];
                for &b in chunk.iter() {
                    if b == b'\n' {
                        input.pos.line += 1;
                    }
                    parser.feed(b, input.pos.line, out);
                }
                chunk.len()
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Ok(BodyEnd::Truncated(e.to_string())),
        };
        input.inner.consume(consumed);
        input.pos.offset += consumed as u64;
        if let Some(p) = progress {
            p.fetch_add(consumed as u64, Ordering::Relaxed);
        }
    }
    Ok(parser.finish(out))
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
enum BodyState {
    #[default]
    ParsingFirstToken,
    ParsingIdToken,
    LookingForEndToken,
}

#[derive(Default)]
struct BodyParser {
    state: BodyState,
    first: Vec<u8>,
    id: Vec<u8>,
    /// line on which the current entry started
    line: u64,
}

impl BodyParser {
    #[inline]
    fn feed(&mut self, b: u8, line: u64, out: &mut impl ParseBodyOutput) {
        match self.state {
            BodyState::ParsingFirstToken => {
                if is_white_space(b) {
                    if !self.first.is_empty() {
                        self.state = self.first_token_done(out);
                        if self.state != BodyState::ParsingIdToken {
                            self.first.clear();
                        }
                    }
                } else {
                    if self.first.is_empty() {
                        self.line = line;
                    }
                    self.first.push(b);
                }
            }
            BodyState::ParsingIdToken => {
                if is_white_space(b) {
                    if !self.id.is_empty() {
                        out.value(&self.first, &self.id, self.line);
                        self.first.clear();
                        self.id.clear();
                        self.state = BodyState::ParsingFirstToken;
                    }
                } else {
                    self.id.push(b);
                }
            }
            BodyState::LookingForEndToken => {
                if is_white_space(b) {
                    if !self.first.is_empty() {
                        if self.first == b"$end" {
                            self.state = BodyState::ParsingFirstToken;
                        }
                        self.first.clear();
                    }
                } else {
                    self.first.push(b);
                }
            }
        }
    }

    fn first_token_done(&mut self, out: &mut impl ParseBodyOutput) -> BodyState {
        match parse_first_token(&self.first) {
            FirstTokenResult::Time(value) => {
                out.time(value, self.line);
                BodyState::ParsingFirstToken
            }
            FirstTokenResult::InvalidTime => {
                out.invalid_time(&self.first, self.line);
                BodyState::ParsingFirstToken
            }
            FirstTokenResult::OneBitValue => {
                out.value(&self.first[0..1], &self.first[1..], self.line);
                BodyState::ParsingFirstToken
            }
            FirstTokenResult::MultiBitValue => BodyState::ParsingIdToken,
            FirstTokenResult::CommentStart => BodyState::LookingForEndToken,
            FirstTokenResult::IgnoredCmd => BodyState::ParsingFirstToken,
            FirstTokenResult::Unexpected => {
                out.unsupported(&self.first, self.line);
                BodyState::ParsingFirstToken
            }
        }
    }

    /// Called at the end of the stream.
    fn finish(mut self, out: &mut impl ParseBodyOutput) -> BodyEnd {
        match self.state {
            BodyState::ParsingFirstToken => {
                if !self.first.is_empty() {
                    match parse_first_token(&self.first) {
                        FirstTokenResult::MultiBitValue => {
                            return BodyEnd::Truncated(format!(
                                "value `{}` without identifier",
                                String::from_utf8_lossy(&self.first)
                            ))
                        }
                        FirstTokenResult::CommentStart => {
                            return BodyEnd::Truncated("unterminated `$comment`".to_string())
                        }
                        _ => {
                            self.first_token_done(out);
                        }
                    }
                }
                BodyEnd::Complete
            }
            BodyState::ParsingIdToken => {
                if self.id.is_empty() {
                    BodyEnd::Truncated(format!(
                        "value `{}` without identifier",
                        String::from_utf8_lossy(&self.first)
                    ))
                } else {
                    out.value(&self.first, &self.id, self.line);
                    BodyEnd::Complete
                }
            }
            BodyState::LookingForEndToken => {
                BodyEnd::Truncated("unterminated `$comment`".to_string())
            }
        }
    }
}

enum FirstTokenResult {
    Time(Time),
    InvalidTime,
    OneBitValue,
    MultiBitValue,
    CommentStart,
    IgnoredCmd,
    Unexpected,
}

fn parse_first_token(token: &[u8]) -> FirstTokenResult {
    match token[0] {
        b'#' => match parse_time(&token[1..]) {
            Some(value) => FirstTokenResult::Time(value),
            None => FirstTokenResult::InvalidTime,
        },
        b'0' | b'1' | b'z' | b'Z' | b'x' | b'X' | b'h' | b'H' | b'u' | b'U' | b'w' | b'W'
        | b'l' | b'L' | b'-' => FirstTokenResult::OneBitValue,
        b'b' | b'B' | b'r' | b'R' | b's' | b'S' => FirstTokenResult::MultiBitValue,
        _ => match token {
            b"$comment" => FirstTokenResult::CommentStart,
            b"$dumpvars" | b"$dumpall" | b"$end" | b"$dumpoff" | b"$dumpon" => {
                FirstTokenResult::IgnoredCmd
            }
            _ => FirstTokenResult::Unexpected,
        },
    }
}

/// Integer time, or a float without fractional part.
fn parse_time(value: &[u8]) -> Option<Time> {
    let value_str = std::str::from_utf8(value).ok()?;
    match value_str.parse::<u64>() {
        Ok(val) => Some(val),
        Err(_) => {
            let val = value_str.parse::<f64>().ok()?;
            (val.fract() == 0.0 && val >= 0.0 && val <= u64::MAX as f64).then_some(val as u64)
        }
    }
}

/// Collects warnings and value changes into one timeline per distinct symbol.
struct TraceBuilder<'a> {
    signals: &'a SignalTable,
    timelines: Vec<TimelineBuilder>,
    time: Time,
    /// set after a bad or backwards time marker until time advances again
    skipping: bool,
    warnings: Vec<LoadWarning>,
    warning_count: usize,
    max_warnings: usize,
    // scratch buffers
    bits: Vec<u8>,
    coerced: Vec<u8>,
}

struct BodyResult {
    timelines: Vec<crate::timeline::Timeline>,
    end_time: Time,
    warnings: Vec<LoadWarning>,
    warning_count: usize,
    partial: bool,
}

impl<'a> TraceBuilder<'a> {
    fn new(signals: &'a SignalTable, max_warnings: usize) -> Self {
        let timelines = signals
            .timeline_widths()
            .iter()
            .map(|w| TimelineBuilder::new(*w))
            .collect();
        Self {
            signals,
            timelines,
            time: 0,
            skipping: false,
            warnings: vec![],
            warning_count: 0,
            max_warnings,
            bits: Vec::with_capacity(64),
            coerced: Vec::with_capacity(64),
        }
    }

    fn warn(&mut self, warning: LoadWarning) {
        self.warning_count += 1;
        if self.warnings.len() < self.max_warnings {
            self.warnings.push(warning);
        }
    }

    fn finish(mut self, end: BodyEnd) -> BodyResult {
        let partial = match end {
            BodyEnd::Complete => false,
            BodyEnd::Truncated(reason) => {
                let last_time = self.time;
                self.warning_count += 1;
                self.warnings
                    .push(LoadWarning::TruncatedStream { last_time, reason });
                true
            }
        };
        BodyResult {
            timelines: self.timelines.into_iter().map(|t| t.finish()).collect(),
            end_time: self.time,
            warnings: self.warnings,
            warning_count: self.warning_count,
            partial,
        }
    }
}

impl ParseBodyOutput for TraceBuilder<'_> {
    #[inline]
    fn time(&mut self, value: Time, line: u64) {
        if value < self.time {
            let previous = self.time;
            self.warn(LoadWarning::BackwardsTime {
                line,
                previous,
                time: value,
            });
            self.skipping = true;
        } else {
            self.time = value;
            self.skipping = false;
        }
    }

    fn invalid_time(&mut self, token: &[u8], line: u64) {
        self.unsupported(token, line);
        self.skipping = true;
    }

    #[inline]
    fn value(&mut self, value: &[u8], id: &[u8], line: u64) {
        if self.skipping {
            return;
        }
        let signals = self.signals;
        let Some(signal_ref) = signals.lookup_symbol(id) else {
            self.warn(LoadWarning::UnknownSymbolReference {
                line,
                id: String::from_utf8_lossy(id).to_string(),
            });
            return;
        };
        let signal = &signals[signal_ref];
        let width = signal.width();

        let (raw, is_vector) = match value[0] {
            b'b' | b'B' => (&value[1..], true),
            b'r' | b'R' | b's' | b'S' => {
                let token = format!(
                    "{} {}",
                    String::from_utf8_lossy(value),
                    String::from_utf8_lossy(id)
                );
                self.warn(LoadWarning::UnsupportedValue { line, token });
                return;
            }
            _ => (value, false),
        };

        self.bits.clear();
        if !normalize_bits(raw, &mut self.bits) {
            let token = format!(
                "{} {}",
                String::from_utf8_lossy(value),
                String::from_utf8_lossy(id)
            );
            self.warn(LoadWarning::UnsupportedValue { line, token });
            return;
        }

        if is_vector && self.bits.len() != width as usize {
            let warning = LoadWarning::WidthMismatch {
                line,
                path: signal.path().to_string(),
                expected: width,
                actual: self.bits.len() as u32,
            };
            self.warn(warning);
        }
        self.coerced.clear();
        coerce_width(&self.bits, width as usize, &mut self.coerced);
        self.timelines[signal.timeline_index()].add_change(self.time, &self.coerced);
    }

    fn unsupported(&mut self, token: &[u8], line: u64) {
        self.warn(LoadWarning::UnsupportedValue {
            line,
            token: String::from_utf8_lossy(token).to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::BusFormat;
    use std::io::Read;

    impl ParseBodyOutput for Vec<String> {
        fn time(&mut self, value: Time, _line: u64) {
            self.push(format!("Time({value})"));
        }

        fn invalid_time(&mut self, token: &[u8], line: u64) {
            self.push(format!("InvalidTime({}, {line})", String::from_utf8_lossy(token)));
        }

        fn value(&mut self, value: &[u8], id: &[u8], _line: u64) {
            self.push(format!(
                "{} = {}",
                String::from_utf8_lossy(id),
                String::from_utf8_lossy(value)
            ));
        }

        fn unsupported(&mut self, token: &[u8], line: u64) {
            self.push(format!("Unsupported({}, {line})", String::from_utf8_lossy(token)));
        }
    }

    fn read_body_to_vec(input: &[u8]) -> (Vec<String>, BodyEnd) {
        let mut out = Vec::new();
        let mut inp = Input::new(input);
        let end = parse_body(&mut inp, &mut out, None, None).unwrap();
        (out, end)
    }

    fn load_str(input: &str) -> Result<Trace> {
        load(input.as_bytes(), &LoadOptions::default(), None, None)
    }

    const CLK_ADDR: &str = r#"$timescale 1ns $end
$scope module top $end
$var wire 1 ! clk $end
$var wire 8 # addr [7:0] $end
$upscope $end
$enddefinitions $end
#0
0!
b00000011 #
#5
1!
#10
0!
b00000100 #
#20
"#;

    #[test]
    fn test_read_body() {
        let input = r#"
1I,!
1J,!
1#2!
#2678437829
b00 D2!
b0000 d2!
b11 e2!
x(i"
$comment this is ignored $end
$dumpvars
0j2!
$end
r1.5 R!"#;
        let expected = vec![
            "I,! = 1",
            "J,! = 1",
            "#2! = 1",
            "Time(2678437829)",
            "D2! = b00",
            "d2! = b0000",
            "e2! = b11",
            "(i\" = x",
            "j2! = 0",
            "R! = r1.5",
        ];
        let (res, end) = read_body_to_vec(input.as_bytes());
        assert_eq!(res, expected);
        assert_eq!(end, BodyEnd::Complete);
    }

    #[test]
    fn test_read_body_bad_tokens() {
        let (res, _) = read_body_to_vec(b"#1\n#abc\nQ!\n#2.0\n");
        assert_eq!(
            res,
            ["Time(1)", "InvalidTime(#abc, 2)", "Unsupported(Q!, 3)", "Time(2)"]
        );
    }

    #[test]
    fn test_read_body_truncated() {
        let (_, end) = read_body_to_vec(b"#1\nb1010");
        assert!(matches!(end, BodyEnd::Truncated(_)));
        let (_, end) = read_body_to_vec(b"#1\nb1010 ");
        assert!(matches!(end, BodyEnd::Truncated(_)));
        let (_, end) = read_body_to_vec(b"#1\n$comment never ends");
        assert!(matches!(end, BodyEnd::Truncated(_)));
        // a missing trailing newline is fine
        let (res, end) = read_body_to_vec(b"#1\nb1010 !");
        assert_eq!(end, BodyEnd::Complete);
        assert_eq!(res.last().unwrap(), "! = b1010");
    }

    #[test]
    fn test_read_command() {
        let mut buf = Vec::with_capacity(128);
        let mut input_0 = Input::new(b"$upscope $end".as_slice());
        let (cmd_0, body_0) = read_command(&mut input_0, &mut buf).unwrap();
        assert_eq!(cmd_0, VcdCmd::UpScope);
        assert!(body_0.is_empty());

        // test with more whitespace
        buf.clear();
        let mut input_1 = Input::new(b" \t $upscope \n $end  \n ".as_slice());
        let (cmd_1, body_1) = read_command(&mut input_1, &mut buf).unwrap();
        assert_eq!(cmd_1, VcdCmd::UpScope);
        assert!(body_1.is_empty());

        buf.clear();
        let mut input_2 = Input::new(b"$comment\n  costs $$ $end".as_slice());
        let (cmd_2, body_2) = read_command(&mut input_2, &mut buf).unwrap();
        assert_eq!(cmd_2, VcdCmd::Comment);
        assert_eq!(body_2, b"costs $$");
    }

    fn do_test_parse_name(width: u32, full_name: &str, name: &str, index: Option<(i64, i64)>) {
        let (a_name, a_index) = parse_name(full_name.as_bytes(), width);
        assert_eq!(a_name, name);
        assert_eq!(a_index.map(|i| (i.msb(), i.lsb())), index);
    }

    #[test]
    fn test_parse_name() {
        do_test_parse_name(32, "test", "test", None);
        do_test_parse_name(1, "test[0]", "test", Some((0, 0)));
        do_test_parse_name(1, "test [0]", "test", Some((0, 0)));
        do_test_parse_name(2, "test[1:0]", "test", Some((1, 0)));
        do_test_parse_name(2, "test [1:0]", "test", Some((1, 0)));
        do_test_parse_name(3, "test[1:-1]", "test", Some((1, -1)));
        do_test_parse_name(11, "test [10:0]", "test", Some((10, 0)));
        // a range that does not match the width is part of the name
        do_test_parse_name(32, "mem[3]", "mem[3]", None);
        // ranges that do not fit into an i64 or a u32 width
        do_test_parse_name(1, "sig[123456789012345678901234]", "sig[123456789012345678901234]", None);
        do_test_parse_name(32, "sig[4294967295:0]", "sig[4294967295:0]", None);
        do_test_parse_name(1, "sig[-999999999999999999:999999999999999999]", "sig[-999999999999999999:999999999999999999]", None);
    }

    #[test]
    fn test_oversized_index_is_part_of_name() {
        let input = "$scope module top $end\n\
            $var wire 1 ! sig[123456789012345678901234] $end\n\
            $var wire 32 \" bus[4294967295:0] $end\n\
            $upscope $end $enddefinitions $end\n#0\n1!\n";
        let trace = load_str(input).unwrap();
        let sig = trace.signal_by_path("top.sig[123456789012345678901234]").unwrap();
        assert_eq!(trace.signal(sig).unwrap().width(), 1);
        assert_eq!(trace.value_at(sig, 0).unwrap().to_string(), "1");
        let bus = trace.signal_by_path("top.bus[4294967295:0]").unwrap();
        assert_eq!(trace.signal(bus).unwrap().index(), None);
    }

    #[test]
    fn test_timescale_forms() {
        assert_eq!(
            parse_timescale(b"1ns").unwrap(),
            Timescale::new(1, TimescaleUnit::NanoSeconds)
        );
        assert_eq!(
            parse_timescale(b"10 ps").unwrap(),
            Timescale::new(10, TimescaleUnit::PicoSeconds)
        );
        assert!(parse_timescale(b"ns").is_err());
        assert!(parse_timescale(b"1 2 3").is_err());
    }

    #[test]
    fn test_clk_addr_scenario() {
        let trace = load_str(CLK_ADDR).unwrap();
        assert_eq!(
            trace.timescale(),
            Some(Timescale::new(1, TimescaleUnit::NanoSeconds))
        );
        assert_eq!(trace.end_time(), 20);
        assert!(!trace.is_partial());
        assert!(trace.warnings().is_empty());

        let clk = trace.signal_by_path("top.clk").unwrap();
        assert_eq!(trace.value_at(clk, 7).unwrap().to_string(), "1");

        let addr = trace.signal_by_path("top.addr").unwrap();
        let changes: Vec<_> = trace
            .changes_in_range(addr, 0, 20)
            .unwrap()
            .map(|c| (c.time, c.value.format(BusFormat::Unsigned)))
            .collect();
        assert_eq!(changes, [(0, "3".to_string()), (10, "4".to_string())]);
    }

    #[test]
    fn test_dedup_on_load() {
        let input = "$var wire 1 a sig $end $enddefinitions $end\n#0\n1a\n#5\n1a\n#10\n0a\n";
        let trace = load_str(input).unwrap();
        let sig = trace.signal_by_path("sig").unwrap();
        assert_eq!(trace.timeline(sig).unwrap().times(), [0, 10]);
    }

    #[test]
    fn test_changes_before_first_marker_apply_at_zero() {
        let input = "$var wire 1 a sig $end $enddefinitions $end\n$dumpvars\n1a\n$end\n#3\n0a\n";
        let trace = load_str(input).unwrap();
        let sig = trace.signal_by_path("sig").unwrap();
        assert_eq!(trace.timeline(sig).unwrap().times(), [0, 3]);
        assert_eq!(trace.value_at(sig, 0).unwrap().to_string(), "1");
    }

    #[test]
    fn test_unknown_symbol() {
        let input = "$var wire 1 a sig $end $enddefinitions $end\n#0\n1a\n1?\n";
        let trace = load_str(input).unwrap();
        assert_eq!(
            trace.warnings(),
            [LoadWarning::UnknownSymbolReference {
                line: 4,
                id: "?".to_string()
            }]
        );
        assert!(!trace.is_partial());
    }

    #[test]
    fn test_width_mismatch() {
        let input = "$var wire 4 a bus $end $enddefinitions $end\n#0\nb1 a\n#1\nbx a\n#2\nb110011 a\n#3\n1a\n";
        let trace = load_str(input).unwrap();
        let bus = trace.signal_by_path("bus").unwrap();
        assert_eq!(trace.value_at(bus, 0).unwrap().to_string(), "0001");
        assert_eq!(trace.value_at(bus, 1).unwrap().to_string(), "xxxx");
        assert_eq!(trace.value_at(bus, 2).unwrap().to_string(), "0011");
        // scalar change to a bus is extended without a warning
        assert_eq!(trace.value_at(bus, 3).unwrap().to_string(), "0001");
        assert_eq!(trace.warning_count(), 3);
        assert_eq!(
            trace.warnings()[0],
            LoadWarning::WidthMismatch {
                line: 3,
                path: "bus".to_string(),
                expected: 4,
                actual: 1
            }
        );
    }

    #[test]
    fn test_nine_state_values() {
        let input = "$var wire 4 a bus $end $enddefinitions $end\n#0\nbHLUZ a\n";
        let trace = load_str(input).unwrap();
        let bus = trace.signal_by_path("bus").unwrap();
        assert_eq!(trace.value_at(bus, 0).unwrap().to_string(), "10xz");
    }

    #[test]
    fn test_truncated_stream() {
        let input = "$var wire 4 a bus $end $enddefinitions $end\n#0\nb0001 a\n#7\nb0011";
        let trace = load_str(input).unwrap();
        assert!(trace.is_partial());
        assert_eq!(trace.end_time(), 7);
        assert!(matches!(
            trace.warnings(),
            [LoadWarning::TruncatedStream { last_time: 7, .. }]
        ));
        let bus = trace.signal_by_path("bus").unwrap();
        assert_eq!(trace.value_at(bus, 100).unwrap().to_string(), "0001");
    }

    /// Delivers some bytes, then fails like a dropped connection.
    struct FailingReader {
        data: &'static [u8],
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.data.is_empty() {
                return Err(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "connection reset",
                ));
            }
            let n = self.data.read(buf)?;
            Ok(n)
        }
    }

    #[test]
    fn test_io_error_in_body_is_partial() {
        let input = FailingReader {
            data: b"$var wire 1 a sig $end $enddefinitions $end\n#0\n1a\n#4\n0a\n",
        };
        let trace = load(
            std::io::BufReader::new(input),
            &LoadOptions::default(),
            None,
            None,
        )
        .unwrap();
        assert!(trace.is_partial());
        assert_eq!(trace.end_time(), 4);
    }

    #[test]
    fn test_io_error_in_header_is_network_failure() {
        let input = FailingReader {
            data: b"$var wire 1 a sig $end\n",
        };
        let err = load(
            std::io::BufReader::new(input),
            &LoadOptions::default(),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, WaveError::NetworkFailure(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_malformed_header() {
        let input = "$timescale 1ns $end\n$scope module top $end\n  $wibble $end\n";
        match load_str(input).unwrap_err() {
            WaveError::MalformedHeader { line, offset, .. } => {
                assert_eq!(line, 3);
                assert_eq!(offset, 45);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let missing_end = "$var wire 1 a sig $end\n#0\n1a\n";
        assert!(matches!(
            load_str(missing_end),
            Err(WaveError::MalformedHeader { .. })
        ));

        let bad_width = "$var wire eight a sig $end $enddefinitions $end\n";
        assert!(matches!(
            load_str(bad_width),
            Err(WaveError::MalformedHeader { line: 1, offset: 0, .. })
        ));

        let bad_type = "$var wobble 1 a sig $end $enddefinitions $end\n";
        assert!(matches!(
            load_str(bad_type),
            Err(WaveError::MalformedHeader { .. })
        ));

        let conflicting = "$var wire 1 a sig $end\n$var wire 2 b sig $end\n$enddefinitions $end\n";
        assert!(matches!(
            load_str(conflicting),
            Err(WaveError::MalformedHeader { line: 2, .. })
        ));
    }

    #[test]
    fn test_backwards_time() {
        let input = "$var wire 1 a sig $end $enddefinitions $end\n#0\n0a\n#10\n1a\n#5\n0a\n#12\n0a\n";
        let trace = load_str(input).unwrap();
        let sig = trace.signal_by_path("sig").unwrap();
        assert_eq!(trace.timeline(sig).unwrap().times(), [0, 10, 12]);
        assert_eq!(trace.value_at(sig, 11).unwrap().to_string(), "1");
        assert_eq!(trace.end_time(), 12);
        assert_eq!(
            trace.warnings(),
            [LoadWarning::BackwardsTime {
                line: 6,
                previous: 10,
                time: 5
            }]
        );
    }

    #[test]
    fn test_aliases() {
        let input = r#"$scope module top $end
$var wire 1 ! clk $end
$scope module sub $end
$var wire 1 ! clk_in $end
$upscope $end
$upscope $end
$enddefinitions $end
#0
0!
#1
1!
"#;
        let trace = load_str(input).unwrap();
        let a = trace.signal_by_path("top.clk").unwrap();
        let b = trace.signal_by_path("top.sub.clk_in").unwrap();
        assert_ne!(a, b);
        assert_eq!(trace.timeline(a).unwrap().times(), [0, 1]);
        assert_eq!(trace.timeline(b).unwrap().times(), [0, 1]);
    }

    #[test]
    fn test_real_values_are_skipped() {
        let input = "$var real 64 r temp $end $enddefinitions $end\n#0\nr1.5 r\n";
        let trace = load_str(input).unwrap();
        assert!(matches!(
            trace.warnings(),
            [LoadWarning::UnsupportedValue { line: 3, .. }]
        ));
        let temp = trace.signal_by_path("temp").unwrap();
        assert!(trace.timeline(temp).unwrap().is_empty());
    }

    #[test]
    fn test_warning_cap() {
        let mut input = "$var wire 1 a sig $end $enddefinitions $end\n#0\n".to_string();
        for _ in 0..20 {
            input.push_str("1?\n");
        }
        let options = LoadOptions {
            max_warnings: 5,
            ..Default::default()
        };
        let trace = load(input.as_bytes(), &options, None, None).unwrap();
        assert_eq!(trace.warnings().len(), 5);
        assert_eq!(trace.warning_count(), 20);

        // a cut off tail is reported even when the cap is reached
        input.push_str("#7\nb0011");
        let trace = load(input.as_bytes(), &options, None, None).unwrap();
        assert!(trace.is_partial());
        assert_eq!(trace.warning_count(), 21);
        assert_eq!(trace.warnings().len(), 6);
        assert!(matches!(
            trace.warnings().last(),
            Some(LoadWarning::TruncatedStream { last_time: 7, .. })
        ));
    }

    #[test]
    fn test_cancelled() {
        let cancel = AtomicBool::new(true);
        let res = load(
            CLK_ADDR.as_bytes(),
            &LoadOptions::default(),
            Some(&cancel),
            None,
        );
        assert!(matches!(res, Err(WaveError::Cancelled)));
    }

    #[test]
    fn test_progress_counts_all_bytes() {
        let progress = ProgressCount::default();
        load(
            CLK_ADDR.as_bytes(),
            &LoadOptions::default(),
            None,
            Some(progress.clone()),
        )
        .unwrap();
        assert_eq!(
            progress.load(Ordering::SeqCst),
            CLK_ADDR.len() as u64
        );
    }

    #[test]
    fn test_header_meta() {
        let input = "$date today $end\n$version sim 1.0 $end\n$comment first $end\n$enddefinitions $end\n";
        let header = read_header(input.as_bytes(), &LoadOptions::default()).unwrap();
        assert_eq!(header.meta.date.as_deref(), Some("today"));
        assert_eq!(header.meta.version.as_deref(), Some("sim 1.0"));
        assert_eq!(header.meta.comments, ["first"]);
        assert!(header.signals.is_empty());
        assert_eq!(header.meta.timescale, None);
    }
}
