//! Command-line grammar
//!
//! ```text
//! qdmactl dev list
//! qdmactl qdma[vf]<N>
//! qdmactl qdma[vf]<N> reg dump
//! qdmactl qdma[vf]<N> reg read [bar <N>] <addr>
//! qdmactl qdma[vf]<N> reg write [bar <N>] <addr> <val>
//! qdmactl qdma[vf]<N> q list
//! qdmactl qdma[vf]<N> q add idx <N> [mode <mm|st>] [dir <h2c|c2h>] [cdev <0|1>]
//!                           [ringsz <N>] [bufsz <N>] [wrbsz <0|1|2|3>]
//! qdmactl qdma[vf]<N> q start|stop|del idx <N> [dir <h2c|c2h>]
//! qdmactl qdma[vf]<N> q dump idx <N> [dir <h2c|c2h>] [desc <x> <y> | wrb <x> <y>]
//! ```
//!
//! Numbers take a `0x` prefix for hex and a leading `0` for octal.

use core::fmt;

use qdma_nl::{Attrs, AttrType, Op, QueueFlags, WrbDescSize};

pub const USAGE: &str = "\
Usage: qdmactl [-v]... [dev|qdma[vf]<N>] [operation]
\tdev [operation]: system wide FPGA operations
\t\tlist                             list all qdma functions
\tqdma[N] [operation]: per QDMA FPGA operations
\t\tq list                           list all queues
\t\tq add idx <N> [mode <mm|st>] [dir <h2c|c2h>] [cdev <0|1>]
\t\t      [ringsz <N>] [bufsz <N>] [wrbsz <0|1|2|3>]
\t\t                                 add a queue
\t\t                                    *mode default to mm
\t\t                                    *dir default to h2c
\t\tq start idx <N> [dir <h2c|c2h>]  start a queue
\t\tq stop idx <N> [dir <h2c|c2h>]   stop a queue
\t\tq del idx <N> [dir <h2c|c2h>]    delete a queue
\t\tq dump idx <N> [dir <h2c|c2h>]   dump queue param
\t\tq dump idx <N> [dir <h2c|c2h>] desc <x> <y>
\t\t                                 dump desc ring entry x ~ y
\t\tq dump idx <N> [dir <h2c|c2h>] wrb <x> <y>
\t\t                                 dump wrb ring entry x ~ y
\t\treg dump                         register dump
\t\treg read [bar <N>] <addr>        read a register
\t\treg write [bar <N>] <addr> <val> write a register
";

/// Write-back descriptor size used for ST C2H queues when none is given.
pub const WRBSZ_DEFAULT: u32 = WrbDescSize::Reserved as u32;

/// Command-line error; always a usage error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing to do
    Empty,
    MissingValue(&'static str),
    BadInteger(String),
    BadDevice(String),
    UnknownWord(String),
    BadValue { param: &'static str, value: String },
    MissingParam(&'static str),
    Conflict(&'static str),
    BadRange { start: u32, end: u32 },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "no command given"),
            ParseError::MissingValue(after) => write!(f, "missing parameter after \"{}\"", after),
            ParseError::BadInteger(s) => write!(f, "bad parameter \"{}\", integer expected", s),
            ParseError::BadDevice(s) => write!(f, "bad interface name {}, expect qdma<N>", s),
            ParseError::UnknownWord(s) => write!(f, "unexpected parameter \"{}\"", s),
            ParseError::BadValue { param, value } => write!(f, "unknown q {} {}", param, value),
            ParseError::MissingParam(p) => write!(f, "missing q parameter {}", p),
            ParseError::Conflict(what) => write!(f, "{} cannot be combined", what),
            ParseError::BadRange { start, end } => write!(f, "invalid range {} ~ {}", start, end),
        }
    }
}

impl std::error::Error for ParseError {}

pub type Result<T, E = ParseError> = core::result::Result<T, E>;

/// `qdma<N>` or `qdmavf<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub vf: bool,
    pub idx: u32,
}

impl Target {
    pub fn parse(name: &str) -> Result<Self> {
        let bad = || ParseError::BadDevice(name.to_owned());
        if name.len() >= 10 {
            return Err(bad());
        }
        let rest = name.strip_prefix("qdma").ok_or_else(bad)?;
        let (vf, digits) = match rest.strip_prefix("vf") {
            Some(digits) => (true, digits),
            None => (false, rest),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let idx = digits.parse().map_err(|_| bad())?;
        Ok(Target { vf, idx })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qdma{}{}", if self.vf { "vf" } else { "" }, self.idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegCmd {
    Dump,
    Read { bar: Option<u8>, addr: u32 },
    Write { bar: Option<u8>, addr: u32, val: u32 },
}

/// Queue parameters collected from `q` sub-commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueParams {
    pub qidx: u32,
    pub flags: QueueFlags,
    pub ring_size: Option<u32>,
    pub buf_size: Option<u32>,
    pub wrb_desc_size: Option<u32>,
    pub range: Option<(u32, u32)>,
}

impl QueueParams {
    /// Request attributes for `op` on device `idx`.
    pub fn attrs(&self, op: Op, idx: u32) -> Attrs {
        let mut attrs = Attrs::new().with_u32(AttrType::DevIdx, idx);
        if op == Op::QList {
            return attrs;
        }
        attrs.set_u32(AttrType::QIdx, self.qidx);
        attrs.set_u32(AttrType::QFlag, self.flags.bits());
        if op == Op::QAdd {
            attrs.set_u32(AttrType::QRngSz, self.ring_size.unwrap_or(0));
            attrs.set_u32(AttrType::QBufSz, self.buf_size.unwrap_or(0));
            if let Some(sz) = self.wrb_desc_size {
                attrs.set_u32(AttrType::WrbDescSize, sz);
            }
        }
        if let Some((start, end)) = self.range {
            attrs.set_u32(AttrType::RangeStart, start);
            attrs.set_u32(AttrType::RangeEnd, end);
        }
        attrs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Version,
    DevList,
    DevInfo(Target),
    Reg(Target, RegCmd),
    Queue {
        target: Target,
        op: Op,
        params: QueueParams,
    },
}

/// Parse everything after the program name and flags.
pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Command> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let mut words = Words {
        args: &args,
        pos: 0,
    };

    let cmd = match words.next() {
        None => return Err(ParseError::Empty),
        Some("?" | "-h" | "help" | "--help") => Command::Help,
        Some("--version") => Command::Version,
        Some("dev") => match words.next() {
            Some("list") => Command::DevList,
            Some(other) => return Err(ParseError::UnknownWord(other.to_owned())),
            None => return Err(ParseError::MissingValue("dev")),
        },
        Some(name) => {
            let target = Target::parse(name)?;
            match words.next() {
                None => Command::DevInfo(target),
                Some("reg") => Command::Reg(target, parse_reg(&mut words)?),
                Some("q") => {
                    let (op, params) = parse_queue(&mut words)?;
                    Command::Queue { target, op, params }
                }
                Some(other) => return Err(ParseError::UnknownWord(other.to_owned())),
            }
        }
    };

    match words.next() {
        Some(extra) => Err(ParseError::UnknownWord(extra.to_owned())),
        None => Ok(cmd),
    }
}

struct Words<'a> {
    args: &'a [&'a str],
    pos: usize,
}

impl<'a> Words<'a> {
    fn next(&mut self) -> Option<&'a str> {
        let word = self.args.get(self.pos).copied();
        if word.is_some() {
            self.pos += 1;
        }
        word
    }

    fn peek(&self) -> Option<&'a str> {
        self.args.get(self.pos).copied()
    }

    fn value(&mut self, after: &'static str) -> Result<&'a str> {
        self.next().ok_or(ParseError::MissingValue(after))
    }

    fn int(&mut self, after: &'static str) -> Result<u32> {
        parse_int(self.value(after)?)
    }
}

/// `strtoul(s, _, 0)` without the silent truncation.
pub fn parse_int(s: &str) -> Result<u32> {
    let bad = || ParseError::BadInteger(s.to_owned());
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() || digits.starts_with('+') {
        return Err(bad());
    }
    u32::from_str_radix(digits, radix).map_err(|_| bad())
}

fn parse_reg(words: &mut Words<'_>) -> Result<RegCmd> {
    let verb = words.value("reg")?;
    match verb {
        "dump" => Ok(RegCmd::Dump),
        "read" | "write" => {
            let mut bar = None;
            if words.peek() == Some("bar") {
                words.next();
                let n = words.int("bar")?;
                bar = Some(u8::try_from(n).map_err(|_| ParseError::BadInteger(n.to_string()))?);
            }
            let addr = words.int(if verb == "read" { "read" } else { "write" })?;
            if verb == "read" {
                Ok(RegCmd::Read { bar, addr })
            } else {
                let val = words.int("addr")?;
                Ok(RegCmd::Write { bar, addr, val })
            }
        }
        other => Err(ParseError::UnknownWord(other.to_owned())),
    }
}

fn parse_queue(words: &mut Words<'_>) -> Result<(Op, QueueParams)> {
    let op = match words.value("q")? {
        "list" => return Ok((Op::QList, QueueParams::default())),
        "add" => Op::QAdd,
        "start" => Op::QStart,
        "stop" => Op::QStop,
        "del" => Op::QDel,
        "dump" => Op::QDump,
        other => return Err(ParseError::UnknownWord(other.to_owned())),
    };

    let mut params = QueueParams::default();
    let mut qidx = None;
    let mut mode = None;
    let mut dir = None;
    let mut desc = None;
    let mut wrb = None;

    while let Some(word) = words.next() {
        match word {
            "idx" => qidx = Some(words.int("idx")?),
            "mode" => {
                mode = Some(match words.value("mode")? {
                    "mm" => QueueFlags::MODE_MM,
                    "st" => QueueFlags::MODE_ST,
                    other => return Err(bad_value("mode", other)),
                })
            }
            "dir" => {
                dir = Some(match words.value("dir")? {
                    "h2c" => QueueFlags::DIR_H2C,
                    "c2h" => QueueFlags::DIR_C2H,
                    other => return Err(bad_value("dir", other)),
                })
            }
            "cdev" => match words.int("cdev")? {
                0 => params.flags.remove(QueueFlags::CDEV),
                1 => params.flags.insert(QueueFlags::CDEV),
                n => return Err(bad_value("cdev", &n.to_string())),
            },
            "ringsz" => params.ring_size = Some(words.int("ringsz")?),
            "bufsz" => params.buf_size = Some(words.int("bufsz")?),
            "wrbsz" => {
                let sz = words.int("wrbsz")?;
                if WrbDescSize::from_u32(sz).is_none() {
                    return Err(bad_value("wrbsz", &sz.to_string()));
                }
                params.wrb_desc_size = Some(sz);
            }
            "desc" => desc = Some(range(words, "desc")?),
            "wrb" => wrb = Some(range(words, "wrb")?),
            other => return Err(ParseError::UnknownWord(other.to_owned())),
        }
    }

    params.qidx = qidx.ok_or(ParseError::MissingParam("idx"))?;
    params.flags |= mode.unwrap_or(QueueFlags::MODE_MM) | dir.unwrap_or(QueueFlags::DIR_H2C);

    let op = match (op, desc, wrb) {
        (Op::QDump, Some(_), Some(_)) => return Err(ParseError::Conflict("dump wrb/desc")),
        (Op::QDump, Some(r), None) => {
            params.range = Some(r);
            Op::QDesc
        }
        (Op::QDump, None, Some(r)) => {
            params.range = Some(r);
            Op::QWrb
        }
        (_, None, None) => op,
        (_, Some(_), _) => return Err(ParseError::UnknownWord("desc".to_owned())),
        (_, None, Some(_)) => return Err(ParseError::UnknownWord("wrb".to_owned())),
    };

    let st_c2h = QueueFlags::MODE_ST | QueueFlags::DIR_C2H;
    if op == Op::QAdd && params.flags.contains(st_c2h) && params.wrb_desc_size.is_none() {
        params.wrb_desc_size = Some(WRBSZ_DEFAULT);
    }
    Ok((op, params))
}

fn bad_value(param: &'static str, value: &str) -> ParseError {
    ParseError::BadValue {
        param,
        value: value.to_owned(),
    }
}

fn range(words: &mut Words<'_>, what: &'static str) -> Result<(u32, u32)> {
    let start = words.int(what)?;
    let end = words.int(what)?;
    if end < start {
        return Err(ParseError::BadRange { start, end });
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> Result<Command> {
        parse(&line.split_whitespace().collect::<Vec<_>>())
    }

    #[test]
    fn test_parse_int_bases() {
        assert_eq!(parse_int("42"), Ok(42));
        assert_eq!(parse_int("0x204"), Ok(0x204));
        assert_eq!(parse_int("010"), Ok(8));
        assert_eq!(parse_int("0"), Ok(0));
        assert!(parse_int("12k").is_err());
        assert!(parse_int("0x").is_err());
        assert!(parse_int("-1").is_err());
    }

    #[test]
    fn test_target_names() {
        assert_eq!(Target::parse("qdma3"), Ok(Target { vf: false, idx: 3 }));
        assert_eq!(Target::parse("qdmavf12"), Ok(Target { vf: true, idx: 12 }));
        assert!(Target::parse("qdma").is_err());
        assert!(Target::parse("qdmax1").is_err());
        assert!(Target::parse("nvme0").is_err());
        assert!(Target::parse("qdma123456").is_err());
        assert_eq!(Target { vf: true, idx: 2 }.to_string(), "qdmavf2");
    }

    #[test]
    fn test_queue_defaults() {
        let Command::Queue { op, params, .. } = parse_line("qdma0 q add idx 5").unwrap() else {
            panic!("not a queue command");
        };
        assert_eq!(op, Op::QAdd);
        assert_eq!(params.qidx, 5);
        assert_eq!(params.flags, QueueFlags::MODE_MM | QueueFlags::DIR_H2C);
        assert_eq!(params.wrb_desc_size, None);
    }

    #[test]
    fn test_st_c2h_add_gets_wrbsz() {
        let Command::Queue { params, .. } =
            parse_line("qdma0 q add idx 3 mode st dir c2h cdev 1").unwrap()
        else {
            panic!("not a queue command");
        };
        assert_eq!(
            params.flags,
            QueueFlags::MODE_ST | QueueFlags::DIR_C2H | QueueFlags::CDEV
        );
        assert_eq!(params.wrb_desc_size, Some(3));

        let Command::Queue { params, .. } =
            parse_line("qdma0 q add idx 3 mode st dir c2h wrbsz 1").unwrap()
        else {
            panic!("not a queue command");
        };
        assert_eq!(params.wrb_desc_size, Some(1));
    }

    #[test]
    fn test_dump_ranges() {
        let Command::Queue { op, params, .. } =
            parse_line("qdmavf1 q dump idx 2 dir c2h desc 0 15").unwrap()
        else {
            panic!("not a queue command");
        };
        assert_eq!(op, Op::QDesc);
        assert_eq!(params.range, Some((0, 15)));

        let Command::Queue { op, .. } = parse_line("qdma1 q dump idx 2 wrb 4 4").unwrap() else {
            panic!("not a queue command");
        };
        assert_eq!(op, Op::QWrb);

        assert_eq!(
            parse_line("qdma1 q dump idx 2 desc 0 1 wrb 0 1"),
            Err(ParseError::Conflict("dump wrb/desc"))
        );
        assert_eq!(
            parse_line("qdma1 q dump idx 2 desc 9 1"),
            Err(ParseError::BadRange { start: 9, end: 1 })
        );
        assert!(parse_line("qdma1 q del idx 2 desc 0 1").is_err());
    }

    #[test]
    fn test_queue_errors() {
        assert_eq!(
            parse_line("qdma0 q start dir c2h"),
            Err(ParseError::MissingParam("idx"))
        );
        assert_eq!(
            parse_line("qdma0 q add idx 1 mode xx"),
            Err(bad_value("mode", "xx"))
        );
        assert_eq!(parse_line("qdma0 q add idx 1 cdev 2"), Err(bad_value("cdev", "2")));
        assert_eq!(parse_line("qdma0 q add idx 1 wrbsz 4"), Err(bad_value("wrbsz", "4")));
        assert_eq!(
            parse_line("qdma0 q add idx"),
            Err(ParseError::MissingValue("idx"))
        );
        assert_eq!(
            parse_line("qdma0 q frob"),
            Err(ParseError::UnknownWord("frob".to_owned()))
        );
    }

    #[test]
    fn test_reg_commands() {
        assert_eq!(
            parse_line("qdma0 reg read 0x204"),
            Ok(Command::Reg(
                Target { vf: false, idx: 0 },
                RegCmd::Read { bar: None, addr: 0x204 }
            ))
        );
        assert_eq!(
            parse_line("qdma0 reg write bar 2 0x60 0x1"),
            Ok(Command::Reg(
                Target { vf: false, idx: 0 },
                RegCmd::Write {
                    bar: Some(2),
                    addr: 0x60,
                    val: 1
                }
            ))
        );
        assert_eq!(
            parse_line("qdma0 reg dump"),
            Ok(Command::Reg(Target { vf: false, idx: 0 }, RegCmd::Dump))
        );
        assert!(parse_line("qdma0 reg write 0x60").is_err());
        assert!(parse_line("qdma0 reg read bar 300 0x0").is_err());
    }

    #[test]
    fn test_top_level() {
        assert_eq!(parse_line("dev list"), Ok(Command::DevList));
        assert_eq!(
            parse_line("qdma4"),
            Ok(Command::DevInfo(Target { vf: false, idx: 4 }))
        );
        assert_eq!(parse_line("--help"), Ok(Command::Help));
        assert_eq!(parse_line(""), Err(ParseError::Empty));
        assert_eq!(
            parse_line("dev list now"),
            Err(ParseError::UnknownWord("now".to_owned()))
        );
        assert_eq!(
            parse_line("qdma0 nope"),
            Err(ParseError::UnknownWord("nope".to_owned()))
        );
    }

    #[test]
    fn test_request_attrs() {
        let params = QueueParams {
            qidx: 3,
            flags: QueueFlags::MODE_ST | QueueFlags::DIR_C2H,
            wrb_desc_size: Some(3),
            ..QueueParams::default()
        };
        let attrs = params.attrs(Op::QAdd, 1);
        assert_eq!(attrs.u32(AttrType::DevIdx), Some(1));
        assert_eq!(attrs.u32(AttrType::QIdx), Some(3));
        assert_eq!(attrs.u32(AttrType::QFlag), Some(0x9));
        assert_eq!(attrs.u32(AttrType::QRngSz), Some(0));
        assert_eq!(attrs.u32(AttrType::WrbDescSize), Some(3));

        let attrs = params.attrs(Op::QList, 1);
        assert_eq!(attrs.len(), 1);
    }
}
