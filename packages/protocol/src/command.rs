//! AT command line tokenizer.
//!
//! A line is parsed completely before anything runs: one bad token rejects
//! the whole line. Every [`Command`] prints back in canonical form, so
//! `parse(format!("AT{}", ..))` of the printed tokens yields the same tokens.

use std::fmt;

use crate::error::ModemError;

/// Where a dial command goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// `D`, `DT`, `DP`: phonebook lookup by digits. `method` is `T` or `P`.
    Number { method: Option<char>, digits: String },
    /// `DH host[:port]`: Telnet.
    Host(String),
    /// `DE host|user|pass`: SSH with password auth.
    Ssh {
        host: String,
        username: String,
        password: String,
    },
    /// `DL`: redial.
    Last,
    /// `DSn`: stored phonebook slot.
    Stored(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub target: DialTarget,
    /// Trailing `;`: connect but stay in command mode.
    pub stay_in_command: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `A`
    Answer,
    /// `En`
    Echo(bool),
    /// `H0` hangs up, `H1` picks up.
    Hook(bool),
    /// `Qn`
    Quiet(bool),
    /// `Vn`
    Verbose(bool),
    /// `Zn`
    Reset(u8),
    /// `Mn`
    SpeakerMode(u8),
    /// `Wn`
    NegotiationReport(u8),
    /// `Ln`
    SpeakerVolume(u8),
    /// `Xn`
    ResultLevel(u8),
    /// `In`
    Info(u8),
    /// `Yn`
    LongSpaceDisconnect(bool),
    /// `Cn`
    CarrierEnabled(bool),
    /// `Nn`
    AutoMode(u8),
    /// `Bn`
    ProtocolMode(u8),
    /// `O`
    Online,
    /// `S?`
    RegisterCurrent,
    /// `Sn`
    RegisterSelect(u8),
    /// `Sn?`
    RegisterRead(u8),
    /// `Sn=v`. The value is range checked when it is written.
    RegisterWrite(u8, u32),
    Dial(Dial),
    /// `*`
    Debug,
    /// `*?`
    DebugHelp,
    /// `*n?`
    DebugRead(u8),
    /// `*n=v`
    DebugWrite(u8, u32),
    /// `&V0`
    ViewConfig,
    /// `&Cn`
    DcdPolicy(u8),
    /// `&Dn`
    DtrAction(u8),
    /// `&F0`
    FactoryReset,
    /// `&Sn`
    DsrPolicy(u8),
    /// `&Wn`
    StoreProfile(u8),
    /// `&Yn`
    PowerUpProfile(u8),
    /// `&Zn=phone|host|proto|user|pass`, case preserved.
    PhonebookSet { slot: u32, record: String },
    /// `&Zn=D` or `&ZnD`
    PhonebookDelete(u32),
    /// `&Zn?`
    PhonebookShow(u32),
}

fn flag(b: bool) -> u8 {
    u8::from(b)
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Answer => write!(f, "A"),
            Command::Echo(v) => write!(f, "E{}", flag(*v)),
            Command::Hook(v) => write!(f, "H{}", flag(*v)),
            Command::Quiet(v) => write!(f, "Q{}", flag(*v)),
            Command::Verbose(v) => write!(f, "V{}", flag(*v)),
            Command::Reset(n) => write!(f, "Z{n}"),
            Command::SpeakerMode(n) => write!(f, "M{n}"),
            Command::NegotiationReport(n) => write!(f, "W{n}"),
            Command::SpeakerVolume(n) => write!(f, "L{n}"),
            Command::ResultLevel(n) => write!(f, "X{n}"),
            Command::Info(n) => write!(f, "I{n}"),
            Command::LongSpaceDisconnect(v) => write!(f, "Y{}", flag(*v)),
            Command::CarrierEnabled(v) => write!(f, "C{}", flag(*v)),
            Command::AutoMode(n) => write!(f, "N{n}"),
            Command::ProtocolMode(n) => write!(f, "B{n}"),
            Command::Online => write!(f, "O"),
            Command::RegisterCurrent => write!(f, "S?"),
            Command::RegisterSelect(n) => write!(f, "S{n}"),
            Command::RegisterRead(n) => write!(f, "S{n}?"),
            Command::RegisterWrite(n, v) => write!(f, "S{n}={v}"),
            Command::Dial(dial) => {
                write!(f, "D")?;
                match &dial.target {
                    DialTarget::Number { method, digits } => {
                        if let Some(m) = method {
                            write!(f, "{m}")?;
                        }
                        write!(f, "{digits}")?;
                    }
                    DialTarget::Host(host) => write!(f, "H{host}")?,
                    DialTarget::Ssh {
                        host,
                        username,
                        password,
                    } => write!(f, "E{host}|{username}|{password}")?,
                    DialTarget::Last => write!(f, "L")?,
                    DialTarget::Stored(slot) => write!(f, "S{slot}")?,
                }
                if dial.stay_in_command {
                    write!(f, ";")?;
                }
                Ok(())
            }
            Command::Debug => write!(f, "*"),
            Command::DebugHelp => write!(f, "*?"),
            Command::DebugRead(n) => write!(f, "*{n}?"),
            Command::DebugWrite(n, v) => write!(f, "*{n}={v}"),
            Command::ViewConfig => write!(f, "&V0"),
            Command::DcdPolicy(n) => write!(f, "&C{n}"),
            Command::DtrAction(n) => write!(f, "&D{n}"),
            Command::FactoryReset => write!(f, "&F0"),
            Command::DsrPolicy(n) => write!(f, "&S{n}"),
            Command::StoreProfile(n) => write!(f, "&W{n}"),
            Command::PowerUpProfile(n) => write!(f, "&Y{n}"),
            Command::PhonebookSet { slot, record } => write!(f, "&Z{slot}={record}"),
            Command::PhonebookDelete(slot) => write!(f, "&Z{slot}D"),
            Command::PhonebookShow(slot) => write!(f, "&Z{slot}?"),
        }
    }
}

/// Characters a dial digit span may contain.
fn is_dial_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, ',' | ';' | '@' | '!' | 'W' | '*' | '#' | 'A'..='D')
}

struct Cursor<'a> {
    chars: Vec<char>,
    pos: usize,
    line: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            chars: line.chars().collect(),
            pos: 0,
            line,
        }
    }

    fn skip_blanks(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_blanks();
        self.chars.get(self.pos).map(|c| c.to_ascii_uppercase())
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, wanted: char) -> bool {
        if self.peek() == Some(wanted) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, what: impl fmt::Display) -> ModemError {
        ModemError::parse(format!("{what} at column {} of '{}'", self.pos, self.line))
    }

    /// Decimal integer; `None` when no digit follows.
    fn number(&mut self) -> Result<Option<u32>, ModemError> {
        self.skip_blanks();
        let start = self.pos;
        while self.chars.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map(Some)
            .map_err(|_| self.error(format_args!("number '{text}' too large")))
    }

    /// Single-letter argument, defaulting to 0, bounded by `max`.
    fn arg(&mut self, letter: char, max: u8) -> Result<u8, ModemError> {
        let value = self.number()?.unwrap_or(0);
        if value > u32::from(max) {
            return Err(ModemError::unsupported(format!("{letter}{value}")));
        }
        Ok(value as u8)
    }

    fn bool_arg(&mut self, letter: char) -> Result<bool, ModemError> {
        Ok(self.arg(letter, 1)? == 1)
    }

    fn register_index(&mut self) -> Result<Option<u8>, ModemError> {
        match self.number()? {
            None => Ok(None),
            Some(n) => u8::try_from(n)
                .map(Some)
                .map_err(|_| ModemError::unsupported(format!("register {n}"))),
        }
    }

    /// The rest of the line, untrimmed and case preserved.
    fn rest(&mut self) -> String {
        let rest: String = self.chars[self.pos..].iter().collect();
        self.pos = self.chars.len();
        rest
    }
}

/// Strip a trailing `;` from a rest-of-line payload.
fn split_stay(payload: &str) -> (String, bool) {
    let trimmed = payload.trim();
    match trimmed.strip_suffix(';') {
        Some(body) => (body.trim_end().to_string(), true),
        None => (trimmed.to_string(), false),
    }
}

/// Parse one command line into tokens.
///
/// The line must start with `AT` in any case. A bare `AT` gives no tokens.
pub fn parse(line: &str) -> Result<Vec<Command>, ModemError> {
    let mut cur = Cursor::new(line);
    if !(cur.eat('A') && cur.eat('T')) {
        return Err(ModemError::parse(format!("'{line}' does not start with AT")));
    }

    let mut commands = Vec::new();
    while let Some(c) = cur.next() {
        let command = match c {
            'A' => Command::Answer,
            'E' => Command::Echo(cur.bool_arg(c)?),
            'H' => Command::Hook(cur.bool_arg(c)?),
            'Q' => Command::Quiet(cur.bool_arg(c)?),
            'V' => Command::Verbose(cur.bool_arg(c)?),
            'Z' => Command::Reset(cur.arg(c, 1)?),
            'M' => Command::SpeakerMode(cur.arg(c, 2)?),
            'W' => Command::NegotiationReport(cur.arg(c, 2)?),
            'L' => Command::SpeakerVolume(cur.arg(c, 3)?),
            'X' => Command::ResultLevel(cur.arg(c, 7)?),
            'I' => Command::Info(cur.arg(c, 5)?),
            'Y' => Command::LongSpaceDisconnect(cur.bool_arg(c)?),
            'C' => Command::CarrierEnabled(cur.bool_arg(c)?),
            'N' => Command::AutoMode(cur.arg(c, 5)?),
            'B' => Command::ProtocolMode(cur.arg(c, 5)?),
            'O' => Command::Online,
            'S' => parse_register(&mut cur)?,
            'D' => Command::Dial(parse_dial(&mut cur)?),
            '*' => parse_debug(&mut cur)?,
            '&' => parse_ampersand(&mut cur)?,
            other => return Err(cur.error(format_args!("unknown command '{other}'"))),
        };
        commands.push(command);
    }
    Ok(commands)
}

fn parse_register(cur: &mut Cursor) -> Result<Command, ModemError> {
    if cur.eat('?') {
        return Ok(Command::RegisterCurrent);
    }
    let index = cur.register_index()?.unwrap_or(0);
    if cur.eat('?') {
        return Ok(Command::RegisterRead(index));
    }
    if cur.eat('=') {
        let value = cur.number()?.unwrap_or(0);
        return Ok(Command::RegisterWrite(index, value));
    }
    Ok(Command::RegisterSelect(index))
}

fn parse_debug(cur: &mut Cursor) -> Result<Command, ModemError> {
    if cur.eat('?') {
        return Ok(Command::DebugHelp);
    }
    let Some(index) = cur.register_index()? else {
        return Ok(Command::Debug);
    };
    if cur.eat('?') {
        return Ok(Command::DebugRead(index));
    }
    if cur.eat('=') {
        let Some(value) = cur.number()? else {
            return Err(cur.error("missing debug value"));
        };
        return Ok(Command::DebugWrite(index, value));
    }
    Err(cur.error(format_args!("expected ? or = after *{index}")))
}

fn parse_dial(cur: &mut Cursor) -> Result<Dial, ModemError> {
    let target = match cur.peek() {
        Some('H') => {
            cur.pos += 1;
            let (host, stay) = split_stay(&cur.rest());
            if host.is_empty() {
                return Err(cur.error("missing host"));
            }
            return Ok(Dial {
                target: DialTarget::Host(host),
                stay_in_command: stay,
            });
        }
        Some('E') => {
            cur.pos += 1;
            let (payload, stay) = split_stay(&cur.rest());
            let mut fields = payload.splitn(3, '|');
            let host = fields.next().unwrap_or_default().trim().to_string();
            let username = fields.next().unwrap_or_default().to_string();
            let password = fields.next().unwrap_or_default().to_string();
            if host.is_empty() {
                return Err(cur.error("missing host"));
            }
            return Ok(Dial {
                target: DialTarget::Ssh {
                    host,
                    username,
                    password,
                },
                stay_in_command: stay,
            });
        }
        Some('L') => {
            cur.pos += 1;
            DialTarget::Last
        }
        Some('S') => {
            cur.pos += 1;
            let Some(slot) = cur.number()? else {
                return Err(cur.error("missing stored slot"));
            };
            DialTarget::Stored(slot)
        }
        _ => {
            let method = match cur.peek() {
                Some(m @ ('T' | 'P')) => {
                    cur.pos += 1;
                    Some(m)
                }
                _ => None,
            };
            let mut span = String::new();
            while let Some(c) = cur.peek().filter(|c| is_dial_char(*c)) {
                cur.pos += 1;
                span.push(c);
            }
            let digits = span.trim_end_matches(';');
            let stay = digits.len() != span.len();
            if digits.is_empty() {
                return Err(cur.error("empty dial string"));
            }
            return Ok(Dial {
                target: DialTarget::Number {
                    method,
                    digits: digits.to_string(),
                },
                stay_in_command: stay,
            });
        }
    };
    let stay = cur.eat(';');
    Ok(Dial {
        target,
        stay_in_command: stay,
    })
}

fn parse_ampersand(cur: &mut Cursor) -> Result<Command, ModemError> {
    let Some(c) = cur.next() else {
        return Err(cur.error("'&' without a command"));
    };
    Ok(match c {
        'V' => {
            cur.arg(c, 0)?;
            Command::ViewConfig
        }
        'F' => {
            cur.arg(c, 0)?;
            Command::FactoryReset
        }
        'C' => Command::DcdPolicy(cur.arg(c, 1)?),
        'D' => Command::DtrAction(cur.arg(c, 3)?),
        'S' => Command::DsrPolicy(cur.arg(c, 1)?),
        'W' => Command::StoreProfile(cur.arg(c, 1)?),
        'Y' => Command::PowerUpProfile(cur.arg(c, 1)?),
        'Z' => {
            let Some(slot) = cur.number()? else {
                return Err(cur.error("missing phonebook slot"));
            };
            if cur.eat('?') {
                Command::PhonebookShow(slot)
            } else if cur.eat('D') {
                Command::PhonebookDelete(slot)
            } else if cur.eat('=') {
                let record = cur.rest().trim().to_string();
                if record.eq_ignore_ascii_case("D") {
                    Command::PhonebookDelete(slot)
                } else if record.is_empty() {
                    return Err(cur.error("missing phonebook record"));
                } else {
                    Command::PhonebookSet { slot, record }
                }
            } else {
                return Err(cur.error(format_args!("expected =, ? or D after &Z{slot}")));
            }
        }
        other => return Err(cur.error(format_args!("unknown command '&{other}'"))),
    })
}

/// Canonical form of a token list, with the `AT` prefix.
pub fn render(commands: &[Command]) -> String {
    let mut line = String::from("AT");
    for command in commands {
        line.push_str(&command.to_string());
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn round_trip(line: &str) -> Vec<Command> {
        let tokens = parse(line).unwrap();
        let again = parse(&render(&tokens)).unwrap();
        assert_eq!(tokens, again, "re-parse of {line} via {}", render(&tokens));
        tokens
    }

    #[test]
    fn bare_at_and_prefix() {
        assert_eq!(assert_ok!(parse("AT")), vec![]);
        assert_eq!(assert_ok!(parse("at")), vec![]);
        assert_err!(parse("A"));
        assert_err!(parse("ATT"));
        assert_err!(parse("XYZ"));
    }

    #[test]
    fn single_letters_default_to_zero() {
        assert_eq!(
            round_trip("ATE0Q0V0"),
            vec![Command::Echo(false), Command::Quiet(false), Command::Verbose(false)]
        );
        assert_eq!(round_trip("atev1h"), vec![
            Command::Echo(false),
            Command::Verbose(true),
            Command::Hook(false)
        ]);
        assert_eq!(round_trip("ATX4"), vec![Command::ResultLevel(4)]);
        assert_eq!(round_trip("ATA"), vec![Command::Answer]);
        assert_eq!(round_trip("ATO"), vec![Command::Online]);
        assert_eq!(round_trip("ATI5"), vec![Command::Info(5)]);
    }

    #[test]
    fn out_of_range_letters_are_rejected() {
        assert_err!(parse("ATE2"));
        assert_err!(parse("ATM3"));
        assert_err!(parse("ATL4"));
        assert_err!(parse("ATX8"));
        assert_err!(parse("ATI6"));
        // One bad token rejects the whole line.
        assert_err!(parse("ATE1V1Q5"));
    }

    #[test]
    fn registers() {
        assert_eq!(round_trip("ATS?"), vec![Command::RegisterCurrent]);
        assert_eq!(round_trip("ATS7"), vec![Command::RegisterSelect(7)]);
        assert_eq!(round_trip("ATS0?"), vec![Command::RegisterRead(0)]);
        assert_eq!(round_trip("ATS0=3"), vec![Command::RegisterWrite(0, 3)]);
        // Range is checked on write so the register survives.
        assert_eq!(parse("ATS0=999").unwrap(), vec![Command::RegisterWrite(0, 999)]);
        assert_err!(parse("ATS256=1"));
        assert_eq!(
            round_trip("ATS0=2S30=6"),
            vec![Command::RegisterWrite(0, 2), Command::RegisterWrite(30, 6)]
        );
    }

    #[test]
    fn dial_digit_spans() {
        // '-' ends the span and is not a command.
        assert_err!(parse("ATDT555-1212"));

        assert_eq!(
            round_trip("ATDT5551212"),
            vec![Command::Dial(Dial {
                target: DialTarget::Number {
                    method: Some('T'),
                    digits: "5551212".into()
                },
                stay_in_command: false,
            })]
        );
        assert_eq!(
            round_trip("atd9w,555;h0"),
            vec![
                Command::Dial(Dial {
                    target: DialTarget::Number {
                        method: None,
                        digits: "9W,555".into()
                    },
                    stay_in_command: true,
                }),
                Command::Hook(false),
            ]
        );
        assert_eq!(
            round_trip("ATDP*70#"),
            vec![Command::Dial(Dial {
                target: DialTarget::Number {
                    method: Some('P'),
                    digits: "*70#".into()
                },
                stay_in_command: false,
            })]
        );
        assert_err!(parse("ATD"));
    }

    #[test]
    fn dial_host_forms_keep_case() {
        assert_eq!(
            round_trip("ATDHbbs.Example.test:2323"),
            vec![Command::Dial(Dial {
                target: DialTarget::Host("bbs.Example.test:2323".into()),
                stay_in_command: false,
            })]
        );
        assert_eq!(
            round_trip("ATDEhost.test|Sysop|Pa ss;"),
            vec![Command::Dial(Dial {
                target: DialTarget::Ssh {
                    host: "host.test".into(),
                    username: "Sysop".into(),
                    password: "Pa ss".into(),
                },
                stay_in_command: true,
            })]
        );
        assert_eq!(
            round_trip("ATDS3;"),
            vec![Command::Dial(Dial {
                target: DialTarget::Stored(3),
                stay_in_command: true,
            })]
        );
        assert_eq!(
            round_trip("ATDL"),
            vec![Command::Dial(Dial {
                target: DialTarget::Last,
                stay_in_command: false,
            })]
        );
        assert_err!(parse("ATDH"));
        assert_err!(parse("ATDS"));
    }

    #[test]
    fn debug_commands() {
        assert_eq!(round_trip("AT*"), vec![Command::Debug]);
        assert_eq!(round_trip("AT*?"), vec![Command::DebugHelp]);
        assert_eq!(round_trip("AT*3?"), vec![Command::DebugRead(3)]);
        assert_eq!(round_trip("AT*3=1"), vec![Command::DebugWrite(3, 1)]);
        assert_err!(parse("AT*3"));
    }

    #[test]
    fn ampersand_commands() {
        assert_eq!(
            round_trip("AT&F&C1&D2&S0&W1&Y1&V"),
            vec![
                Command::FactoryReset,
                Command::DcdPolicy(1),
                Command::DtrAction(2),
                Command::DsrPolicy(0),
                Command::StoreProfile(1),
                Command::PowerUpProfile(1),
                Command::ViewConfig,
            ]
        );
        assert_err!(parse("AT&F1"));
        assert_err!(parse("AT&W2"));
        assert_err!(parse("AT&Q"));
    }

    #[test]
    fn phonebook_commands_preserve_case() {
        assert_eq!(
            round_trip("AT&Z2=555-1212|Example.Test|ssh|User|PassWord"),
            vec![Command::PhonebookSet {
                slot: 2,
                record: "555-1212|Example.Test|ssh|User|PassWord".into()
            }]
        );
        assert_eq!(round_trip("AT&Z2=d"), vec![Command::PhonebookDelete(2)]);
        assert_eq!(round_trip("AT&Z2D"), vec![Command::PhonebookDelete(2)]);
        assert_eq!(round_trip("AT&Z2?"), vec![Command::PhonebookShow(2)]);
        assert_err!(parse("AT&Z"));
        assert_err!(parse("AT&Z1="));
    }
}
