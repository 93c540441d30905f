//! POP3 command parsing (RFC 1939, RFC 2449, RFC 6856).

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    /// The password is the remainder of the line: RFC 1939 permits spaces
    /// in the PASS argument.
    Pass(String),
    Apop { user: String, digest: String },
    Auth { mechanism: String, initial: Option<String> },
    Stls,
    Utf8,
    Lang(Option<String>),
    Xpro,
    Capa,
    Quit,
    Stat,
    List(Option<u32>),
    Uidl(Option<u32>),
    Retr(u32),
    Top { msg: u32, lines: u32 },
    Dele(u32),
    Noop,
    Rset,
}

impl Command {
    /// The bare verb, safe to log: never includes arguments, so
    /// credentials cannot leak through here.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::User(_) => "USER",
            Command::Pass(_) => "PASS",
            Command::Apop { .. } => "APOP",
            Command::Auth { .. } => "AUTH",
            Command::Stls => "STLS",
            Command::Utf8 => "UTF8",
            Command::Lang(_) => "LANG",
            Command::Xpro => "XPRO",
            Command::Capa => "CAPA",
            Command::Quit => "QUIT",
            Command::Stat => "STAT",
            Command::List(_) => "LIST",
            Command::Uidl(_) => "UIDL",
            Command::Retr(_) => "RETR",
            Command::Top { .. } => "TOP",
            Command::Dele(_) => "DELE",
            Command::Noop => "NOOP",
            Command::Rset => "RSET",
        }
    }
}

/// Why a line failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownCommand,
    BadArgumentCount,
    BadNumber,
    /// Non-ASCII bytes before UTF8 was negotiated.
    NonAscii,
}

impl ParseError {
    pub fn message(self) -> &'static str {
        match self {
            Self::Empty => "syntax: empty command",
            Self::UnknownCommand => "syntax: unknown command",
            Self::BadArgumentCount => "syntax: wrong number of arguments",
            Self::BadNumber => "syntax: argument must be an unsigned number",
            Self::NonAscii => "command contains non-ASCII characters",
        }
    }
}

/// Parses one command line (terminator already stripped).
///
/// The verb is case-insensitive and must be 3 or 4 ASCII letters. Until
/// the session has negotiated UTF8, any non-ASCII byte is rejected.
pub fn parse_command(line: &str, utf8_enabled: bool) -> Result<Command, ParseError> {
    if !utf8_enabled && !line.is_ascii() {
        return Err(ParseError::NonAscii);
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut tokens = trimmed.split_whitespace();
    let verb = tokens.next().unwrap_or_default();
    if !(3..=4).contains(&verb.len()) || !verb.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ParseError::UnknownCommand);
    }
    let verb = verb.to_ascii_uppercase();
    let args: Vec<&str> = tokens.collect();

    match verb.as_str() {
        "USER" => {
            expect_args(&args, &[1])?;
            Ok(Command::User(args[0].to_string()))
        }
        "PASS" => Ok(Command::Pass(args.join(" "))),
        "APOP" => {
            expect_args(&args, &[2])?;
            Ok(Command::Apop {
                user: args[0].to_string(),
                digest: args[1].to_string(),
            })
        }
        "AUTH" => {
            expect_args(&args, &[1, 2])?;
            Ok(Command::Auth {
                mechanism: args[0].to_ascii_uppercase(),
                initial: args.get(1).map(|s| s.to_string()),
            })
        }
        "STLS" => {
            expect_args(&args, &[0])?;
            Ok(Command::Stls)
        }
        "UTF8" => {
            expect_args(&args, &[0])?;
            Ok(Command::Utf8)
        }
        "LANG" => {
            expect_args(&args, &[0, 1])?;
            Ok(Command::Lang(args.first().map(|s| s.to_string())))
        }
        "XPRO" => {
            expect_args(&args, &[0])?;
            Ok(Command::Xpro)
        }
        "CAPA" => {
            expect_args(&args, &[0])?;
            Ok(Command::Capa)
        }
        "QUIT" => {
            expect_args(&args, &[0])?;
            Ok(Command::Quit)
        }
        "STAT" => {
            expect_args(&args, &[0])?;
            Ok(Command::Stat)
        }
        "LIST" => {
            expect_args(&args, &[0, 1])?;
            Ok(Command::List(parse_optional_number(&args)?))
        }
        "UIDL" => {
            expect_args(&args, &[0, 1])?;
            Ok(Command::Uidl(parse_optional_number(&args)?))
        }
        "RETR" => {
            expect_args(&args, &[1])?;
            Ok(Command::Retr(parse_number(args[0])?))
        }
        "TOP" => {
            expect_args(&args, &[2])?;
            Ok(Command::Top {
                msg: parse_number(args[0])?,
                lines: parse_number(args[1])?,
            })
        }
        "DELE" => {
            expect_args(&args, &[1])?;
            Ok(Command::Dele(parse_number(args[0])?))
        }
        "NOOP" => {
            expect_args(&args, &[0])?;
            Ok(Command::Noop)
        }
        "RSET" => {
            expect_args(&args, &[0])?;
            Ok(Command::Rset)
        }
        _ => Err(ParseError::UnknownCommand),
    }
}

fn expect_args(args: &[&str], accepted: &[usize]) -> Result<(), ParseError> {
    if accepted.contains(&args.len()) {
        Ok(())
    } else {
        Err(ParseError::BadArgumentCount)
    }
}

/// Unsigned decimal with no leading sign; `u32::from_str` alone would
/// accept `+3`.
fn parse_number(arg: &str) -> Result<u32, ParseError> {
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::BadNumber);
    }
    arg.parse().map_err(|_| ParseError::BadNumber)
}

fn parse_optional_number(args: &[&str]) -> Result<Option<u32>, ParseError> {
    args.first().map(|a| parse_number(a)).transpose()
}
