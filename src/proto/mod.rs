pub mod codec;
pub mod command;
pub mod response;

pub use codec::{read_command_line, LineOutcome, MAX_COMMAND_LINE};
pub use command::{parse_command, Command, ParseError};
pub use response::{Reply, ResponseCode};
