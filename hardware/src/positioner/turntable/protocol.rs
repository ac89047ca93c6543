//! Framing for the stepper controller's ASCII protocol.
//!
//! Commands are `<axis prefix><opcode>[args]\r`, e.g. `X0RN+3200\r`.
//! Replies are `<x|y|z><address><status>[payload]\r`, e.g. `x0f` or
//! `y0>101600`.

/// Command terminator.
pub const TERMINATOR: u8 = b'\r';

/// Theta axis.
pub const AXIS_X: &str = "X0";
/// Phi axis.
pub const AXIS_Y: &str = "Y0";
/// Auxiliary axis, only addressed by abort.
pub const AXIS_Z: &str = "Z0";

pub const OP_INIT: &str = "IN";
pub const OP_ABSOLUTE_POSITION: &str = "AP";
pub const OP_RUN_CURRENT: &str = "RC";
pub const OP_HOLD_CURRENT: &str = "HC";
pub const OP_DWELL: &str = "DW";
pub const OP_STEP_SUBMODE: &str = "SM";
pub const OP_ENCODER_MODE: &str = "EM";
pub const OP_DIRECTION: &str = "DI";
pub const OP_START_SPEED: &str = "SS";
pub const OP_END_SPEED: &str = "ES";
pub const OP_SLOPE: &str = "SL";
pub const OP_ENCODER_ENABLE: &str = "EE";
pub const OP_RUN_RELATIVE: &str = "RN";
pub const OP_ABORT: &str = "AB";
pub const OP_POSITION: &str = "PX";
/// Empty opcode: status poll.
pub const OP_STATUS: &str = "";

/// Controller status character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `>`: idle, last command accepted
    Ready,
    /// `f`: move finished
    Finished,
    /// `H`: home limit switch
    HomeLimit,
    /// `L`: max limit switch
    MaxLimit,
    /// Anything else: still busy
    Busy(char),
}

impl From<char> for Status {
    fn from(c: char) -> Self {
        match c {
            '>' => Status::Ready,
            'f' => Status::Finished,
            'H' => Status::HomeLimit,
            'L' => Status::MaxLimit,
            other => Status::Busy(other),
        }
    }
}

/// Parsed controller reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub axis: char,
    pub address: char,
    pub status: Status,
    pub payload: String,
}

impl Response {
    /// Payload as a signed integer, if it is one.
    pub fn count(&self) -> Option<i64> {
        let text = self.payload.trim();
        text.strip_prefix('+').unwrap_or(text).parse().ok()
    }
}

/// Frame a command.
pub fn encode(axis: &str, opcode: &str, args: &str) -> String {
    format!("{axis}{opcode}{args}\r")
}

/// Parse one reply line (terminator already stripped).
///
/// Returns `None` for anything that is not a well-formed reply.
pub fn parse_response(line: &[u8]) -> Option<Response> {
    let text = std::str::from_utf8(line).ok()?;
    let text = text.trim_matches(|c: char| c == '\n' || c == '\r' || c == '\0');
    let mut chars = text.chars();

    let axis = chars.next()?;
    if !matches!(axis, 'x' | 'y' | 'z') {
        return None;
    }
    let address = chars.next()?;
    if !address.is_ascii_alphanumeric() {
        return None;
    }
    let status = Status::from(chars.next()?);

    Some(Response {
        axis,
        address,
        status,
        payload: chars.as_str().to_string(),
    })
}

/// Reply axis letter expected for a command prefix.
pub fn reply_axis(prefix: &str) -> Option<char> {
    prefix.chars().next().map(|c| c.to_ascii_lowercase())
}
