//! Minimal telnet option handling.
//!
//! Input is run through a byte-level state machine that removes command
//! sequences from the data stream and records what the client told us in
//! its `Capabilities`. Only window size, terminal type and go-ahead
//! suppression are accepted; every other option is refused.

use shared::Capabilities;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;
const MAX_SUBNEGOTIATION: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Plain input bytes plus anything that must be sent back.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Parsed {
    pub data: Vec<u8>,
    pub replies: Vec<u8>,
}

#[derive(Debug)]
pub struct TelnetParser {
    state: State,
    sub: Vec<u8>,
    asked_naws: bool,
    asked_ttype: bool,
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self {
            state: State::Data,
            sub: Vec::new(),
            asked_naws: false,
            asked_ttype: false,
        }
    }
}

impl TelnetParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening negotiation sent to a freshly accepted client.
    pub fn offer(&mut self) -> Vec<u8> {
        self.asked_naws = true;
        self.asked_ttype = true;
        vec![IAC, DO, OPT_NAWS, IAC, DO, OPT_TTYPE]
    }

    pub fn feed(&mut self, input: &[u8], caps: &mut Capabilities) -> Parsed {
        let mut out = Parsed::default();
        for &byte in input {
            self.state = match (self.state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b) => {
                    out.data.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.data.push(IAC);
                    State::Data
                }
                (State::Iac, SB) => {
                    self.sub.clear();
                    State::Sub
                }
                (State::Iac, verb @ (WILL | WONT | DO | DONT)) => State::Option(verb),
                // NOP, GA, AYT and friends carry no data
                (State::Iac, _) => State::Data,
                (State::Option(verb), option) => {
                    self.negotiate(verb, option, caps, &mut out.replies);
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, b) => {
                    if self.sub.len() < MAX_SUBNEGOTIATION {
                        self.sub.push(b);
                    }
                    State::Sub
                }
                (State::SubIac, SE) => {
                    self.subnegotiation(caps);
                    State::Data
                }
                (State::SubIac, IAC) => {
                    if self.sub.len() < MAX_SUBNEGOTIATION {
                        self.sub.push(IAC);
                    }
                    State::Sub
                }
                (State::SubIac, _) => State::Sub,
            };
        }
        out
    }

    fn negotiate(&mut self, verb: u8, option: u8, caps: &mut Capabilities, replies: &mut Vec<u8>) {
        match (verb, option) {
            (WILL, OPT_NAWS) => {
                if !self.asked_naws {
                    replies.extend_from_slice(&[IAC, DO, OPT_NAWS]);
                    self.asked_naws = true;
                }
                caps.naws = true;
            }
            (WILL, OPT_TTYPE) => {
                if !self.asked_ttype {
                    replies.extend_from_slice(&[IAC, DO, OPT_TTYPE]);
                    self.asked_ttype = true;
                }
                replies.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE]);
            }
            (WILL, other) => replies.extend_from_slice(&[IAC, DONT, other]),
            (WONT, OPT_NAWS) => caps.naws = false,
            (WONT, _) => {}
            (DO, OPT_SGA) => {
                if !caps.suppress_go_ahead {
                    caps.suppress_go_ahead = true;
                    replies.extend_from_slice(&[IAC, WILL, OPT_SGA]);
                }
            }
            (DO, other) => replies.extend_from_slice(&[IAC, WONT, other]),
            (DONT, OPT_SGA) => caps.suppress_go_ahead = false,
            _ => {}
        }
    }

    fn subnegotiation(&mut self, caps: &mut Capabilities) {
        match self.sub.as_slice() {
            [OPT_NAWS, w0, w1, h0, h1] => {
                let width = u16::from_be_bytes([*w0, *w1]);
                let height = u16::from_be_bytes([*h0, *h1]);
                if width > 0 {
                    caps.width = width;
                }
                if height > 0 {
                    caps.height = height;
                }
                caps.naws = true;
            }
            [OPT_TTYPE, TTYPE_IS, name @ ..] if !name.is_empty() => {
                caps.terminal = Some(String::from_utf8_lossy(name).trim().to_string());
            }
            _ => {}
        }
        self.sub.clear();
    }
}

/// Doubles any literal 255 so it is not read as a command.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}
