//! The line protocol spoken by the pulser.
//!
//! Every command is one ASCII line and is answered by one line:
//!
//! | command                                   | meaning                                  |
//! |-------------------------------------------|------------------------------------------|
//! | `PAT <channel> <n> <start>,<len> ...`     | replace the pattern of a channel (ticks) |
//! | `RUN 1` / `RUN 0`                         | start / stop the pattern generator       |
//! | `STAT?`                                   | query the number of completed shots      |
//!
//! Replies are `OK`, optionally followed by a payload, or `ERR <code> <message>`. Raw commands
//! are sent unchanged and get the same reply handling.

use std::fmt::Write;
use std::sync::OnceLock;

use regex::Regex;

use pulsecompiler_backend::Ticks;

use crate::error::{DeviceError, Result};

pub const STATUS_QUERY: &str = "STAT?";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    Pattern {
        channel: usize,
        pulses: Vec<(Ticks, Ticks)>,
    },
    Run(bool),
    Status,
    Raw(String),
}

impl DeviceCommand {
    pub fn encode(&self) -> String {
        match self {
            DeviceCommand::Pattern { channel, pulses } => {
                let mut line = format!("PAT {} {}", channel, pulses.len());
                for (start, len) in pulses {
                    // Writing to a String cannot fail
                    let _ = write!(line, " {start},{len}");
                }
                line
            }
            DeviceCommand::Run(running) => format!("RUN {}", u8::from(*running)),
            DeviceCommand::Status => STATUS_QUERY.to_string(),
            DeviceCommand::Raw(command) => command.clone(),
        }
    }
}

fn reply_regex() -> &'static Regex {
    static REPLY: OnceLock<Regex> = OnceLock::new();
    REPLY.get_or_init(|| {
        Regex::new(r"^(?:(?P<ok>OK)(?:\s+(?P<payload>.*))?|ERR\s+(?P<code>-?\d+)\s*(?P<message>.*))$")
            .expect("reply pattern is valid")
    })
}

/// Parses the reply to `command`, returning the payload of an `OK` reply.
pub fn parse_reply(command: &str, reply: &str) -> Result<String> {
    let reply = reply.trim_end_matches(['\r', '\n']);
    let unexpected = || DeviceError::UnexpectedReply {
        command: command.to_string(),
        reply: reply.to_string(),
    };
    let caps = reply_regex().captures(reply).ok_or_else(unexpected)?;
    if caps.name("ok").is_some() {
        return Ok(caps
            .name("payload")
            .map_or_else(String::new, |m| m.as_str().to_string()));
    }
    let code = caps["code"].parse().map_err(|_| unexpected())?;
    Err(DeviceError::Rejected {
        command: command.to_string(),
        code,
        message: caps["message"].to_string(),
    })
}

/// Number of completed shots in the payload of a status reply.
pub fn parse_shot_count(payload: &str) -> Option<u64> {
    payload.split_whitespace().next()?.parse().ok()
}
